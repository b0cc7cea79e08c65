//! In-process transport: messages sent on a node come back out of the same
//! node's receive side, in send order.

use super::base::MqBase;
use super::event_queue::{AfterAction, SlotSignals};
use super::message::MqEvent;
use super::params::MqType;
use super::MqTransport;
use crate::error::{MqError, MqResult};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

enum LoopEvent {
    Exit,
    Signal(usize),
    Disconnected,
}

/// Loop side of a LOCAL node.
pub struct MqLocalQueue {
    base: Arc<MqBase>,
    signals: SlotSignals,
}

impl MqLocalQueue {
    pub fn new(base: Arc<MqBase>, signals: SlotSignals) -> MqResult<Self> {
        if base.params().mq_type != MqType::Local {
            return Err(MqError::IllegalArgs(format!(
                "local queue cannot serve {} parameters",
                base.params().mq_type
            )));
        }
        Ok(Self { base, signals })
    }

    /// Handles one slot. Returns the control event it carried, if any.
    fn on_msg(&self, index: usize) -> (AfterAction, Option<MqEvent>) {
        let mut msg = self.base.events().slot(index);
        match msg.event {
            MqEvent::Close | MqEvent::Shutdown => (AfterAction::Ready, Some(msg.event)),
            _ => {
                if self.base.internal().on_write(&mut msg) {
                    if self.base.params().verbose {
                        debug!("Local message consumed by write callback");
                    }
                } else {
                    self.base.deliver(&msg);
                }
                (AfterAction::Ready, None)
            }
        }
    }

    fn close(&mut self) {
        if !self.base.begin_closing() {
            return;
        }
        // Sends that made it in before CLOSING are still delivered.
        while let Ok(index) = self.signals.try_recv() {
            let (action, _) = self.on_msg(index);
            if action == AfterAction::Ready {
                self.base.restore(index);
            }
        }
        self.base.finish_closed(&mut self.signals);
    }
}

#[async_trait]
impl MqTransport for MqLocalQueue {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn run(&mut self) -> MqResult<()> {
        self.base.set_running();

        loop {
            let event = tokio::select! {
                biased;
                _ = self.base.terminated() => LoopEvent::Exit,
                index = self.signals.recv() => match index {
                    Some(index) => LoopEvent::Signal(index),
                    None => LoopEvent::Disconnected,
                },
            };

            match event {
                LoopEvent::Signal(index) => {
                    let (action, control) = self.on_msg(index);
                    if action == AfterAction::Ready {
                        self.base.restore(index);
                    }
                    if let Some(control) = control {
                        debug!("Local queue received {:?}", control);
                        break;
                    }
                }
                LoopEvent::Exit | LoopEvent::Disconnected => break,
            }
        }

        self.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mq::{DefaultInternal, MqMachineState, MqMsg, MqParams};

    #[test]
    fn test_rejects_stream_params() {
        let (base, signals) =
            MqBase::new(MqParams::tcp("127.0.0.1", 1), Arc::new(DefaultInternal)).unwrap();
        assert!(matches!(
            MqLocalQueue::new(base, signals),
            Err(MqError::IllegalArgs(_))
        ));
    }

    #[tokio::test]
    async fn test_loopback_until_close() {
        let (base, signals) =
            MqBase::new(MqParams::local("loop"), Arc::new(DefaultInternal)).unwrap();
        let mut queue = MqLocalQueue::new(base.clone(), signals).unwrap();

        let producer = {
            let base = base.clone();
            tokio::task::spawn_blocking(move || {
                base.wait_enable(Some(std::time::Duration::from_secs(5))).unwrap();
                base.send(&MqMsg::from("one")).unwrap();
                base.send(&MqMsg::from("two")).unwrap();
                base.send_close().unwrap();
            })
        };

        queue.run().await.unwrap();
        producer.await.unwrap();
        assert_eq!(base.state(), MqMachineState::Closed);

        let mut msg = MqMsg::default();
        base.recv(&mut msg).unwrap();
        assert_eq!(msg.as_str(), Some("one"));
        base.recv(&mut msg).unwrap();
        assert_eq!(msg.as_str(), Some("two"));
        assert_eq!(base.events().ready_len(), base.events().size());
    }
}
