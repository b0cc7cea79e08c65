//! Bound side of a stream (TCP or PIPE) node.
//!
//! Accepted peers get ids counting up from 1. A message whose id is
//! [`BROADCAST_ID`] goes to every peer, any other id to that peer only.

use super::base::MqBase;
use super::event_queue::{AfterAction, SlotSignals};
use super::message::{MqEvent, MqId, BROADCAST_ID};
use super::stream::{SlotLease, StreamConnection, StreamEvent, StreamListener, StreamSocket};
use super::MqTransport;
use crate::error::{MqError, MqResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

enum LoopEvent {
    Exit,
    Signal(usize),
    Accepted(io::Result<(StreamSocket, String)>),
    Stream(StreamEvent),
    Retired,
    Disconnected,
}

/// Loop side of a BIND stream node.
pub struct MqStreamServer {
    base: Arc<MqBase>,
    signals: SlotSignals,
    connections: BTreeMap<MqId, StreamConnection>,
    /// Connections dropped by their peer, still draining.
    retiring: JoinSet<()>,
    next_id: MqId,
    events_tx: mpsc::UnboundedSender<StreamEvent>,
    events_rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl MqStreamServer {
    pub fn new(base: Arc<MqBase>, signals: SlotSignals) -> MqResult<Self> {
        if !base.params().mq_type.is_stream() {
            return Err(MqError::IllegalArgs(format!(
                "stream server cannot serve {} parameters",
                base.params().mq_type
            )));
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            base,
            signals,
            connections: BTreeMap::new(),
            retiring: JoinSet::new(),
            next_id: BROADCAST_ID + 1,
            events_tx,
            events_rx,
        })
    }

    fn on_accept(&mut self, socket: StreamSocket, peer: String) {
        if self.connections.len() >= self.base.params().max_nodes {
            warn!(
                "Rejecting {}: node limit {} reached",
                peer,
                self.base.params().max_nodes
            );
            return;
        }
        if !self.base.internal().on_accept(&peer) {
            info!("Connection from {} rejected by accept callback", peer);
            return;
        }

        let id = self.next_id;
        self.next_id += 1;
        info!("Accepted {} as node {}", peer, id);
        let connection =
            StreamConnection::spawn(self.base.clone(), socket, id, peer, self.events_tx.clone());
        self.connections.insert(id, connection);
    }

    fn on_stream_event(&mut self, event: StreamEvent) {
        let Some(connection) = self.connections.remove(&event.id) else {
            return;
        };
        match &event.error {
            Some(e) => warn!("Node {} ({}) failed: {}", event.id, connection.peer(), e),
            None => info!("Node {} ({}) disconnected", event.id, connection.peer()),
        }
        let deadline = Instant::now() + self.base.params().wait_closing();
        self.retiring.spawn(connection.close(deadline));
    }

    /// Handles one slot. Returns `true` when a close was requested.
    fn on_msg(&mut self, index: usize) -> bool {
        let (event, id) = {
            let msg = self.base.events().slot(index);
            (msg.event, msg.id)
        };

        let action = match event {
            MqEvent::Close => {
                self.base.restore(index);
                return true;
            }
            MqEvent::Shutdown => {
                for connection in self.connections.values() {
                    connection.shutdown();
                }
                AfterAction::Ready
            }
            _ => {
                let consumed = {
                    let mut msg = self.base.events().slot(index);
                    self.base.internal().on_write(&mut msg)
                };
                if consumed {
                    AfterAction::Ready
                } else {
                    self.dispatch(index, id)
                }
            }
        };
        if action == AfterAction::Ready {
            self.base.restore(index);
        }
        false
    }

    fn dispatch(&self, index: usize, id: MqId) -> AfterAction {
        let targets: Vec<&StreamConnection> = if id == BROADCAST_ID {
            self.connections.values().collect()
        } else {
            self.connections.get(&id).into_iter().collect()
        };

        if targets.is_empty() {
            if id == BROADCAST_ID {
                debug!("No nodes connected, broadcast dropped");
            } else {
                warn!("Unknown node {}, message dropped", id);
            }
            return AfterAction::Ready;
        }

        let leases = SlotLease::share(&self.base, index, targets.len());
        for (connection, lease) in targets.into_iter().zip(leases) {
            if !connection.write(lease) {
                warn!("Node {} is gone, message dropped", connection.id());
            }
        }
        AfterAction::Delay
    }

    async fn close(&mut self) {
        if !self.base.begin_closing() {
            return;
        }
        while let Ok(index) = self.signals.try_recv() {
            if self.on_msg(index) {
                debug!("Ignoring repeated close request");
            }
        }

        let deadline = Instant::now() + self.base.params().wait_closing();
        let connections = std::mem::take(&mut self.connections);
        for (id, connection) in connections {
            debug!("Closing node {} ({:?})", id, connection.request_state());
            self.retiring.spawn(connection.close(deadline));
        }
        while self.retiring.join_next().await.is_some() {}

        self.base.finish_closed(&mut self.signals);
    }
}

async fn join_retired(retiring: &mut JoinSet<()>) {
    if retiring.join_next().await.is_none() {
        std::future::pending::<()>().await;
    }
}

#[async_trait]
impl MqTransport for MqStreamServer {
    fn name(&self) -> &'static str {
        "stream-server"
    }

    async fn run(&mut self) -> MqResult<()> {
        let listener = match StreamListener::bind(self.base.params()) {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind {}: {}", self.base.params().endpoint(), e);
                self.base.fail(&mut self.signals);
                return Err(MqError::Io(e));
            }
        };
        if let Some(addr) = listener.local_addr() {
            self.base.set_local_addr(addr);
        }
        info!("Listening on {}", self.base.params().endpoint());
        self.base.set_running();

        loop {
            let event = tokio::select! {
                biased;
                _ = self.base.terminated() => LoopEvent::Exit,
                Some(event) = self.events_rx.recv() => LoopEvent::Stream(event),
                index = self.signals.recv() => match index {
                    Some(index) => LoopEvent::Signal(index),
                    None => LoopEvent::Disconnected,
                },
                accepted = listener.accept() => LoopEvent::Accepted(accepted),
                _ = join_retired(&mut self.retiring) => LoopEvent::Retired,
            };

            match event {
                LoopEvent::Exit | LoopEvent::Disconnected => break,
                LoopEvent::Signal(index) => {
                    if self.on_msg(index) {
                        break;
                    }
                }
                LoopEvent::Accepted(Ok((socket, peer))) => self.on_accept(socket, peer),
                LoopEvent::Accepted(Err(e)) => warn!("Accept failed: {}", e),
                LoopEvent::Stream(event) => self.on_stream_event(event),
                LoopEvent::Retired => {}
            }
        }

        drop(listener);
        self.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mq::{DefaultInternal, MqMachineState, MqParams};

    #[tokio::test]
    async fn test_bind_failure_enters_error_state() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();

        let (base, signals) =
            MqBase::new(MqParams::tcp("127.0.0.1", port), Arc::new(DefaultInternal)).unwrap();
        let mut server = MqStreamServer::new(base.clone(), signals).unwrap();
        assert!(matches!(server.run().await, Err(MqError::Io(_))));
        assert_eq!(base.state(), MqMachineState::Error);
    }

    #[tokio::test]
    async fn test_exit_closes_listening_server() {
        let (base, signals) =
            MqBase::new(MqParams::tcp("127.0.0.1", 0), Arc::new(DefaultInternal)).unwrap();
        let mut server = MqStreamServer::new(base.clone(), signals).unwrap();

        let handle = tokio::spawn(async move { server.run().await });
        while base.state() == MqMachineState::Initializing {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        assert!(base.local_addr().is_some());
        base.exit().unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(base.state(), MqMachineState::Closed);
    }
}
