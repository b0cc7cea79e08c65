//! Connecting side of a stream (TCP or PIPE) node.
//!
//! The client dials its endpoint, retrying up to `try_reconnect_count` times,
//! and spends the same budget on redialing after an established connection
//! drops. Only a connection that carried traffic refills the budget, so a peer
//! that accepts and hangs up straight away cannot keep the client looping.
//! Messages sent while the connection is down are held in their slots and
//! flushed, in order, once a new connection is up.

use super::base::MqBase;
use super::event_queue::{AfterAction, SlotSignals};
use super::message::{MqEvent, MqId};
use super::stream::{SlotLease, StreamConnection, StreamEvent, StreamSocket};
use super::{MqMachineState, MqTransport};
use crate::defaults;
use crate::error::{MqError, MqResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

type ConnectTask = JoinHandle<io::Result<StreamSocket>>;

enum LoopEvent {
    Exit,
    Signal(usize),
    Connected(io::Result<StreamSocket>),
    Stream(StreamEvent),
    Disconnected,
}

/// Loop side of a CONNECT stream node.
pub struct MqStreamClient {
    base: Arc<MqBase>,
    signals: SlotSignals,
    connection: Option<StreamConnection>,
    connector: Option<ConnectTask>,
    /// Slots that arrived while no connection was up.
    pending: VecDeque<usize>,
    attempts_left: usize,
    next_id: MqId,
    events_tx: mpsc::UnboundedSender<StreamEvent>,
    events_rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl MqStreamClient {
    pub fn new(base: Arc<MqBase>, signals: SlotSignals) -> MqResult<Self> {
        if !base.params().mq_type.is_stream() {
            return Err(MqError::IllegalArgs(format!(
                "stream client cannot serve {} parameters",
                base.params().mq_type
            )));
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let attempts_left = 1 + base.params().try_reconnect_count;
        Ok(Self {
            base,
            signals,
            connection: None,
            connector: None,
            pending: VecDeque::new(),
            attempts_left,
            next_id: 1,
            events_tx,
            events_rx,
        })
    }

    /// Starts a connect attempt, or returns `false` when the budget is spent.
    fn dial(&mut self, delay: bool) -> bool {
        if self.attempts_left == 0 {
            return false;
        }
        self.attempts_left -= 1;

        let params = self.base.params().clone();
        self.connector = Some(tokio::spawn(async move {
            if delay {
                tokio::time::sleep(defaults::RECONNECT_DELAY).await;
            }
            StreamSocket::connect(&params).await
        }));
        true
    }

    fn on_connected(&mut self, socket: StreamSocket) {
        let id = self.next_id;
        self.next_id += 1;

        let endpoint = self.base.params().endpoint();
        info!("Connected to {} (connection {})", endpoint, id);
        self.connection = Some(StreamConnection::spawn(
            self.base.clone(),
            socket,
            id,
            endpoint,
            self.events_tx.clone(),
        ));

        if !self.pending.is_empty() {
            debug!("Flushing {} pending messages", self.pending.len());
        }
        while let Some(index) = self.pending.pop_front() {
            self.write(index);
        }
    }

    fn write(&mut self, index: usize) {
        match &self.connection {
            Some(connection) => {
                for lease in SlotLease::share(&self.base, index, 1) {
                    if !connection.write(lease) {
                        warn!("Connection {} is gone, message dropped", connection.id());
                    }
                }
            }
            None => self.pending.push_back(index),
        }
    }

    /// Handles one slot. Returns `true` when a close was requested.
    fn on_msg(&mut self, index: usize) -> bool {
        let event = self.base.events().slot(index).event;
        let action = match event {
            MqEvent::Close => {
                self.base.restore(index);
                return true;
            }
            MqEvent::Shutdown => {
                if let Some(connection) = &self.connection {
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
                    self.write(index);
                    AfterAction::Delay
                }
            }
        };
        if action == AfterAction::Ready {
            self.base.restore(index);
        }
        false
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

        if let Some(connector) = self.connector.take() {
            connector.abort();
        }
        if let Some(connection) = self.connection.take() {
            debug!(
                "Closing connection {} ({:?})",
                connection.id(),
                connection.request_state()
            );
            connection
                .close(Instant::now() + self.base.params().wait_closing())
                .await;
        }
        while let Some(index) = self.pending.pop_front() {
            self.base.restore(index);
        }
        self.base.finish_closed(&mut self.signals);
    }
}

async fn join_connect(connector: &mut Option<ConnectTask>) -> io::Result<StreamSocket> {
    match connector {
        Some(task) => match task.await {
            Ok(result) => result,
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        },
        None => std::future::pending().await,
    }
}

#[async_trait]
impl MqTransport for MqStreamClient {
    fn name(&self) -> &'static str {
        "stream-client"
    }

    async fn run(&mut self) -> MqResult<()> {
        self.dial(false);

        let result = loop {
            let event = tokio::select! {
                biased;
                _ = self.base.terminated() => LoopEvent::Exit,
                result = join_connect(&mut self.connector) => LoopEvent::Connected(result),
                Some(event) = self.events_rx.recv() => LoopEvent::Stream(event),
                index = self.signals.recv() => match index {
                    Some(index) => LoopEvent::Signal(index),
                    None => LoopEvent::Disconnected,
                },
            };

            match event {
                LoopEvent::Exit | LoopEvent::Disconnected => break Ok(()),
                LoopEvent::Signal(index) => {
                    if self.on_msg(index) {
                        break Ok(());
                    }
                }
                LoopEvent::Connected(Ok(socket)) => {
                    self.connector = None;
                    self.on_connected(socket);
                    if self.base.state() == MqMachineState::Initializing {
                        self.base.set_running();
                    }
                }
                LoopEvent::Connected(Err(e)) => {
                    self.connector = None;
                    warn!(
                        "Connect to {} failed: {} ({} attempts left)",
                        self.base.params().endpoint(),
                        e,
                        self.attempts_left
                    );
                    if !self.dial(true) {
                        break Err(MqError::Io(e));
                    }
                }
                LoopEvent::Stream(StreamEvent { id, error }) => {
                    let current = self.connection.as_ref().map(|c| c.id());
                    if current != Some(id) {
                        continue;
                    }
                    match &error {
                        Some(e) => warn!("Connection {} failed: {}", id, e),
                        None => info!("Connection {} closed by peer", id),
                    }
                    if let Some(connection) = self.connection.take() {
                        if connection.carried_traffic() {
                            self.attempts_left = self.base.params().try_reconnect_count;
                        }
                        connection.close(Instant::now()).await;
                    }
                    if !self.dial(true) {
                        break Err(error.unwrap_or(MqError::Io(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            "connection lost",
                        ))));
                    }
                }
            }
        };

        if let Err(e) = &result {
            error!("Stream client gave up: {}", e);
            if self.base.state() == MqMachineState::Initializing {
                self.base.fail(&mut self.signals);
                return result;
            }
        }
        self.close().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mq::{DefaultInternal, MqParams};
    use std::time::Duration;

    /// Accepts `count` connections and hangs up on each without a word. The
    /// listener is handed back so later dials still connect.
    async fn hang_up(listener: tokio::net::TcpListener, count: usize) -> tokio::net::TcpListener {
        for _ in 0..count {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        }
        listener
    }

    async fn run_against_hang_ups(try_reconnect_count: usize, hang_ups: usize) -> Arc<MqBase> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let params = MqParams {
            try_reconnect_count,
            ..MqParams::tcp("127.0.0.1", port)
        };
        let (base, signals) = MqBase::new(params, Arc::new(DefaultInternal)).unwrap();
        let mut client = MqStreamClient::new(base.clone(), signals).unwrap();

        let (result, _listener) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(client.run(), hang_up(listener, hang_ups))
        })
        .await
        .expect("client kept reconnecting");
        assert!(result.is_err());
        base
    }

    #[tokio::test]
    async fn test_connect_failure_exhausts_attempts() {
        // Reserve a port and release it so nothing listens there.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let params = MqParams {
            try_reconnect_count: 1,
            ..MqParams::tcp("127.0.0.1", port)
        };
        let (base, signals) = MqBase::new(params, Arc::new(DefaultInternal)).unwrap();
        let mut client = MqStreamClient::new(base.clone(), signals).unwrap();

        let started = Instant::now();
        assert!(matches!(client.run().await, Err(MqError::Io(_))));
        assert!(started.elapsed() >= defaults::RECONNECT_DELAY);
        assert_eq!(base.state(), MqMachineState::Error);
    }

    #[tokio::test]
    async fn test_zero_budget_closes_after_drop() {
        let base = run_against_hang_ups(0, 1).await;
        assert!(base.was_activated());
        assert_eq!(base.state(), MqMachineState::Closed);
    }

    #[tokio::test]
    async fn test_silent_connections_do_not_refill_budget() {
        let started = Instant::now();
        let base = run_against_hang_ups(1, 2).await;
        assert!(started.elapsed() >= defaults::RECONNECT_DELAY);
        assert_eq!(base.state(), MqMachineState::Closed);
    }

    #[test]
    fn test_rejects_local_params() {
        let (base, signals) =
            MqBase::new(MqParams::local("x"), Arc::new(DefaultInternal)).unwrap();
        assert!(matches!(
            MqStreamClient::new(base, signals),
            Err(MqError::IllegalArgs(_))
        ));
    }
}
