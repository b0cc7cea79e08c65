//! Public handle of a message queue node.
//!
//! A node owns one transport and runs it on a private single-threaded tokio
//! runtime living on a dedicated thread. Every method of [`MqNode`] is safe to
//! call from any thread; receiving and sending never touch the loop thread
//! directly but go through the slot pool and the receive queue.

use crate::error::{MqError, MqResult};
use crate::mq::{
    convert_uri_to_params, MqBase, MqEvent, MqId, MqInternal, MqLocalQueue, MqMachineState,
    MqMode, MqMsg, MqParams, MqStreamClient, MqStreamServer, MqTransport, MqType, BROADCAST_ID,
};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Interval at which the constructor polls the machine state.
const ACTIVATION_POLL: Duration = Duration::from_millis(1);

pub type AcceptCallback = Box<dyn Fn(&str) -> bool + Send + Sync>;
pub type WriteCallback = Box<dyn Fn(&mut MqMsg) -> bool + Send + Sync>;
pub type RecvCallback = Box<dyn Fn(&MqMsg) -> bool + Send + Sync>;

/// Optional closures run on the loop thread.
///
/// - `accept_cb`: `false` rejects an incoming peer.
/// - `write_cb`: `true` consumes an outgoing message before it is written.
/// - `recv_cb`: `true` consumes an incoming message; otherwise it is queued
///   for [`MqNode::recv`].
#[derive(Default)]
pub struct Callbacks {
    pub accept_cb: Option<AcceptCallback>,
    pub write_cb: Option<WriteCallback>,
    pub recv_cb: Option<RecvCallback>,
}

impl Callbacks {
    pub fn with_accept_cb<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.accept_cb = Some(Box::new(f));
        self
    }

    pub fn with_write_cb<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut MqMsg) -> bool + Send + Sync + 'static,
    {
        self.write_cb = Some(Box::new(f));
        self
    }

    pub fn with_recv_cb<F>(mut self, f: F) -> Self
    where
        F: Fn(&MqMsg) -> bool + Send + Sync + 'static,
    {
        self.recv_cb = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("accept_cb", &self.accept_cb.is_some())
            .field("write_cb", &self.write_cb.is_some())
            .field("recv_cb", &self.recv_cb.is_some())
            .finish()
    }
}

impl MqInternal for Callbacks {
    fn on_accept(&self, peer: &str) -> bool {
        self.accept_cb.as_ref().map_or(true, |cb| cb(peer))
    }

    fn on_write(&self, msg: &mut MqMsg) -> bool {
        self.write_cb.as_ref().map_or(false, |cb| cb(msg))
    }

    fn on_recv(&self, msg: &MqMsg) -> bool {
        self.recv_cb.as_ref().map_or(false, |cb| cb(msg))
    }
}

/// A running message queue endpoint.
///
/// ```no_run
/// use mq_node::MqNode;
///
/// let server = MqNode::bind("tcp://127.0.0.1:18000")?;
/// let client = MqNode::connect("tcp://127.0.0.1:18000")?;
/// client.send_bytes(b"ping")?;
///
/// let mut msg = mq_node::MqMsg::default();
/// server.wait_recv(&mut msg, None)?;
/// assert_eq!(msg.data, b"ping");
/// # Ok::<(), mq_node::MqError>(())
/// ```
pub struct MqNode {
    base: Arc<MqBase>,
    mode: MqMode,
    worker: Option<JoinHandle<MqResult<()>>>,
}

impl MqNode {
    pub fn new(params: MqParams, mode: MqMode, callbacks: Callbacks) -> MqResult<Self> {
        Self::with_handler(params, mode, Arc::new(callbacks))
    }

    /// Starts a node whose loop reports to `internal`.
    pub fn with_handler(
        params: MqParams,
        mode: MqMode,
        internal: Arc<dyn MqInternal>,
    ) -> MqResult<Self> {
        validate(&params)?;
        let mq_type = params.mq_type;

        let (base, signals) = MqBase::new(params, internal)?;
        let transport: Box<dyn MqTransport> = match (mq_type, mode) {
            (MqType::Local, _) => Box::new(MqLocalQueue::new(base.clone(), signals)?),
            (MqType::Tcp | MqType::Pipe, MqMode::Bind) => {
                Box::new(MqStreamServer::new(base.clone(), signals)?)
            }
            (MqType::Tcp | MqType::Pipe, MqMode::Connect) => {
                Box::new(MqStreamClient::new(base.clone(), signals)?)
            }
            (other, _) => {
                return Err(MqError::IllegalArgs(format!("unsupported type {}", other)));
            }
        };

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| MqError::BadAlloc(format!("event loop: {}", e)))?;

        let name = format!("mq-{}-{}", mq_type, mode).to_lowercase();
        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn({
                let base = base.clone();
                move || run_loop(runtime, transport, base)
            })
            .map_err(|e| MqError::BadAlloc(format!("thread {}: {}", name, e)))?;

        let mut node = Self {
            base,
            mode,
            worker: Some(worker),
        };
        node.wait_on_activation()?;
        info!(
            "MQ node {} {} is {} ({})",
            mq_type,
            mode,
            node.base.state(),
            node.base.params().endpoint()
        );
        Ok(node)
    }

    /// Resolves `uri` and starts a node.
    pub fn from_uri(uri: &str, mode: MqMode, callbacks: Callbacks) -> MqResult<Self> {
        let params = convert_uri_to_params(uri, false);
        if !params.is_valid() {
            return Err(MqError::IllegalArgs(format!("invalid URI: {}", uri)));
        }
        Self::new(params, mode, callbacks)
    }

    pub fn bind(uri: &str) -> MqResult<Self> {
        Self::from_uri(uri, MqMode::Bind, Callbacks::default())
    }

    pub fn connect(uri: &str) -> MqResult<Self> {
        Self::from_uri(uri, MqMode::Connect, Callbacks::default())
    }

    /// Blocks until the transport is RUNNING, fails, or the connection timeout
    /// elapses. A zero timeout does not wait: the node is returned while it may
    /// still be INITIALIZING, unless the loop already reported a failure.
    fn wait_on_activation(&mut self) -> MqResult<()> {
        let timeout = self.base.params().wait_on_connection_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            if self.base.was_activated() {
                return Ok(());
            }
            match self.base.state() {
                MqMachineState::Running => return Ok(()),
                MqMachineState::Initializing => {
                    let finished = self.worker.as_ref().map_or(true, |w| w.is_finished());
                    if finished {
                        return Err(self.activation_error(MqMachineState::Initializing));
                    }
                }
                state => return Err(self.activation_error(state)),
            }

            if timeout.is_zero() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(
                    "MQ node did not become active within {:?}",
                    self.base.params().wait_on_connection_timeout()
                );
                let _ = self.base.exit();
                if let Err(e) = self.join() {
                    debug!("Loop ended after activation timeout: {}", e);
                }
                return Err(MqError::Timeout);
            }
            thread::sleep(ACTIVATION_POLL);
        }
    }

    fn activation_error(&mut self, state: MqMachineState) -> MqError {
        match self.join() {
            Err(e) => e,
            Ok(()) => MqError::IllegalState(state),
        }
    }

    /// Queues a copy of `msg`. The id selects the peer on a bound stream node
    /// ([`BROADCAST_ID`] reaches all of them).
    pub fn send(&self, msg: &MqMsg) -> MqResult<()> {
        self.base.send(msg)
    }

    /// Queues `data` as a message to every peer.
    pub fn send_bytes(&self, data: &[u8]) -> MqResult<()> {
        self.base.send_bytes(MqEvent::Msg, BROADCAST_ID, data)
    }

    pub fn send_to(&self, id: MqId, data: &[u8]) -> MqResult<()> {
        self.base.send_bytes(MqEvent::Msg, id, data)
    }

    /// Closes the node once every message queued before it was handled.
    pub fn send_close(&self) -> MqResult<()> {
        self.base.send_close()
    }

    pub fn send_shutdown(&self) -> MqResult<()> {
        self.base.send_shutdown()
    }

    pub fn recv(&self, msg: &mut MqMsg) -> MqResult<()> {
        self.base.recv(msg)
    }

    /// Waits for a message. `None` waits until one arrives or the node closes.
    pub fn wait_recv(&self, msg: &mut MqMsg, timeout: Option<Duration>) -> MqResult<()> {
        self.base.wait_recv(msg, timeout)
    }

    pub fn wait_enable(&self, timeout: Option<Duration>) -> MqResult<()> {
        self.base.wait_enable(timeout)
    }

    /// Starts the close sequence without waiting for queued messages.
    pub fn exit(&self) -> MqResult<()> {
        self.base.exit()
    }

    /// Waits for the loop thread. Later calls return `Ok(())`.
    pub fn join(&mut self) -> MqResult<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        match worker.join() {
            Ok(result) => result,
            Err(panic) => {
                self.base.mark_error();
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(MqError::Loop(reason))
            }
        }
    }

    pub fn state(&self) -> MqMachineState {
        self.base.state()
    }

    pub fn params(&self) -> &MqParams {
        self.base.params()
    }

    pub fn mode(&self) -> MqMode {
        self.mode
    }

    /// Bound TCP address, including the port picked for port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.base.local_addr()
    }

    /// Send slots currently in flight.
    pub fn active_send_size(&self) -> usize {
        self.base.events().in_flight_len()
    }

    /// Messages waiting in the receive queue.
    pub fn active_recv_size(&self) -> usize {
        self.base.receives().len()
    }
}

impl fmt::Debug for MqNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqNode")
            .field("type", &self.base.params().mq_type)
            .field("mode", &self.mode)
            .field("state", &self.base.state())
            .finish()
    }
}

impl Drop for MqNode {
    fn drop(&mut self) {
        if self.worker.is_none() {
            return;
        }
        if self.base.state() == MqMachineState::Running {
            if let Err(e) = self.base.send_close() {
                debug!("Close message not queued ({}), exiting directly", e);
                let _ = self.base.exit();
            }
        } else {
            let _ = self.base.exit();
        }
        if let Err(e) = self.join() {
            warn!("MQ node loop ended with error: {}", e);
        }
    }
}

fn validate(params: &MqParams) -> MqResult<()> {
    if params.mq_type == MqType::Udp {
        return Err(MqError::IllegalArgs("UDP transport is not supported".into()));
    }
    if !params.is_valid() {
        return Err(MqError::IllegalArgs(format!(
            "invalid parameters: type {} address {:?}",
            params.mq_type, params.address
        )));
    }
    Ok(())
}

fn run_loop(
    runtime: tokio::runtime::Runtime,
    mut transport: Box<dyn MqTransport>,
    base: Arc<MqBase>,
) -> MqResult<()> {
    let name = transport.name();
    debug!("MQ {} loop started", name);
    let result = runtime.block_on(transport.run());
    drop(transport);
    drop(runtime);

    match &result {
        Ok(()) => debug!("MQ {} loop finished", name),
        Err(e) => {
            error!("MQ {} loop failed: {}", name, e);
            if base.state() != MqMachineState::Closed {
                base.mark_error();
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callbacks_defaults() {
        let callbacks = Callbacks::default();
        let mut msg = MqMsg::from("x");
        assert!(callbacks.on_accept("peer"));
        assert!(!MqInternal::on_write(&callbacks, &mut msg));
        assert!(!MqInternal::on_recv(&callbacks, &msg));
    }

    #[test]
    fn test_callbacks_are_invoked() {
        let callbacks = Callbacks::default()
            .with_accept_cb(|peer| peer != "blocked")
            .with_write_cb(|msg| {
                msg.data.clear();
                true
            });
        assert!(MqInternal::on_accept(&callbacks, "ok"));
        assert!(!MqInternal::on_accept(&callbacks, "blocked"));

        let mut msg = MqMsg::from("x");
        assert!(MqInternal::on_write(&callbacks, &mut msg));
        assert!(msg.data.is_empty());
    }

    #[test]
    fn test_invalid_params_are_rejected() {
        assert!(matches!(
            MqNode::new(MqParams::default(), MqMode::Bind, Callbacks::default()),
            Err(MqError::IllegalArgs(_))
        ));
        let udp = MqParams {
            mq_type: MqType::Udp,
            ..MqParams::tcp("127.0.0.1", 1)
        };
        assert!(matches!(
            MqNode::new(udp, MqMode::Connect, Callbacks::default()),
            Err(MqError::IllegalArgs(_))
        ));
        assert!(matches!(MqNode::bind("not a uri"), Err(MqError::IllegalArgs(_))));
    }

    #[test]
    fn test_zero_activation_timeout_does_not_wait() {
        let mut node = MqNode::bind("tcp://127.0.0.1:0?wait_on_connection_timeout_millisec=0")
            .unwrap();
        assert!(matches!(
            node.state(),
            MqMachineState::Initializing | MqMachineState::Running
        ));
        node.wait_enable(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(node.state(), MqMachineState::Running);
        assert!(node.local_addr().is_some());

        node.exit().unwrap();
        node.join().unwrap();
        assert_eq!(node.state(), MqMachineState::Closed);
    }

    #[test]
    fn test_zero_activation_timeout_still_reports_failures() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let uri = format!(
            "tcp://127.0.0.1:{}?wait_on_connection_timeout_millisec=0",
            port
        );
        let mut node = match MqNode::connect(&uri) {
            Ok(node) => node,
            // The loop may already have failed by the first check.
            Err(e) => {
                assert!(matches!(e, MqError::Io(_)));
                return;
            }
        };
        assert!(node.join().is_err());
        assert_eq!(node.state(), MqMachineState::Error);
    }

    #[test]
    fn test_local_node_lifecycle() {
        let mut node = MqNode::bind("local://lifecycle").unwrap();
        assert_eq!(node.state(), MqMachineState::Running);
        assert_eq!(node.mode(), MqMode::Bind);

        node.send_bytes(b"echo").unwrap();
        let mut msg = MqMsg::default();
        node.wait_recv(&mut msg, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(msg.data, b"echo");

        node.exit().unwrap();
        node.join().unwrap();
        node.join().unwrap();
        assert_eq!(node.state(), MqMachineState::Closed);
        assert!(matches!(
            node.send_bytes(b"late"),
            Err(MqError::IllegalState(MqMachineState::Closed))
        ));
    }
}
