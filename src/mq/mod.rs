use crate::error::MqResult;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

pub mod base;
pub mod codec;
pub mod event_queue;
pub mod local_queue;
pub mod message;
pub mod params;
pub mod receive_queue;
pub mod stream;
pub mod stream_client;
pub mod stream_server;
pub mod uri;

pub use base::MqBase;
pub use codec::MsgPacker;
pub use event_queue::{AfterAction, MqEventQueue};
pub use local_queue::MqLocalQueue;
pub use message::{MqEvent, MqId, MqMsg, BROADCAST_ID};
pub use params::{MqParams, MqType};
pub use receive_queue::ReceiveQueue;
pub use stream_client::MqStreamClient;
pub use stream_server::MqStreamServer;
pub use uri::convert_uri_to_params;

/// How a node attaches to its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqMode {
    /// Own the address: listen (stream) or host the queue (local).
    Bind,
    /// Connect to a bound node.
    Connect,
}

impl fmt::Display for MqMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MqMode::Bind => write!(f, "BIND"),
            MqMode::Connect => write!(f, "CONNECT"),
        }
    }
}

/// Coarse lifecycle stage of a transport.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqMachineState {
    Initializing = 0,
    Running = 1,
    Closing = 2,
    Closed = 3,
    Error = 4,
}

impl MqMachineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => MqMachineState::Initializing,
            1 => MqMachineState::Running,
            2 => MqMachineState::Closing,
            3 => MqMachineState::Closed,
            _ => MqMachineState::Error,
        }
    }

    /// CLOSED and ERROR are never left again.
    pub fn is_terminal(self) -> bool {
        matches!(self, MqMachineState::Closed | MqMachineState::Error)
    }
}

impl fmt::Display for MqMachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MqMachineState::Initializing => "INITIALIZING",
            MqMachineState::Running => "RUNNING",
            MqMachineState::Closing => "CLOSING",
            MqMachineState::Closed => "CLOSED",
            MqMachineState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Atomic cell holding a [`MqMachineState`].
#[derive(Debug)]
pub struct AtomicMachineState(AtomicU8);

impl AtomicMachineState {
    pub fn new(state: MqMachineState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> MqMachineState {
        MqMachineState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn store(&self, state: MqMachineState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Moves from `current` to `next`; returns the observed state on failure.
    pub fn transition(
        &self,
        current: MqMachineState,
        next: MqMachineState,
    ) -> Result<(), MqMachineState> {
        self.0
            .compare_exchange(current as u8, next as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(MqMachineState::from_u8)
    }
}

/// Writer sub-state of a stream connection.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqRequestState {
    /// Nothing queued, no write outstanding.
    Waiting = 0,
    /// Jobs queued, writer not yet writing.
    Async = 1,
    /// A physical write is outstanding.
    Requesting = 2,
}

impl MqRequestState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => MqRequestState::Waiting,
            1 => MqRequestState::Async,
            _ => MqRequestState::Requesting,
        }
    }
}

/// Bridge from a transport to whoever owns it.
///
/// Every method runs on the loop thread. The defaults accept every peer and
/// consume nothing, so unconsumed messages end up in the receive queue.
pub trait MqInternal: Send + Sync {
    /// A peer connected to a bound stream node. Returning `false` drops it.
    fn on_accept(&self, _peer: &str) -> bool {
        true
    }

    /// A message is about to be written. Returning `true` consumes it and
    /// nothing is written.
    fn on_write(&self, _msg: &mut MqMsg) -> bool {
        false
    }

    /// A message arrived. Returning `false` leaves it for `recv()`.
    fn on_recv(&self, _msg: &MqMsg) -> bool {
        false
    }

    /// The transport reached CLOSED.
    fn on_close(&self) {}
}

/// Handler that keeps every default.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultInternal;

impl MqInternal for DefaultInternal {}

/// A transport driven by a node's event loop.
#[async_trait]
pub trait MqTransport: Send {
    /// Transport name for logging.
    fn name(&self) -> &'static str;

    /// Runs the loop until the transport is CLOSED.
    async fn run(&mut self) -> MqResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_state_transition() {
        let state = AtomicMachineState::new(MqMachineState::Initializing);
        assert!(state
            .transition(MqMachineState::Initializing, MqMachineState::Running)
            .is_ok());
        assert_eq!(
            state.transition(MqMachineState::Initializing, MqMachineState::Closed),
            Err(MqMachineState::Running)
        );
        assert_eq!(state.load(), MqMachineState::Running);
    }

    #[test]
    fn test_terminal_states() {
        assert!(MqMachineState::Closed.is_terminal());
        assert!(MqMachineState::Error.is_terminal());
        assert!(!MqMachineState::Closing.is_terminal());
    }
}
