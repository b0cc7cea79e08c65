//! Result codes shared by every layer of the message-queue stack.
//!
//! Steady-state operations (`send`, `recv`, `exit`, ...) never panic; they
//! return one of these codes. Only node construction reports allocation
//! failures, and it does so through `MqError::BadAlloc` as well.

use crate::mq::MqMachineState;
use thiserror::Error;

/// Errors produced by message-queue nodes and their components.
#[derive(Debug, Error)]
pub enum MqError {
    /// No free slot is available (backpressure). Retry later.
    #[error("no ready slot available")]
    NotReady,

    /// The fill predicate declined the slot, or a wait was cancelled
    /// because the node closed.
    #[error("operation canceled")]
    Canceled,

    /// A blocking wait expired.
    #[error("operation timed out")]
    Timeout,

    /// A URI or wire frame could not be parsed.
    #[error("parsing error: {0}")]
    Parsing(String),

    /// The transport, its runtime or its worker thread could not be created.
    #[error("failed to allocate transport: {0}")]
    BadAlloc(String),

    /// The operation is not allowed in the current machine state.
    #[error("illegal state: {0}")]
    IllegalState(MqMachineState),

    /// Invalid parameters or arguments.
    #[error("illegal arguments: {0}")]
    IllegalArgs(String),

    /// An exit request is already being processed.
    #[error("transport is already closing")]
    Closing,

    /// A payload exceeds the configured maximum message size.
    #[error("message too large: {size} bytes (limit {limit})")]
    MessageTooLarge { size: usize, limit: usize },

    /// Socket level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The event loop terminated abnormally.
    #[error("event loop failure: {0}")]
    Loop(String),
}

impl MqError {
    /// True for codes a caller is expected to retry or simply ignore.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MqError::NotReady | MqError::Canceled | MqError::Timeout
        )
    }
}

impl From<bincode::Error> for MqError {
    fn from(err: bincode::Error) -> Self {
        MqError::Parsing(err.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type MqResult<T> = Result<T, MqError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_codes() {
        assert!(MqError::NotReady.is_recoverable());
        assert!(MqError::Timeout.is_recoverable());
        assert!(!MqError::Closing.is_recoverable());
        assert!(!MqError::IllegalState(MqMachineState::Closed).is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = MqError::MessageTooLarge { size: 10, limit: 4 };
        assert_eq!(err.to_string(), "message too large: 10 bytes (limit 4)");
        assert_eq!(
            MqError::IllegalState(MqMachineState::Closing).to_string(),
            "illegal state: CLOSING"
        );
    }
}
