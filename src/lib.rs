//! # MQ Node Library
//!
//! Message queue nodes exchanging framed messages over in-process queues,
//! Unix domain sockets and TCP streams.
//!
//! ## Supported Transports
//!
//! - **LOCAL** (`local://name`): in-process loopback queue
//! - **PIPE** (`pipe:///path/to/socket`): Unix domain socket stream
//! - **TCP** (`tcp://host:port`): TCP stream with `TCP_NODELAY`
//!
//! UDP URIs are understood by the resolver but nodes refuse to start with
//! them.
//!
//! ## Architecture Overview
//!
//! - `mq`: parameters and URI resolver, slot pool, state machine and the
//!   transports running on a node's event loop
//! - `node`: the public [`MqNode`] handle owning the loop thread
//! - `error`: the [`MqError`] taxonomy shared by every operation
//! - `cli` / `logging`: support for the `mq-node` binary
//!
//! Producers on any thread copy messages into pre-allocated slots; the
//! loop thread drains them in order and writes frames. When every slot is in
//! flight `send()` fails with [`MqError::NotReady`] instead of allocating.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use mq_node::{MqMsg, MqNode};
//! use std::time::Duration;
//!
//! fn main() -> Result<(), mq_node::MqError> {
//!     let server = MqNode::bind("tcp://127.0.0.1:18000?recv_queue_size=64")?;
//!     let client = MqNode::connect("tcp://127.0.0.1:18000")?;
//!
//!     client.send_bytes(b"hello")?;
//!
//!     let mut msg = MqMsg::default();
//!     server.wait_recv(&mut msg, Some(Duration::from_secs(1)))?;
//!     server.send_to(msg.id, b"world")?;
//!     Ok(())
//! }
//! ```

/// Command-line interface of the `mq-node` binary
///
/// Argument parsing using clap: a URI positional argument per subcommand
/// plus global logging flags.
pub mod cli;

/// Error types
pub mod error;

/// Log formatting and subscriber setup for the binary
pub mod logging;

/// Message queue core
///
/// Contains the transport-agnostic node state (`MqBase`), the slot pool
/// (`MqEventQueue`), the receive queue, the wire codec and the three
/// transports. Features:
/// - Lock-free ready queue with bounded capacity (backpressure)
/// - Ordered, idempotent close sequence
/// - Broadcast and targeted delivery on bound stream nodes
/// - Reconnecting stream clients
pub mod mq;

/// Node façade
///
/// `MqNode` validates parameters, builds the event loop and exposes the
/// thread-safe send/receive API.
pub mod node;

pub use error::{MqError, MqResult};
pub use mq::{
    convert_uri_to_params, MqEvent, MqId, MqInternal, MqMachineState, MqMode, MqMsg, MqParams,
    MqType, BROADCAST_ID,
};
pub use node::{Callbacks, MqNode};

/// The current version of the MQ node library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
///
/// Every field of [`MqParams`] not given in a URI query takes its value from
/// here.
pub mod defaults {
    use std::time::Duration;

    /// Default send/receive queue capacity in messages
    pub const QUEUE_SIZE: usize = 1024;

    /// Default maximum payload size in bytes
    ///
    /// 64KiB keeps a full send pool of default size within 64MiB.
    pub const MSG_SIZE: usize = 64 * 1024;

    /// Default maximum number of peers accepted by a bound stream node
    pub const MAX_NODES: usize = 1024;

    /// Default initial capacity of slot and packer buffers
    pub const PACKER_SIZE: usize = 1024;

    /// Default time a closing node lets writers drain
    pub const WAIT_CLOSING_MILLISEC: u64 = 1000;

    /// Default number of consecutive undecodable frames tolerated per
    /// connection
    pub const CONTINUOUS_READ_ERROR_COUNT: usize = 4;

    /// Default number of extra connect attempts after a failure
    pub const TRY_RECONNECT_COUNT: usize = 0;

    /// Default time `MqNode` construction waits for the transport to run
    pub const WAIT_ON_CONNECTION_TIMEOUT_MILLISEC: u64 = 1000;

    /// Pause between connect attempts of a stream client
    pub const RECONNECT_DELAY: Duration = Duration::from_millis(100);
}
