use crate::defaults;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Transport kind selected by the URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MqType {
    /// Not configured. Nodes refuse to start with it.
    #[default]
    None,
    /// In-process queue.
    Local,
    /// Unix domain socket.
    Pipe,
    Tcp,
    Udp,
}

impl MqType {
    /// Stream transports carry framed messages over a socket.
    pub fn is_stream(self) -> bool {
        matches!(self, MqType::Pipe | MqType::Tcp)
    }
}

impl fmt::Display for MqType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MqType::None => write!(f, "NONE"),
            MqType::Local => write!(f, "LOCAL"),
            MqType::Pipe => write!(f, "PIPE"),
            MqType::Tcp => write!(f, "TCP"),
            MqType::Udp => write!(f, "UDP"),
        }
    }
}

/// Immutable node configuration.
///
/// Built once from a URI ([`crate::mq::convert_uri_to_params`]) or from one of
/// the constructors below combined with struct update syntax, then shared
/// read-only with every component of the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqParams {
    pub mq_type: MqType,
    /// Host for network transports, socket path or queue name otherwise.
    pub address: String,
    pub port: u16,

    /// Number of send slots. Allocated once.
    pub send_queue_size: usize,
    /// Largest payload accepted by `send()`.
    pub send_msg_size: usize,
    /// Capacity of the receive queue.
    pub recv_queue_size: usize,
    /// Largest payload accepted from the wire.
    pub recv_msg_size: usize,

    /// Peer limit of a bound stream node.
    pub max_nodes: usize,
    /// Initial capacity of the frame encoder buffer.
    pub packer_size: usize,

    /// Upper bound for the graceful close sequence.
    pub wait_closing_millisec: u64,
    /// Check that restored slots were really in flight.
    pub verify_restore_message: bool,
    /// Consecutive undecodable frames tolerated per connection.
    pub continuous_read_error_count: usize,
    /// Reconnect attempts of a connecting stream node.
    pub try_reconnect_count: usize,
    /// How long node construction waits for the transport to start.
    pub wait_on_connection_timeout_millisec: u64,

    pub verbose: bool,
    pub tcp_ipv6_only: bool,
}

impl Default for MqParams {
    fn default() -> Self {
        Self {
            mq_type: MqType::None,
            address: String::new(),
            port: 0,
            send_queue_size: defaults::QUEUE_SIZE,
            send_msg_size: defaults::MSG_SIZE,
            recv_queue_size: defaults::QUEUE_SIZE,
            recv_msg_size: defaults::MSG_SIZE,
            max_nodes: defaults::MAX_NODES,
            packer_size: defaults::PACKER_SIZE,
            wait_closing_millisec: defaults::WAIT_CLOSING_MILLISEC,
            verify_restore_message: false,
            continuous_read_error_count: defaults::CONTINUOUS_READ_ERROR_COUNT,
            try_reconnect_count: defaults::TRY_RECONNECT_COUNT,
            wait_on_connection_timeout_millisec: defaults::WAIT_ON_CONNECTION_TIMEOUT_MILLISEC,
            verbose: false,
            tcp_ipv6_only: false,
        }
    }
}

impl MqParams {
    /// In-process queue called `name`.
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            mq_type: MqType::Local,
            address: name.into(),
            ..Default::default()
        }
    }

    /// Unix domain socket at `path`.
    pub fn pipe(path: impl Into<String>) -> Self {
        Self {
            mq_type: MqType::Pipe,
            address: path.into(),
            ..Default::default()
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            mq_type: MqType::Tcp,
            address: host.into(),
            port,
            ..Default::default()
        }
    }

    /// False for the parameters of an unparsable URI.
    pub fn is_valid(&self) -> bool {
        self.mq_type != MqType::None && !self.address.is_empty()
    }

    pub fn wait_closing(&self) -> Duration {
        Duration::from_millis(self.wait_closing_millisec)
    }

    pub fn wait_on_connection_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_on_connection_timeout_millisec)
    }

    /// `host:port` for TCP, the address otherwise.
    pub fn endpoint(&self) -> String {
        match self.mq_type {
            MqType::Tcp | MqType::Udp if self.address.contains(':') => {
                format!("[{}]:{}", self.address, self.port)
            }
            MqType::Tcp | MqType::Udp => format!("{}:{}", self.address, self.port),
            _ => self.address.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_default() {
        let params = MqParams::default();
        assert_eq!(params.mq_type, MqType::None);
        assert!(!params.is_valid());
        assert_eq!(params.send_queue_size, defaults::QUEUE_SIZE);
        assert_eq!(params.recv_msg_size, defaults::MSG_SIZE);
        assert_eq!(params.try_reconnect_count, 0);
    }

    #[test]
    fn test_params_constructors() {
        let params = MqParams {
            send_queue_size: 8,
            ..MqParams::tcp("127.0.0.1", 9000)
        };
        assert!(params.is_valid());
        assert_eq!(params.endpoint(), "127.0.0.1:9000");
        assert_eq!(params.send_queue_size, 8);

        assert_eq!(MqParams::tcp("::1", 80).endpoint(), "[::1]:80");
        assert_eq!(MqParams::pipe("/tmp/a.sock").endpoint(), "/tmp/a.sock");
        assert!(MqType::Pipe.is_stream());
        assert!(!MqType::Local.is_stream());
    }
}
