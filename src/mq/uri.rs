//! Connection URI → [`MqParams`].
//!
//! ```text
//! <scheme>://[<host>[:<port>]][/<path>][?<key>=<value>&...]
//! scheme ::= "local" | "pipe" | "tcp" | "udp"
//! ```

use super::params::{MqParams, MqType};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use tracing::{debug, warn};

/// Components of a split URI. Percent-escapes are already decoded.
#[derive(Debug, Default, PartialEq, Eq)]
struct UriParts {
    scheme: String,
    host: String,
    port: Option<u16>,
    path: String,
    query: Vec<(String, String)>,
}

/// Resolves `uri` into node parameters.
///
/// An unparsable URI yields `MqParams::default()`, whose `is_valid()` is
/// false. With `auto_encode`, whitespace inside the URI is taken literally
/// instead of making it unparsable.
pub fn convert_uri_to_params(uri: &str, auto_encode: bool) -> MqParams {
    let parts = match split_uri(uri, auto_encode) {
        Some(parts) => parts,
        None => {
            warn!("Unparsable MQ URI: {:?}", uri);
            return MqParams::default();
        }
    };

    let mut params = MqParams {
        mq_type: scheme_to_type(&parts.scheme),
        ..Default::default()
    };

    match params.mq_type {
        MqType::Local | MqType::Pipe => {
            params.address = format!("{}{}", parts.host, parts.path);
        }
        _ => {
            let (address, port) = resolve_host(&parts.host, parts.port);
            params.address = address;
            params.port = port;
        }
    }

    for (key, value) in &parts.query {
        apply_option(&mut params, key, value);
    }
    params
}

fn scheme_to_type(scheme: &str) -> MqType {
    match scheme.to_ascii_lowercase().as_str() {
        "local" => MqType::Local,
        "pipe" => MqType::Pipe,
        "tcp" => MqType::Tcp,
        "udp" => MqType::Udp,
        other => {
            warn!("Unknown MQ scheme {:?}, falling back to TCP", other);
            MqType::Tcp
        }
    }
}

fn split_uri(uri: &str, auto_encode: bool) -> Option<UriParts> {
    let uri = uri.trim();
    if !auto_encode && uri.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return None;
    }

    let (scheme, rest) = uri.split_once("://")?;
    let scheme_ok = scheme
        .chars()
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic())
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if !scheme_ok {
        return None;
    }

    let rest = rest.split_once('#').map_or(rest, |(head, _)| head);
    let (rest, query) = match rest.split_once('?') {
        Some((head, query)) => (head, query),
        None => (rest, ""),
    };
    let (authority, path) = match rest.find('/') {
        Some(index) => rest.split_at(index),
        None => (rest, ""),
    };
    let authority = authority
        .rsplit_once('@')
        .map_or(authority, |(_, host)| host);

    let (host, port) = split_authority(authority)?;
    Some(UriParts {
        scheme: scheme.to_string(),
        host: percent_decode(host)?,
        port,
        path: percent_decode(path)?,
        query: split_query(query)?,
    })
}

/// Splits `host[:port]`, accepting bracketed IPv6 literals.
fn split_authority(authority: &str) -> Option<(&str, Option<u16>)> {
    if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, tail) = bracketed.split_once(']')?;
        return match tail.strip_prefix(':') {
            Some(port) => Some((host, Some(port.parse().ok()?))),
            None if tail.is_empty() => Some((host, None)),
            None => None,
        };
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host, Some(port.parse().ok()?))),
        None => Some((authority, None)),
    }
}

fn split_query(query: &str) -> Option<Vec<(String, String)>> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            Some((percent_decode(key)?, percent_decode(value)?))
        })
        .collect()
}

fn percent_decode(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'%' => {
                let hex = text.get(index + 1..index + 3)?;
                decoded.push(u8::from_str_radix(hex, 16).ok()?);
                index += 3;
            }
            byte => {
                decoded.push(byte);
                index += 1;
            }
        }
    }
    String::from_utf8(decoded).ok()
}

/// Literal addresses with a port are kept; anything else goes through DNS,
/// IPv4 answers first. Resolution failures keep the literal host.
fn resolve_host(host: &str, port: Option<u16>) -> (String, u16) {
    if let (Ok(ip), Some(port)) = (host.parse::<IpAddr>(), port) {
        return (ip.to_string(), port);
    }

    let port = port.unwrap_or(0);
    if host.is_empty() {
        return (String::new(), port);
    }

    match (host, port).to_socket_addrs() {
        Ok(addrs) => {
            let addrs: Vec<SocketAddr> = addrs.collect();
            let preferred = addrs
                .iter()
                .find(|addr| addr.is_ipv4())
                .or_else(|| addrs.first());
            match preferred {
                Some(addr) => {
                    debug!("Resolved MQ host {} to {}", host, addr.ip());
                    (addr.ip().to_string(), port)
                }
                None => (host.to_string(), port),
            }
        }
        Err(e) => {
            warn!("Failed to resolve MQ host {}: {}", host, e);
            (host.to_string(), port)
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn apply_option(params: &mut MqParams, key: &str, value: &str) {
    fn set<T: std::str::FromStr>(field: &mut T, key: &str, value: &str) {
        match value.parse() {
            Ok(parsed) => *field = parsed,
            Err(_) => warn!("Ignoring MQ option {}: invalid number {:?}", key, value),
        }
    }
    fn set_bool(field: &mut bool, key: &str, value: &str) {
        match parse_bool(value) {
            Some(parsed) => *field = parsed,
            None => warn!("Ignoring MQ option {}: invalid boolean {:?}", key, value),
        }
    }

    match key {
        "tcp_ipv6_only" => set_bool(&mut params.tcp_ipv6_only, key, value),
        "send_queue_size" => set(&mut params.send_queue_size, key, value),
        "send_msg_size" => set(&mut params.send_msg_size, key, value),
        "recv_queue_size" => set(&mut params.recv_queue_size, key, value),
        "recv_msg_size" => set(&mut params.recv_msg_size, key, value),
        "max_nodes" => set(&mut params.max_nodes, key, value),
        "packer_size" => set(&mut params.packer_size, key, value),
        "wait_closing_millisec" => set(&mut params.wait_closing_millisec, key, value),
        "verify_restore_message" => set_bool(&mut params.verify_restore_message, key, value),
        "continuous_read_error_count" => {
            set(&mut params.continuous_read_error_count, key, value)
        }
        "try_reconnect_count" => set(&mut params.try_reconnect_count, key, value),
        "wait_on_connection_timeout_millisec" => {
            set(&mut params.wait_on_connection_timeout_millisec, key, value)
        }
        "verbose" => set_bool(&mut params.verbose, key, value),
        unknown => debug!("Ignoring unknown MQ option {:?}", unknown),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_uri_with_query() {
        let params = convert_uri_to_params("tcp://127.0.0.1:9000?send_queue_size=64", false);
        assert_eq!(
            params,
            MqParams {
                send_queue_size: 64,
                ..MqParams::tcp("127.0.0.1", 9000)
            }
        );
    }

    #[test]
    fn test_pipe_uri_has_no_host() {
        let params = convert_uri_to_params("pipe:///tmp/my.sock", false);
        assert_eq!(params.mq_type, MqType::Pipe);
        assert_eq!(params.address, "/tmp/my.sock");
        assert_eq!(params.port, 0);
    }

    #[test]
    fn test_local_uri_and_case_insensitive_scheme() {
        let params = convert_uri_to_params("LOCAL://work_queue?verbose=true", false);
        assert_eq!(params.mq_type, MqType::Local);
        assert_eq!(params.address, "work_queue");
        assert!(params.verbose);
    }

    #[test]
    fn test_ipv6_literal() {
        let params = convert_uri_to_params("tcp://[::1]:7000?tcp_ipv6_only=1", false);
        assert_eq!(params.address, "::1");
        assert_eq!(params.port, 7000);
        assert!(params.tcp_ipv6_only);
    }

    #[test]
    fn test_unknown_scheme_falls_back_to_tcp() {
        let params = convert_uri_to_params("sctp://127.0.0.1:1234", false);
        assert_eq!(params.mq_type, MqType::Tcp);
        assert_eq!(params.port, 1234);
    }

    #[test]
    fn test_all_query_options() {
        let uri = "udp://127.0.0.1:1?send_msg_size=10&recv_queue_size=11&recv_msg_size=12\
                   &max_nodes=13&packer_size=14&wait_closing_millisec=15\
                   &verify_restore_message=yes&continuous_read_error_count=16\
                   &try_reconnect_count=17&wait_on_connection_timeout_millisec=18\
                   &unknown_key=3&verbose=off";
        let params = convert_uri_to_params(uri, false);
        assert_eq!(params.mq_type, MqType::Udp);
        assert_eq!(params.send_msg_size, 10);
        assert_eq!(params.recv_queue_size, 11);
        assert_eq!(params.recv_msg_size, 12);
        assert_eq!(params.max_nodes, 13);
        assert_eq!(params.packer_size, 14);
        assert_eq!(params.wait_closing_millisec, 15);
        assert!(params.verify_restore_message);
        assert_eq!(params.continuous_read_error_count, 16);
        assert_eq!(params.try_reconnect_count, 17);
        assert_eq!(params.wait_on_connection_timeout_millisec, 18);
        assert!(!params.verbose);
    }

    #[test]
    fn test_invalid_option_value_keeps_default() {
        let params = convert_uri_to_params("tcp://127.0.0.1:1?send_queue_size=lots", false);
        assert_eq!(params.send_queue_size, crate::defaults::QUEUE_SIZE);
    }

    #[test]
    fn test_unparsable_uri() {
        assert!(!convert_uri_to_params("not a uri", false).is_valid());
        assert!(!convert_uri_to_params("tcp://127.0.0.1:notaport", false).is_valid());
        assert!(!convert_uri_to_params("://missing", false).is_valid());
    }

    #[test]
    fn test_auto_encode_accepts_spaces() {
        assert!(!convert_uri_to_params("pipe:///tmp/my socket", false).is_valid());
        let params = convert_uri_to_params("pipe:///tmp/my socket", true);
        assert_eq!(params.address, "/tmp/my socket");

        let params = convert_uri_to_params("pipe:///tmp/my%20socket", false);
        assert_eq!(params.address, "/tmp/my socket");
    }

    #[test]
    fn test_localhost_resolution() {
        let params = convert_uri_to_params("tcp://localhost:8080", false);
        assert_eq!(params.port, 8080);
        assert!(!params.address.is_empty());
    }
}
