use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// MQ Node - message queue endpoints over local queues, Unix sockets and TCP
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Command,

    /// Verbose output (debug logging and per-message tracing)
    #[clap(short = 'v', long, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Write logs to this file instead of stderr
    #[clap(long, global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the parameters a URI resolves to as JSON
    Params {
        /// Node URI, e.g. tcp://127.0.0.1:18000?send_queue_size=64
        uri: String,

        /// Accept whitespace and control characters in the URI instead of rejecting it
        #[clap(long, default_value_t = false)]
        auto_encode: bool,
    },

    /// Bind a node and print every message it receives
    Bind {
        /// Node URI
        uri: String,

        /// Send every received message back to its sender
        #[clap(long, default_value_t = false)]
        echo: bool,
    },

    /// Connect to a bound node, send each stdin line and print replies
    Connect {
        /// Node URI
        uri: String,
    },
}

impl Command {
    pub fn uri(&self) -> &str {
        match self {
            Command::Params { uri, .. } | Command::Bind { uri, .. } | Command::Connect { uri } => {
                uri
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_params_command() {
        let args = Args::parse_from(["mq-node", "params", "tcp://localhost:1?verbose=1"]);
        assert_eq!(
            args.command,
            Command::Params {
                uri: "tcp://localhost:1?verbose=1".into(),
                auto_encode: false,
            }
        );
        assert!(!args.verbose);
        assert!(args.log_file.is_none());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::parse_from([
            "mq-node",
            "bind",
            "pipe:///tmp/mq.sock",
            "--echo",
            "-v",
            "--log-file",
            "/tmp/mq.log",
        ]);
        assert!(args.verbose);
        assert_eq!(args.log_file, Some(PathBuf::from("/tmp/mq.log")));
        assert_eq!(args.command.uri(), "pipe:///tmp/mq.sock");
        assert!(matches!(args.command, Command::Bind { echo: true, .. }));
    }

    #[test]
    fn test_missing_uri_is_rejected() {
        assert!(Args::try_parse_from(["mq-node", "connect"]).is_err());
    }
}
