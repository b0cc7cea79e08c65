//! # MQ Node - Main Entry Point
//!
//! Small front end over the library:
//! - `params <URI>` prints the resolved parameters as JSON
//! - `bind <URI>` serves a node and prints what it receives
//! - `connect <URI>` sends stdin lines to a bound node
//!
//! The node runs its own event loop thread, so `main` stays synchronous and
//! simply blocks on the node's receive queue.

use anyhow::{Context, Result};
use clap::Parser;
use mq_node::{
    cli::{Args, Command},
    convert_uri_to_params, logging, MqError, MqMsg, MqNode,
};
use std::io::BufRead;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long a producer backs off when every send slot is in flight.
const SEND_RETRY_DELAY: Duration = Duration::from_millis(1);

fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = logging::init_logging(args.verbose, args.log_file.as_deref())?;

    info!("MQ Node {}", mq_node::VERSION);
    debug!("Arguments: {:?}", args);
    debug!("Node URI: {}", args.command.uri());

    match args.command {
        Command::Params { uri, auto_encode } => print_params(&uri, auto_encode),
        Command::Bind { uri, echo } => run_bind(&uri, echo),
        Command::Connect { uri } => run_connect(&uri),
    }
}

fn print_params(uri: &str, auto_encode: bool) -> Result<()> {
    let params = convert_uri_to_params(uri, auto_encode);
    if !params.is_valid() {
        warn!("URI could not be resolved: {}", uri);
    }
    println!("{}", serde_json::to_string_pretty(&params)?);
    Ok(())
}

fn run_bind(uri: &str, echo: bool) -> Result<()> {
    let node = MqNode::bind(uri).with_context(|| format!("failed to bind {}", uri))?;
    match node.local_addr() {
        Some(addr) => info!("Bound {} (listening on {})", uri, addr),
        None => info!("Bound {}", uri),
    }

    let mut msg = MqMsg::default();
    loop {
        match node.wait_recv(&mut msg, None) {
            Ok(()) => {
                print_msg(&msg);
                if echo {
                    send_with_retry(|| node.send_to(msg.id, &msg.data))?;
                }
            }
            Err(MqError::Canceled) => {
                info!("Node closed");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn run_connect(uri: &str) -> Result<()> {
    let mut node = MqNode::connect(uri).with_context(|| format!("failed to connect {}", uri))?;
    info!("Connected to {}", uri);

    thread::scope(|scope| -> Result<()> {
        let node_ref = &node;
        scope.spawn(move || {
            let mut msg = MqMsg::default();
            while node_ref.wait_recv(&mut msg, None).is_ok() {
                print_msg(&msg);
            }
        });

        let sent = send_lines(node_ref);

        debug!("End of input, closing");
        if let Err(e) = node_ref.send_close() {
            debug!("Close message not queued ({}), exiting", e);
            let _ = node_ref.exit();
        }
        sent
    })?;

    node.join()?;
    Ok(())
}

fn send_lines(node: &MqNode) -> Result<()> {
    for line in std::io::stdin().lock().lines() {
        let line = line.context("failed to read stdin")?;
        send_with_retry(|| node.send_bytes(line.as_bytes()))?;
    }
    Ok(())
}

fn send_with_retry<F>(mut send: F) -> Result<()>
where
    F: FnMut() -> Result<(), MqError>,
{
    loop {
        match send() {
            Ok(()) => return Ok(()),
            Err(MqError::NotReady) => thread::sleep(SEND_RETRY_DELAY),
            Err(e) => return Err(e.into()),
        }
    }
}

fn print_msg(msg: &MqMsg) {
    match msg.as_str() {
        Some(text) => println!("[{}] {}", msg.id, text),
        None => println!("[{}] {:?}", msg.id, msg.data),
    }
}
