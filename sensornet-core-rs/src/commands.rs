//! Node command protocol
//!
//! Nodes talk to the server over the main connection with whitespace
//! separated lines: `<COMMAND> <node> <args...>`. Lines are queued to the
//! [`CommandHandler`]'s worker and handled one at a time in arrival order.
//! A bad line is logged once and dropped; nothing a node sends can stop the
//! handler.

use crate::flag::Flag;
use crate::registry::SensorNet;
use crate::types::{parse_log_level, BridgeMode, NodeId, Timestamp};
use crate::wifi::LineSink;
use crate::worker::{Worker, WorkerHandle};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn, Level};

/// Commands nodes may send that the server does not act on yet
const UNHANDLED_COMMANDS: [&str; 7] = [
    "PONG",
    "FEDM_POWERUP",
    "FEDM_HEARTBEAT",
    "1ST_SYNC",
    "PULSE_DATA",
    "MISSING_SYNCS",
    "CALIBRATE_TIMING",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("{command} has no node number")]
    MissingNode { command: String },

    #[error("{command} names node [{value}], which is not a node number")]
    BadNode { command: String, value: String },

    #[error("{command} from node {node} has {got} arguments after the node number; {expected} expected")]
    ArgCount {
        command: String,
        node: NodeId,
        expected: usize,
        got: usize,
    },

    #[error("{command} from node {node} has {got} arguments after the node number; at least {min} expected")]
    TooFewArgs {
        command: String,
        node: NodeId,
        min: usize,
        got: usize,
    },

    #[error("{command} from node {node} has a bad {arg} [{value}]")]
    BadArgument {
        command: String,
        node: NodeId,
        arg: &'static str,
        value: String,
    },

    #[error("unknown command [{command}] from node {node}")]
    Unknown { command: String, node: NodeId },
}

/// A parsed command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub node: NodeId,
    pub args: Vec<String>,
}

impl Command {
    /// Parse a line. `Ok(None)` for a blank line.
    pub fn parse(line: &str) -> Result<Option<Self>, CommandError> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Ok(None);
        };
        let name = name.to_string();
        let Some(node) = words.next() else {
            return Err(CommandError::MissingNode { command: name });
        };
        let node = node.parse().map_err(|_| CommandError::BadNode {
            command: name.clone(),
            value: node.to_string(),
        })?;
        Ok(Some(Self {
            name,
            node,
            args: words.map(str::to_string).collect(),
        }))
    }

    fn expect_args(&self, expected: usize) -> Result<(), CommandError> {
        if self.args.len() != expected {
            return Err(CommandError::ArgCount {
                command: self.name.clone(),
                node: self.node,
                expected,
                got: self.args.len(),
            });
        }
        Ok(())
    }

    fn expect_min_args(&self, min: usize) -> Result<(), CommandError> {
        if self.args.len() < min {
            return Err(CommandError::TooFewArgs {
                command: self.name.clone(),
                node: self.node,
                min,
                got: self.args.len(),
            });
        }
        Ok(())
    }

    fn bad_arg(&self, arg: &'static str, value: &str) -> CommandError {
        CommandError::BadArgument {
            command: self.name.clone(),
            node: self.node,
            arg,
            value: value.to_string(),
        }
    }
}

/// A line read from a node's main connection
pub struct InboundLine {
    pub line: String,
    pub sender_ip: String,
    pub received: Timestamp,
    /// Connection the line came in on, kept as the node's main connection
    pub conn: Option<Arc<dyn LineSink>>,
}

impl InboundLine {
    pub fn new(line: impl Into<String>, sender_ip: impl Into<String>, received: Timestamp) -> Self {
        Self {
            line: line.into(),
            sender_ip: sender_ip.into(),
            received,
            conn: None,
        }
    }

    pub fn with_conn(mut self, conn: Arc<dyn LineSink>) -> Self {
        self.conn = Some(conn);
        self
    }
}

/// Routes parsed commands to the sensor net model
pub struct Dispatcher {
    net: Arc<SensorNet>,
}

impl Dispatcher {
    pub fn new(net: Arc<SensorNet>) -> Self {
        Self { net }
    }

    /// Handle one line, logging any problem with it
    pub fn process(&self, msg: InboundLine) {
        if let Err(e) = self.dispatch(msg) {
            error!("Ignoring command: {}", e);
        }
    }

    pub fn dispatch(&self, msg: InboundLine) -> Result<(), CommandError> {
        let Some(cmd) = Command::parse(&msg.line)? else {
            debug!("Ignoring blank line from {}", msg.sender_ip);
            return Ok(());
        };
        trace!("Command {:?} from {}", cmd, msg.sender_ip);
        match cmd.name.as_str() {
            "POWERED_ON" => self.powered_on(&cmd, msg),
            "LOGMSG" => self.log_msg(&cmd, &msg),
            "HEARTBEAT" => self.heartbeat(&cmd, &msg),
            "BRIDGE_MODE" => self.bridge_mode(&cmd, &msg),
            name if UNHANDLED_COMMANDS.contains(&name) => {
                warn!("Command {} from node {} is not implemented; ignoring", name, cmd.node);
                Ok(())
            }
            _ => Err(CommandError::Unknown {
                command: cmd.name.clone(),
                node: cmd.node,
            }),
        }
    }

    /// `POWERED_ON <node> <ipaddr> <macaddr>`
    fn powered_on(&self, cmd: &Command, msg: InboundLine) -> Result<(), CommandError> {
        cmd.expect_args(2)?;
        let (ip, mac) = (&cmd.args[0], &cmd.args[1]);
        if *ip != msg.sender_ip {
            warn!(
                "Node {} reports IP address {} but its message came from {}; using it anyway",
                cmd.node, ip, msg.sender_ip
            );
        }
        self.net.node_on(cmd.node, ip, mac, msg.received, msg.conn);
        Ok(())
    }

    /// `LOGMSG <node> <level> <depth> <message...>`
    fn log_msg(&self, cmd: &Command, msg: &InboundLine) -> Result<(), CommandError> {
        cmd.expect_min_args(3)?;
        let depth: usize = cmd.args[1]
            .parse()
            .map_err(|_| cmd.bad_arg("depth", &cmd.args[1]))?;
        let level = parse_log_level(&cmd.args[0]).unwrap_or_else(|| {
            warn!(
                "LOGMSG from node {} has unknown level [{}]; logging at INFO",
                cmd.node, cmd.args[0]
            );
            Level::INFO
        });
        let node = self.net.verify(cmd.node, &msg.sender_ip, msg.received);
        let text = format!(
            "Node {}: {}{}",
            cmd.node,
            "  ".repeat(depth),
            cmd.args[2..].join(" ")
        );
        log_at(level, &text);
        node.log_line(level, &text);
        Ok(())
    }

    /// `HEARTBEAT <node> <seqnum>`
    fn heartbeat(&self, cmd: &Command, msg: &InboundLine) -> Result<(), CommandError> {
        cmd.expect_args(1)?;
        let seq: u64 = cmd.args[0]
            .parse()
            .map_err(|_| cmd.bad_arg("heartbeat number", &cmd.args[0]))?;
        let node = self.net.verify(cmd.node, &msg.sender_ip, msg.received);
        info!("Heartbeat #{} received from node {}", seq, cmd.node);
        node.record_heartbeat(seq, msg.received);
        Ok(())
    }

    /// `BRIDGE_MODE <node> <mode>`
    fn bridge_mode(&self, cmd: &Command, msg: &InboundLine) -> Result<(), CommandError> {
        cmd.expect_args(1)?;
        let node = self.net.verify(cmd.node, &msg.sender_ip, msg.received);
        info!("Node {} reports bridge mode {}", cmd.node, cmd.args[0]);
        node.set_bridge_mode(BridgeMode::from_wire(&cmd.args[0]));
        Ok(())
    }
}

fn log_at(level: Level, text: &str) {
    match level {
        Level::ERROR => error!("{}", text),
        Level::WARN => warn!("{}", text),
        Level::INFO => info!("{}", text),
        Level::DEBUG => debug!("{}", text),
        _ => trace!("{}", text),
    }
}

/// Owns the worker that handles node commands
pub struct CommandHandler {
    worker: Worker,
    dispatcher: Arc<Dispatcher>,
}

/// Cloneable sender of lines to the command handler
#[derive(Clone)]
pub struct CommandQueue {
    worker: WorkerHandle,
    dispatcher: Arc<Dispatcher>,
}

impl CommandHandler {
    pub fn start(net: Arc<SensorNet>) -> io::Result<Self> {
        Ok(Self {
            worker: Worker::spawn("command-handler")?,
            dispatcher: Arc::new(Dispatcher::new(net)),
        })
    }

    pub fn queue(&self) -> CommandQueue {
        CommandQueue {
            worker: self.worker.handle(),
            dispatcher: self.dispatcher.clone(),
        }
    }

    pub fn stop(&self) {
        self.worker.stop();
    }

    pub fn join_until(&self, deadline: Instant) -> bool {
        self.worker.join_until(deadline)
    }
}

impl CommandQueue {
    pub fn push(&self, msg: InboundLine) {
        let dispatcher = self.dispatcher.clone();
        self.worker.submit(move || dispatcher.process(msg));
    }

    /// Wait until every line pushed so far has been handled
    ///
    /// Must not be called from the handler's own thread.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let done = Arc::new(Flag::new(false));
        let d = done.clone();
        self.worker.submit(move || d.raise());
        done.wait_up(Some(timeout))
    }
}
