//! Per-node bridge servers
//!
//! Each node that powers on gets two listeners of its own, at
//! `auxio_base_port + id` and `uart_base_port + id`. The node's WiFi board
//! dials both. UART lines are host messages; AUXIO lines go to the node
//! log.

use crate::config::SiteConfig;
use crate::session::NodeSession;
use crate::transport::{Connection, LineHandler, LineServer};
use crate::types::NodeId;
use crate::wifi::{Channel, LineSink};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn, Level};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{channel} bridge port for node {node} is out of range")]
    PortOutOfRange { node: NodeId, channel: Channel },

    #[error("cannot listen for node {node}'s {channel} bridge on port {port}: {source}")]
    Bind {
        node: NodeId,
        channel: Channel,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("bridge servers are shut down")]
    ShutDown,
}

/// Starts the bridge listeners for a node the first time it powers on
pub trait BridgeLauncher: Send + Sync {
    fn start_bridges(&self, session: &Arc<NodeSession>) -> Result<(), BridgeError>;
}

pub struct BridgeServers {
    config: SiteConfig,
    servers: Mutex<HashMap<(NodeId, Channel), LineServer>>,
    closed: AtomicBool,
}

impl BridgeServers {
    pub fn new(config: SiteConfig) -> Self {
        Self {
            config,
            servers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn local_addr(&self, node: NodeId, channel: Channel) -> Option<SocketAddr> {
        self.servers.lock().get(&(node, channel)).map(LineServer::local_addr)
    }

    fn port_for(&self, node: NodeId, channel: Channel) -> Result<u16, BridgeError> {
        let port = match channel {
            Channel::Auxio => self.config.auxio_port(node),
            Channel::Uart => self.config.uart_port(node),
            Channel::Main => Some(self.config.main_port),
        };
        port.ok_or(BridgeError::PortOutOfRange { node, channel })
    }

    fn start(&self, session: &Arc<NodeSession>, channel: Channel) -> Result<(), BridgeError> {
        let node = session.id();
        if self.servers.lock().contains_key(&(node, channel)) {
            return Ok(());
        }
        let port = self.port_for(node, channel)?;
        let handler = Arc::new(BridgeHandler {
            node,
            channel,
            session: Arc::downgrade(session),
        });
        let addr = SocketAddr::new(self.config.bind_ip, port);
        let server = LineServer::bind(format!("node{}-{}", node, channel), addr, handler)
            .map_err(|source| BridgeError::Bind {
                node,
                channel,
                port,
                source,
            })?;
        self.servers.lock().insert((node, channel), server);
        Ok(())
    }

    /// Close every bridge listener and its connections
    pub fn shutdown(&self, deadline: Instant) -> bool {
        self.closed.store(true, Ordering::SeqCst);
        let servers: Vec<_> = self.servers.lock().drain().map(|(_, s)| s).collect();
        let mut clean = true;
        for server in &servers {
            clean &= server.shutdown(deadline);
        }
        clean
    }
}

impl BridgeLauncher for BridgeServers {
    fn start_bridges(&self, session: &Arc<NodeSession>) -> Result<(), BridgeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BridgeError::ShutDown);
        }
        self.start(session, Channel::Auxio)?;
        self.start(session, Channel::Uart)?;
        info!("Node {}: bridge servers started", session.id());
        Ok(())
    }
}

struct BridgeHandler {
    node: NodeId,
    channel: Channel,
    session: Weak<NodeSession>,
}

impl LineHandler for BridgeHandler {
    fn on_connect(&self, conn: &Arc<Connection>) {
        if let Some(session) = self.session.upgrade() {
            info!(
                "Node {}: {} bridge connected from {}",
                self.node,
                self.channel,
                conn.peer_addr()
            );
            session.attach(self.channel, conn.clone());
        }
    }

    fn on_line(&self, _conn: &Arc<Connection>, line: &str) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        match self.channel {
            Channel::Uart => session.handle_host_line(line),
            _ => session.log_line(Level::DEBUG, line),
        }
    }

    fn on_disconnect(&self, conn: &Arc<Connection>) {
        if let Some(session) = self.session.upgrade() {
            if session.detach(self.channel, conn.id()) {
                warn!(
                    "Node {}: {} bridge connection from {} closed",
                    self.node,
                    self.channel,
                    conn.peer_addr()
                );
            }
        }
    }
}
