//! WiFi board state and outbound routing for one node
//!
//! A node can be reached over up to three TCP connections: the main
//! command connection it opened to the server, and the AUXIO and UART
//! bridge connections it opens to its per-node bridge ports. Which one a
//! line goes out on depends on the reported bridge mode.

use crate::types::{BridgeMode, NodeId, Timestamp};
use std::fmt;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Something a text line can be written to
pub trait LineSink: Send + Sync {
    /// Write `line` followed by a newline
    fn send_line(&self, line: &str) -> io::Result<()>;

    /// Identifier unique among live connections
    fn id(&self) -> u64;

    /// Remote address, for logs
    fn peer(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Main,
    Auxio,
    Uart,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Main => write!(f, "main"),
            Channel::Auxio => write!(f, "AUXIO"),
            Channel::Uart => write!(f, "UART"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no open connection reaches the node's script")]
    NoScriptRoute,

    #[error("bridge mode {0} offers no route to the host")]
    NoHostRoute(BridgeMode),

    #[error("write on {channel} connection failed: {source}")]
    Write {
        channel: Channel,
        #[source]
        source: io::Error,
    },
}

pub struct WiFiModule {
    node: NodeId,
    pub bridge_mode: BridgeMode,
    pub turned_on_at: Option<Timestamp>,
    bridges_started: bool,
    main: Option<Arc<dyn LineSink>>,
    auxio: Option<Arc<dyn LineSink>>,
    uart: Option<Arc<dyn LineSink>>,
}

impl WiFiModule {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            bridge_mode: BridgeMode::Unknown,
            turned_on_at: None,
            bridges_started: false,
            main: None,
            auxio: None,
            uart: None,
        }
    }

    /// Record a power-on. Returns true if bridge servers still need starting.
    pub fn turned_on(&mut self, when: Timestamp) -> bool {
        self.turned_on_at = Some(when);
        !self.bridges_started
    }

    pub fn mark_bridges_started(&mut self) {
        self.bridges_started = true;
    }

    pub fn bridges_started(&self) -> bool {
        self.bridges_started
    }

    pub fn connection(&self, channel: Channel) -> Option<&Arc<dyn LineSink>> {
        self.slot(channel).as_ref()
    }

    pub fn is_open(&self, channel: Channel) -> bool {
        self.slot(channel).is_some()
    }

    /// Install a connection, replacing any previous one on that channel
    pub fn attach(&mut self, channel: Channel, conn: Arc<dyn LineSink>) {
        debug!("Node {}: {} connection from {}", self.node, channel, conn.peer());
        *self.slot_mut(channel) = Some(conn);
    }

    /// Drop the connection on `channel` if it is still the one with `conn_id`
    pub fn detach(&mut self, channel: Channel, conn_id: u64) -> bool {
        let slot = self.slot_mut(channel);
        if slot.as_ref().map(|c| c.id()) == Some(conn_id) {
            *slot = None;
            true
        } else {
            false
        }
    }

    /// Channel a script-level line would go out on right now
    pub fn script_route(&self) -> Option<Channel> {
        if self.bridge_mode == BridgeMode::Trefoil && self.uart.is_some() {
            Some(Channel::Uart)
        } else if self.auxio.is_some() {
            Some(Channel::Auxio)
        } else if self.main.is_some() {
            Some(Channel::Main)
        } else {
            None
        }
    }

    /// Send a line to the node's script
    pub fn send_script(&mut self, line: &str) -> Result<Channel, RouteError> {
        let channel = self.script_route().ok_or(RouteError::NoScriptRoute)?;
        self.send_on(channel, line)?;
        Ok(channel)
    }

    /// Send a line to the sensor host behind the node's UART
    ///
    /// Raw over the UART bridge when the mode bridges it and the bridge is
    /// connected; otherwise wrapped as `HOST <line>` for the script to relay.
    pub fn send_host(&mut self, line: &str) -> Result<Channel, RouteError> {
        match self.bridge_mode {
            BridgeMode::Uart | BridgeMode::Flyover | BridgeMode::Trefoil
                if self.uart.is_some() =>
            {
                self.send_on(Channel::Uart, line)?;
                Ok(Channel::Uart)
            }
            BridgeMode::Default | BridgeMode::Trefoil | BridgeMode::None => {
                self.send_script(&format!("HOST {}", line))
            }
            mode => Err(RouteError::NoHostRoute(mode)),
        }
    }

    fn send_on(&mut self, channel: Channel, line: &str) -> Result<(), RouteError> {
        let Some(conn) = self.slot(channel).clone() else {
            return Err(RouteError::NoScriptRoute);
        };
        if let Err(source) = conn.send_line(line) {
            warn!(
                "Node {}: {} connection to {} failed; dropping it",
                self.node,
                channel,
                conn.peer()
            );
            self.detach(channel, conn.id());
            return Err(RouteError::Write { channel, source });
        }
        Ok(())
    }

    fn slot(&self, channel: Channel) -> &Option<Arc<dyn LineSink>> {
        match channel {
            Channel::Main => &self.main,
            Channel::Auxio => &self.auxio,
            Channel::Uart => &self.uart,
        }
    }

    fn slot_mut(&mut self, channel: Channel) -> &mut Option<Arc<dyn LineSink>> {
        match channel {
            Channel::Main => &mut self.main,
            Channel::Auxio => &mut self.auxio,
            Channel::Uart => &mut self.uart,
        }
    }
}

/// In-memory sink used by tests across the crate
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT_ID: AtomicU64 = AtomicU64::new(1);

    pub(crate) struct RecordingSink {
        id: u64,
        pub lines: Mutex<Vec<String>>,
        pub broken: bool,
    }

    impl RecordingSink {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                lines: Mutex::new(Vec::new()),
                broken: false,
            })
        }

        pub(crate) fn broken() -> Arc<Self> {
            Arc::new(Self {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                lines: Mutex::new(Vec::new()),
                broken: true,
            })
        }

        pub(crate) fn sent(&self) -> Vec<String> {
            self.lines.lock().clone()
        }
    }

    impl LineSink for RecordingSink {
        fn send_line(&self, line: &str) -> io::Result<()> {
            if self.broken {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"));
            }
            self.lines.lock().push(line.to_string());
            Ok(())
        }

        fn id(&self) -> u64 {
            self.id
        }

        fn peer(&self) -> String {
            format!("test-sink-{}", self.id)
        }
    }
}
