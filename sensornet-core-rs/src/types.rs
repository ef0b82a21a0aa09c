//! Core types shared across the sensor network server

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::Level;

/// Node number as reported by the node firmware (0 is the central timing unit)
pub type NodeId = u32;

/// Wall-clock timestamp used for sightings, heartbeats and power-on events
pub type Timestamp = DateTime<Utc>;

/// Current wall-clock time
pub fn now() -> Timestamp {
    Utc::now()
}

/// Lifecycle status of a node as seen by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    /// Known by number only; no message received yet
    Unseen,
    /// Powered on, not yet collecting
    On,
    /// Collecting data
    Running,
    /// Powered on but silent for too long
    OnAwol,
    /// Collecting but silent for too long
    RunningAwol,
}

impl NodeStatus {
    /// Status after the node has been heard from again
    pub fn renewed(self) -> Self {
        match self {
            NodeStatus::OnAwol => NodeStatus::On,
            NodeStatus::RunningAwol => NodeStatus::Running,
            other => other,
        }
    }

    /// Status after the node has gone silent
    pub fn gone_awol(self) -> Self {
        match self {
            NodeStatus::On => NodeStatus::OnAwol,
            NodeStatus::Running => NodeStatus::RunningAwol,
            other => other,
        }
    }

    pub fn is_awol(self) -> bool {
        matches!(self, NodeStatus::OnAwol | NodeStatus::RunningAwol)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeStatus::Unseen => "UNSEEN",
            NodeStatus::On => "ON",
            NodeStatus::Running => "RUNNING",
            NodeStatus::OnAwol => "ON_AWOL",
            NodeStatus::RunningAwol => "RUNNING_AWOL",
        };
        f.write_str(name)
    }
}

/// How the node's WiFi board relays traffic between the server and its host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeMode {
    /// Not reported yet
    Unknown,
    /// Script relays host lines over the main/AUXIO channel
    Default,
    /// No bridging
    None,
    /// Reported a mode the server does not understand
    Unsupported,
    /// Raw UART bridge only
    Uart,
    /// UART bridge plus script channel
    Trefoil,
    /// UART bridge, script bypassed
    Flyover,
}

impl BridgeMode {
    /// Map the token a node reports in `BRIDGE_MODE` to a mode
    pub fn from_wire(token: &str) -> Self {
        match token {
            "NORMAL" => BridgeMode::Default,
            "UART-ONLY" => BridgeMode::Uart,
            "NONE" => BridgeMode::None,
            "TREFOIL" => BridgeMode::Trefoil,
            "FLYOVER" => BridgeMode::Flyover,
            _ => BridgeMode::Unsupported,
        }
    }
}

impl fmt::Display for BridgeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BridgeMode::Unknown => "UNKNOWN",
            BridgeMode::Default => "DEFAULT",
            BridgeMode::None => "NONE",
            BridgeMode::Unsupported => "UNSUPPORTED",
            BridgeMode::Uart => "UART",
            BridgeMode::Trefoil => "TREFOIL",
            BridgeMode::Flyover => "FLYOVER",
        };
        f.write_str(name)
    }
}

/// Kind of sensor host attached to a node's UART
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostType {
    Unknown,
    /// Central timing unit with the GPS receiver
    Ctu,
    /// Front-end digitizer board of a shower detector
    ShowerDetector,
}

impl fmt::Display for HostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostType::Unknown => write!(f, "unknown"),
            HostType::Ctu => write!(f, "CTU"),
            HostType::ShowerDetector => write!(f, "shower detector"),
        }
    }
}

/// Map a node-supplied log level name to a tracing level
///
/// Names are case-insensitive. Returns `None` for names not in the table.
pub fn parse_log_level(name: &str) -> Option<Level> {
    match name.to_ascii_uppercase().as_str() {
        "TRACE" => Some(Level::TRACE),
        "DEBUG" => Some(Level::DEBUG),
        "INFO" | "NORMAL" => Some(Level::INFO),
        "WARN" | "WARNING" => Some(Level::WARN),
        "ERROR" | "CRITICAL" | "FATAL" => Some(Level::ERROR),
        _ => None,
    }
}
