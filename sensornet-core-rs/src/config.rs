//! Site configuration
//!
//! All fields have working defaults, so a JSON file only needs to carry the
//! values a site overrides.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::types::NodeId;

/// Default port for the main command channel
pub const DEFAULT_MAIN_PORT: u16 = 26766;

/// Base port of the per-node AUXIO bridge (node N listens on base + N)
pub const DEFAULT_AUXIO_BASE_PORT: u16 = 52737;

/// Base port of the per-node UART bridge (node N listens on base + N)
pub const DEFAULT_UART_BASE_PORT: u16 = 63766;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Geodetic position: degrees north, degrees east, metres above sea level
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EarthCoords {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

impl EarthCoords {
    pub const fn new(lat: f64, lon: f64, alt: f64) -> Self {
        Self { lat, lon, alt }
    }
}

/// Split signed decimal degrees into whole degrees and unsigned minutes
pub fn deg_to_degmin(deg: f64) -> (i64, f64) {
    let whole = deg.trunc();
    (whole as i64, (deg - whole).abs() * 60.0)
}

/// Timeouts used by the GPS manager when talking to the receiver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpsTimings {
    /// How long to wait for a `$PDME` acknowledgement
    pub ack_timeout_secs: u64,
    /// How long a restart may take before the receiver reports in again
    pub reset_timeout_secs: u64,
    /// How long to wait for the next `$GPRMC` when measuring clock offset
    pub gprmc_timeout_secs: u64,
}

impl Default for GpsTimings {
    fn default() -> Self {
        Self {
            ack_timeout_secs: 10,
            reset_timeout_secs: 60,
            gprmc_timeout_secs: 10,
        }
    }
}

impl GpsTimings {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }

    pub fn gprmc_timeout(&self) -> Duration {
        Duration::from_secs(self.gprmc_timeout_secs)
    }
}

/// Server configuration for one installation site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub bind_ip: IpAddr,
    pub main_port: u16,
    pub auxio_base_port: u16,
    pub uart_base_port: u16,
    /// Surveyed position of the CTU's GPS antenna
    pub antenna: EarthCoords,
    /// TRAIM alarm threshold in nanoseconds
    pub traim_threshold_ns: u64,
    /// Directory for per-node log files; per-node lines go to tracing when unset
    pub log_dir: Option<PathBuf>,
    pub gps: GpsTimings,
    pub shutdown_timeout_secs: u64,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            main_port: DEFAULT_MAIN_PORT,
            auxio_base_port: DEFAULT_AUXIO_BASE_PORT,
            uart_base_port: DEFAULT_UART_BASE_PORT,
            // Physics building rooftop, Tallahassee
            antenna: EarthCoords::new(30.428236, -84.285, 40.0),
            traim_threshold_ns: 62,
            log_dir: None,
            gps: GpsTimings::default(),
            shutdown_timeout_secs: 5,
        }
    }
}

impl SiteConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    pub fn with_main_port(mut self, port: u16) -> Self {
        self.main_port = port;
        self
    }

    pub fn with_bridge_base_ports(mut self, auxio: u16, uart: u16) -> Self {
        self.auxio_base_port = auxio;
        self.uart_base_port = uart;
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// AUXIO bridge port for a node, if it fits in a port number
    pub fn auxio_port(&self, node: NodeId) -> Option<u16> {
        offset_port(self.auxio_base_port, node)
    }

    /// UART bridge port for a node, if it fits in a port number
    pub fn uart_port(&self, node: NodeId) -> Option<u16> {
        offset_port(self.uart_base_port, node)
    }

    pub fn traim_threshold(&self) -> Duration {
        Duration::from_nanos(self.traim_threshold_ns)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn offset_port(base: u16, node: NodeId) -> Option<u16> {
    u16::try_from(node).ok().and_then(|n| base.checked_add(n))
}
