//! Sensor host model: the CPU behind a node's UART
//!
//! A host starts out of unknown type and becomes a CTU or a shower detector
//! when it announces itself with `HOST_STARTING`. The change is one-way.
//! Handling a line never calls back into the session; anything that must
//! happen outside the node lock is returned as a [`HostEffect`].

pub mod ctu;
pub mod fedm;

use crate::flag::Flag;
use crate::gps::{GpsManager, GpsModule, HostLink};
use crate::nmea::{strip_nmea, NmeaError};
use crate::publisher::{Issue, Publisher};
use crate::session::SessionContext;
use crate::types::{HostType, NodeId};
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use ctu::{CtuHost, PpsCount};
pub use fedm::{DetectorEvent, PulseformChannel, ShowerDetectorHost, TimeSyncRef};

#[derive(Debug, Error)]
pub enum HostMessageError {
    #[error(transparent)]
    Nmea(#[from] NmeaError),

    #[error("{message} should have {expected} fields but has {got}")]
    FieldCount {
        message: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{message} field {field} is not a number: [{value}]")]
    BadNumber {
        message: &'static str,
        field: &'static str,
        value: String,
    },

    #[error("{message} names channel {channel}, but channels are numbered 1 to 3")]
    BadChannel { message: &'static str, channel: u64 },

    #[error("host type [{0}] is unknown; data from this host cannot be used")]
    UnknownHostType(String),

    #[error("cannot start GPS manager: {0}")]
    GpsManager(#[source] io::Error),
}

pub(crate) fn expect_args(
    words: &[String],
    message: &'static str,
    expected: usize,
) -> Result<(), HostMessageError> {
    let got = words.len().saturating_sub(1);
    if got != expected {
        return Err(HostMessageError::FieldCount {
            message,
            expected,
            got,
        });
    }
    Ok(())
}

pub(crate) fn parse_field<T: std::str::FromStr>(
    message: &'static str,
    field: &'static str,
    value: &str,
) -> Result<T, HostMessageError> {
    value.trim().parse().map_err(|_| HostMessageError::BadNumber {
        message,
        field,
        value: value.to_string(),
    })
}

/// Split a raw host line into comma-separated words
///
/// Returns `Ok(None)` for a line that is empty before or after NMEA
/// framing is removed.
pub fn parse_host_line(line: &str) -> Result<Option<Vec<String>>, HostMessageError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let body = strip_nmea(line)?;
    if body.is_empty() {
        warn!("Host line [{}] is empty once NMEA framing is removed", line);
        return Ok(None);
    }
    let body = if body.starts_with("PDMEHEADER") {
        body.replace(": ", ",")
    } else {
        body.to_string()
    };
    let mut words: Vec<String> = body.split(',').map(str::to_string).collect();
    // The last CON_PULSE field is a parenthesized list that contains commas.
    if body.starts_with("CON_PULSE") && words.len() > 7 {
        let tail = words.split_off(7).join(",");
        words.push(tail);
    }
    Ok(Some(words))
}

/// Work a host line asks for that must run outside the node lock
pub enum HostEffect {
    /// Send a line back to the host
    SendToHost(String),
    /// The CTU host just became ready
    CtuReady,
    /// A shower detector host just became ready
    DetectorReady,
    /// Hand a GPS sentence to the node's GPS model
    ToGps(Arc<GpsModule>, Vec<String>),
    PublishPps(Arc<Publisher<PpsCount>>, Issue<PpsCount>),
    PublishDetector(Arc<Publisher<DetectorEvent>>, Issue<DetectorEvent>),
}

pub enum HostKind {
    Unknown,
    Ctu(CtuHost),
    ShowerDetector(ShowerDetectorHost),
}

pub struct SensorHost {
    node: NodeId,
    /// Host type as reported by the firmware, e.g. `CTU_GPS` or `FEDM`
    pub firmware_type: Option<String>,
    pub firmware_version: Option<String>,
    pub starting: Arc<Flag>,
    pub ready: Arc<Flag>,
    kind: HostKind,
}

impl SensorHost {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            firmware_type: None,
            firmware_version: None,
            starting: Arc::new(Flag::new(false)),
            ready: Arc::new(Flag::new(false)),
            kind: HostKind::Unknown,
        }
    }

    pub fn host_type(&self) -> HostType {
        match self.kind {
            HostKind::Unknown => HostType::Unknown,
            HostKind::Ctu(_) => HostType::Ctu,
            HostKind::ShowerDetector(_) => HostType::ShowerDetector,
        }
    }

    pub fn ctu(&self) -> Option<&CtuHost> {
        match &self.kind {
            HostKind::Ctu(ctu) => Some(ctu),
            _ => None,
        }
    }

    pub fn detector(&self) -> Option<&ShowerDetectorHost> {
        match &self.kind {
            HostKind::ShowerDetector(det) => Some(det),
            _ => None,
        }
    }

    /// Handle one parsed host line
    ///
    /// `make_link` is only called when the host turns out to be a CTU and
    /// its GPS model needs a way to send commands.
    pub fn handle_words<L>(
        &mut self,
        words: Vec<String>,
        ctx: &SessionContext,
        make_link: L,
    ) -> Result<Vec<HostEffect>, HostMessageError>
    where
        L: FnOnce() -> Box<dyn HostLink>,
    {
        let Some(kind) = words.first().cloned() else {
            return Ok(Vec::new());
        };
        match &mut self.kind {
            HostKind::Ctu(ctu) => {
                if kind.starts_with("GP") || kind.starts_with("PDME") {
                    return Ok(vec![HostEffect::ToGps(ctu.gps().clone(), words)]);
                }
                if kind == "PPSCNTR" {
                    return Ok(vec![ctu.on_ppscntr(&words)?]);
                }
            }
            HostKind::ShowerDetector(det) => {
                if let Some(effect) = det.handle(&words)? {
                    return Ok(vec![effect]);
                }
            }
            HostKind::Unknown => {}
        }

        match kind.as_str() {
            "HOST_STARTING" => {
                self.on_starting(&words, ctx, make_link)?;
                Ok(Vec::new())
            }
            "HOST_READY" => Ok(self.on_ready()),
            "ACK" => {
                info!("Host of node {} acknowledges {:?}", self.node, &words[1..]);
                Ok(Vec::new())
            }
            "ERR" => {
                error!(
                    "Host of node {} reports a {} error with data [{}]",
                    self.node,
                    words.get(1).map(String::as_str).unwrap_or("?"),
                    words.get(2..).map(|rest| rest.join(",")).unwrap_or_default()
                );
                Ok(Vec::new())
            }
            other => {
                warn!("Host of node {} sent unknown message type [{}]; ignoring", self.node, other);
                Ok(Vec::new())
            }
        }
    }

    fn on_starting<L>(
        &mut self,
        words: &[String],
        ctx: &SessionContext,
        make_link: L,
    ) -> Result<(), HostMessageError>
    where
        L: FnOnce() -> Box<dyn HostLink>,
    {
        expect_args(words, "HOST_STARTING", 2)?;
        let raw_type = &words[1];
        let version = &words[2];
        let target = match raw_type.as_str() {
            "CTU_GPS" => HostType::Ctu,
            // FEDM boards are configured as shower detectors.
            "FEDM" => HostType::ShowerDetector,
            _ => return Err(HostMessageError::UnknownHostType(raw_type.clone())),
        };
        self.firmware_type = Some(raw_type.clone());
        self.firmware_version = Some(version.clone());
        info!(
            "Host of node {} (type {}, firmware version {}) is starting up",
            self.node, raw_type, version
        );

        let current = self.host_type();
        if current == HostType::Unknown {
            self.kind = match target {
                HostType::Ctu => {
                    debug!("Node {}'s host is a CTU host", self.node);
                    let gps = Arc::new(GpsModule::new(self.node, make_link(), ctx.config.gps.clone()));
                    let manager =
                        GpsManager::start(gps.clone(), self.ready.clone(), ctx.hooks.clone(), &ctx.config)
                            .map_err(HostMessageError::GpsManager)?;
                    HostKind::Ctu(CtuHost::new(self.node, gps, manager))
                }
                _ => {
                    debug!("Node {}'s host is a shower detector host", self.node);
                    HostKind::ShowerDetector(ShowerDetectorHost::new(self.node))
                }
            };
        } else if current != target {
            warn!(
                "Host of node {} is already a {} host; ignoring its claim to be {}",
                self.node, current, target
            );
        }
        self.starting.raise();
        Ok(())
    }

    fn on_ready(&mut self) -> Vec<HostEffect> {
        info!("Host of node {} is ready to accept commands", self.node);
        self.starting.lower();
        self.ready.raise();
        match self.kind {
            HostKind::Ctu(_) => vec![
                HostEffect::SendToHost("UNMUTE".to_string()),
                HostEffect::CtuReady,
            ],
            HostKind::ShowerDetector(_) => vec![HostEffect::DetectorReady],
            HostKind::Unknown => Vec::new(),
        }
    }

    /// Stop any background work owned by the host model
    pub fn stop(&self) {
        if let HostKind::Ctu(ctu) = &self.kind {
            ctu.manager().stop();
        }
    }

    /// The CTU's GPS manager, so it can be joined without holding the node lock
    pub fn gps_manager(&self) -> Option<Arc<GpsManager>> {
        self.ctu().map(|ctu| ctu.manager().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_and_nmea() {
        assert_eq!(
            parse_host_line("HOST_STARTING,CTU_GPS,1.2\r\n").unwrap(),
            Some(vec!["HOST_STARTING".into(), "CTU_GPS".into(), "1.2".into()])
        );
        assert_eq!(
            parse_host_line("$GPTXT,hello").unwrap(),
            Some(vec!["GPTXT".into(), "hello".into()])
        );
        assert_eq!(parse_host_line("   ").unwrap(), None);
        assert_eq!(parse_host_line("$").unwrap(), None);
    }

    #[test]
    fn test_parse_bad_checksum() {
        assert!(matches!(
            parse_host_line("$GPTXT,hello*00"),
            Err(HostMessageError::Nmea(NmeaError::BadChecksum { .. }))
        ));
    }

    #[test]
    fn test_parse_pdme_header() {
        assert_eq!(
            parse_host_line("$PDMEHEADER1: DeLORME GPS2058_HW_1.0.1").unwrap(),
            Some(vec!["PDMEHEADER1".into(), "DeLORME GPS2058_HW_1.0.1".into()])
        );
    }

    #[test]
    fn test_parse_con_pulse_rejoins_tail() {
        let words = parse_host_line("CON_PULSE,3186,3462552667,3,1,3462608072,2,(0,(2,2),5)")
            .unwrap()
            .unwrap();
        assert_eq!(words.len(), 8);
        assert_eq!(words[7], "(0,(2,2),5)");
    }
}
