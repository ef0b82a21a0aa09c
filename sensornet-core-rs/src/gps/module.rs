//! Server-side model of the CTU's GPS receiver
//!
//! Incoming sentences update the model and are published by type. Outgoing
//! `$PDME` commands go through the node's host link as `GPS <sentence>`
//! and block until the receiver acknowledges them or a timeout expires.

use super::records::{
    parse_gptxt, GpggaRecord, GprmcRecord, GpsParseError, HeaderRecord, PdmeCode, PdmeParse,
    PdmeReply, PosholdRecord, TraimRecord, TraimStatus,
};
use crate::config::{deg_to_degmin, EarthCoords, GpsTimings};
use crate::flag::Flag;
use crate::nmea::make_nmea;
use crate::publisher::{Issue, Publisher};
use crate::types::{NodeId, Timestamp};
use crate::watchbox::WatchBox;
use chrono::{Datelike, Duration as ChronoDuration, Timelike, Utc};
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Offset added to the system clock when initialising the receiver's time
const INIT_TIME_LEAD_SECS: i64 = 17;

/// Line path from the server to the node's sensor host
pub trait HostLink: Send + Sync {
    fn send_host_line(&self, line: &str);
}

/// Restart depth of the receiver, shallowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartKind {
    /// Keep ephemeris and almanac
    Hot,
    /// Discard ephemeris
    Warm,
    /// Discard ephemeris and almanac
    Cold,
}

/// A decoded GPS sentence as published to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum GpsEvent {
    Gprmc(GprmcRecord),
    Gpgga(GpggaRecord),
    Pdme(PdmeReply),
    Traim(TraimRecord),
    Poshold(PosholdRecord),
    Header(HeaderRecord),
    Text(String),
}

impl GpsEvent {
    /// Publication title: the sentence type the event came from
    pub fn title(&self) -> &'static str {
        match self {
            GpsEvent::Gprmc(_) => "GPRMC",
            GpsEvent::Gpgga(_) => "GPGGA",
            GpsEvent::Pdme(_) => "PDME",
            GpsEvent::Traim(_) => "PDMETRAIM",
            GpsEvent::Poshold(_) => "PDMEPOSHOLD",
            GpsEvent::Header(_) => "PDMEHEADER",
            GpsEvent::Text(_) => "GPTXT",
        }
    }
}

/// How far receiver time may drift from system time and still be trusted
pub const MAX_TIME_DRIFT_SECS: i64 = 10;

/// Whether `delta` lies within `limit_secs` either side of zero
pub fn drift_within(delta: ChronoDuration, limit_secs: i64) -> bool {
    let limit = ChronoDuration::seconds(limit_secs);
    delta <= limit && delta >= -limit
}

/// Fields guarded by the module's lock
#[derive(Debug, Clone, Default)]
struct GpsState {
    satellites: Option<u32>,
    last_satellites: Option<u32>,
    traim: Option<TraimRecord>,
    last_fix_delta: Option<ChronoDuration>,
}

/// Point-in-time copy of the receiver model
#[derive(Debug, Clone, PartialEq)]
pub struct GpsSnapshot {
    pub satellites: Option<u32>,
    pub has_satellite_lock: bool,
    pub poshold_enabled: bool,
    pub traim_enabled: bool,
    pub resetting: bool,
    pub ephemeris_good: bool,
    pub almanac_good: bool,
    /// Receiver time minus system time at the last `$GPRMC`
    pub last_fix_delta: Option<ChronoDuration>,
    /// Last `$PDMETRAIM` report
    pub traim: Option<TraimRecord>,
}

impl GpsSnapshot {
    pub fn traim_status(&self) -> Option<TraimStatus> {
        self.traim.as_ref().map(|t| t.solution)
    }

    pub fn traim_valid(&self) -> bool {
        self.traim.as_ref().is_some_and(TraimRecord::is_valid)
    }

    pub fn bad_satellites(&self) -> u32 {
        self.traim.as_ref().map_or(0, |t| t.removed_satellites)
    }

    pub fn reported_uncertainty(&self) -> Option<Duration> {
        self.traim
            .as_ref()
            .filter(|t| t.time_error > 0.0)
            .and_then(|t| Duration::try_from_secs_f64(t.time_error).ok())
    }

    /// Whether the receiver's time can be trusted for run timing
    ///
    /// Needs a TRAIM report that vouches for the timing and a last fix
    /// within [`MAX_TIME_DRIFT_SECS`] of system time.
    pub fn time_is_trustworthy(&self) -> bool {
        let traim_ok = self
            .traim
            .as_ref()
            .is_some_and(|t| t.vouches_for_time(self.satellites));
        traim_ok
            && self
                .last_fix_delta
                .is_some_and(|d| drift_within(d, MAX_TIME_DRIFT_SECS))
    }
}

pub struct GpsModule {
    node: NodeId,
    link: Box<dyn HostLink>,
    timings: GpsTimings,
    state: Mutex<GpsState>,
    pub resetting: Flag,
    pub got_sats: Flag,
    pub poshold_on: Flag,
    pub traim_on: Flag,
    pub ephemeris_good: Flag,
    pub almanac_good: Flag,
    pdme_inbox: WatchBox<PdmeReply>,
    gprmc_inbox: WatchBox<GprmcRecord>,
    publisher: Publisher<GpsEvent>,
}

impl GpsModule {
    pub fn new(node: NodeId, link: Box<dyn HostLink>, timings: GpsTimings) -> Self {
        Self {
            node,
            link,
            timings,
            state: Mutex::new(GpsState::default()),
            resetting: Flag::new(false),
            got_sats: Flag::new(false),
            poshold_on: Flag::new(false),
            traim_on: Flag::new(false),
            ephemeris_good: Flag::new(true),
            almanac_good: Flag::new(true),
            pdme_inbox: WatchBox::new(),
            gprmc_inbox: WatchBox::new(),
            publisher: Publisher::new(format!("gps{}", node)),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn publisher(&self) -> &Publisher<GpsEvent> {
        &self.publisher
    }

    pub fn satellites(&self) -> Option<u32> {
        self.state.lock().satellites
    }

    pub fn snapshot(&self) -> GpsSnapshot {
        let state = self.state.lock().clone();
        GpsSnapshot {
            satellites: state.satellites,
            has_satellite_lock: self.got_sats.is_up(),
            poshold_enabled: self.poshold_on.is_up(),
            traim_enabled: self.traim_on.is_up(),
            resetting: self.resetting.is_up(),
            ephemeris_good: self.ephemeris_good.is_up(),
            almanac_good: self.almanac_good.is_up(),
            last_fix_delta: state.last_fix_delta,
            traim: state.traim,
        }
    }

    /// Handle one sentence from the receiver, already split into words
    pub fn handle_sentence(&self, words: &[String]) {
        let Some(kind) = words.first() else {
            return;
        };
        let result = match kind.as_str() {
            "GPRMC" => self.on_gprmc(words),
            "GPGGA" => self.on_gpgga(words),
            "PDME" => self.on_pdme(words),
            "PDMETRAIM" => self.on_traim(words),
            "PDMEPOSHOLD" => self.on_poshold(words),
            "PDMEHEADER1" => self.on_header(words, 1),
            "PDMEHEADER2" => self.on_header(words, 2),
            "GPTXT" => self.on_gptxt(words),
            other => {
                warn!(
                    "GPS on node {} sent a ${} sentence, which is not handled; ignoring",
                    self.node, other
                );
                Ok(())
            }
        };
        if let Err(e) = result {
            error!("GPS on node {}: {}; ignoring sentence", self.node, e);
        }
    }

    fn publish(&self, event: GpsEvent) {
        self.publisher.publish(Issue::new(event.title(), event));
    }

    fn on_gprmc(&self, words: &[String]) -> Result<(), GpsParseError> {
        let rec = GprmcRecord::parse(words)?;
        let fix_time = rec.datetime()?;
        let delta = fix_time - Utc::now().naive_utc();
        self.state.lock().last_fix_delta = Some(delta);
        self.gprmc_inbox.set(rec.clone());
        self.publish(GpsEvent::Gprmc(rec));
        Ok(())
    }

    fn on_gpgga(&self, words: &[String]) -> Result<(), GpsParseError> {
        let rec = GpggaRecord::parse(words)?;
        {
            let mut state = self.state.lock();
            let n = rec.satellites;
            if state.last_satellites != Some(n) {
                if n == 0 {
                    warn!("GPS on node {} is not receiving any satellites", self.node);
                } else {
                    info!("GPS on node {} now receiving {} satellites", self.node, n);
                }
                state.last_satellites = Some(n);
            } else if n == 0 {
                warn!("GPS on node {}: still no satellites", self.node);
            }
            state.satellites = Some(n);
            self.got_sats.set(n >= 1);
        }
        self.publish(GpsEvent::Gpgga(rec));
        Ok(())
    }

    fn on_pdme(&self, words: &[String]) -> Result<(), GpsParseError> {
        match PdmeReply::parse(words)? {
            PdmeParse::Extended => {
                info!(
                    "GPS on node {}: extended $PDME reply [{}]; ignoring",
                    self.node,
                    words.join(",")
                );
            }
            PdmeParse::Reply(reply) => {
                if !reply.ok {
                    warn!(
                        "GPS on node {}: $PDME,{} replied [{}] instead of OK",
                        self.node,
                        reply.code,
                        words.get(2).map(String::as_str).unwrap_or("")
                    );
                }
                self.pdme_inbox.set(reply.clone());
                self.publish(GpsEvent::Pdme(reply));
            }
        }
        Ok(())
    }

    fn on_traim(&self, words: &[String]) -> Result<(), GpsParseError> {
        let rec = TraimRecord::parse(words)?;
        self.state.lock().traim = Some(rec.clone());
        self.publish(GpsEvent::Traim(rec));
        Ok(())
    }

    fn on_poshold(&self, words: &[String]) -> Result<(), GpsParseError> {
        let rec = PosholdRecord::parse(words)?;
        self.publish(GpsEvent::Poshold(rec));
        Ok(())
    }

    fn on_header(&self, words: &[String], num: u8) -> Result<(), GpsParseError> {
        let rec = HeaderRecord::parse(words, num)?;
        info!("GPS on node {} is resetting: {}", self.node, rec.version);
        self.resetting.raise();
        if num == 1 {
            // A reset clears both modes.
            self.poshold_on.lower();
            self.traim_on.lower();
        }
        self.publish(GpsEvent::Header(rec));
        Ok(())
    }

    fn on_gptxt(&self, words: &[String]) -> Result<(), GpsParseError> {
        let text = parse_gptxt(words)?;
        debug!("GPS on node {}: {}", self.node, text);
        self.publish(GpsEvent::Text(text));
        // Last line of the reset banner.
        self.resetting.lower();
        Ok(())
    }

    /// Wait for the next `$GPRMC` and return receiver time minus system time
    pub fn next_fix_delta(&self, timeout: Duration) -> Option<ChronoDuration> {
        let seen = self.gprmc_inbox.generation();
        debug!("GPS on node {}: waiting for next $GPRMC", self.node);
        let (_, rec) = self.gprmc_inbox.wait_after(seen, Some(timeout))?;
        match rec.datetime() {
            Ok(fix_time) => Some(fix_time - Utc::now().naive_utc()),
            Err(e) => {
                error!("GPS on node {}: {}", self.node, e);
                None
            }
        }
    }

    pub fn restart(&self, kind: RestartKind) -> bool {
        self.resetting.raise();
        let code = match kind {
            RestartKind::Hot => PdmeCode::HotStart,
            RestartKind::Warm => {
                self.ephemeris_good.lower();
                PdmeCode::WarmStart
            }
            RestartKind::Cold => {
                self.ephemeris_good.lower();
                self.almanac_good.lower();
                PdmeCode::ColdStart
            }
        };
        self.command(code, &[])
    }

    /// Enter position-hold mode at `loc`
    pub fn hold_position(&self, loc: &EarthCoords) -> bool {
        let confirmed = self.command(PdmeCode::PositionHold, &position_hold_args(loc));
        if confirmed {
            self.poshold_on.raise();
        }
        confirmed
    }

    /// Enable TRAIM with the given alarm threshold
    pub fn enable_traim(&self, threshold: Duration) -> bool {
        let confirmed = self.command(PdmeCode::Traim, &traim_args(threshold));
        if confirmed {
            self.traim_on.raise();
        }
        confirmed
    }

    /// Tell the receiver where it is and what time it is
    pub fn init_pos_time(&self, loc: &EarthCoords, at: Timestamp) -> bool {
        info!("Initializing clock of GPS on node {} to {} (UTC)", self.node, at);
        self.command(PdmeCode::InitPosTime, &init_pos_time_args(loc, at))
    }

    fn send_pdme(&self, code: PdmeCode, args: &[String]) {
        let mut body = format!("PDME,{}", code.code());
        for arg in args {
            body.push(',');
            body.push_str(arg);
        }
        let sentence = make_nmea(&body, false);
        debug!("GPS on node {}: sending {}", self.node, sentence);
        self.link.send_host_line(&format!("GPS {}", sentence));
    }

    /// Send a command and wait for the receiver to confirm it
    fn command(&self, code: PdmeCode, args: &[String]) -> bool {
        let seen = self.pdme_inbox.generation();
        self.send_pdme(code, args);
        if code.is_restart() {
            return self.wait_reset_done(code);
        }
        match self.pdme_inbox.wait_after(seen, Some(self.timings.ack_timeout())) {
            None => {
                error!(
                    "GPS on node {}: no reply to $PDME,{} within {:?}",
                    self.node,
                    code.code(),
                    self.timings.ack_timeout()
                );
                false
            }
            Some((_, reply)) if reply.code != code.code() => {
                error!(
                    "GPS on node {}: sent $PDME,{} but the next reply was for $PDME,{}",
                    self.node,
                    code.code(),
                    reply.code
                );
                false
            }
            Some((_, reply)) if !reply.ok => {
                error!("GPS on node {}: $PDME,{} was refused", self.node, code.code());
                false
            }
            Some(_) => {
                info!("GPS on node {}: $PDME,{} acknowledged", self.node, code.code());
                true
            }
        }
    }

    fn wait_reset_done(&self, code: PdmeCode) -> bool {
        if self.resetting.wait_down(Some(self.timings.reset_timeout())) {
            info!("GPS on node {}: restart $PDME,{} completed", self.node, code.code());
            true
        } else {
            error!(
                "GPS on node {}: still resetting {:?} after $PDME,{}",
                self.node,
                self.timings.reset_timeout(),
                code.code()
            );
            false
        }
    }
}

/// `1,DDMM.mmm,N|S,DDDMM.mmm,E|W,AAAA`
pub fn position_hold_args(loc: &EarthCoords) -> Vec<String> {
    let (lat_deg, lat_min) = deg_to_degmin(loc.lat.abs());
    let (lon_deg, lon_min) = deg_to_degmin(loc.lon.abs());
    vec![
        "1".to_string(),
        format!("{:02}{:06.3}", lat_deg, lat_min),
        if loc.lat >= 0.0 { "N" } else { "S" }.to_string(),
        format!("{:03}{:06.3}", lon_deg, lon_min),
        if loc.lon >= 0.0 { "E" } else { "W" }.to_string(),
        format!("{:04}", loc.alt.round() as i64),
    ]
}

/// `1,<threshold seconds to 9 places>`
pub fn traim_args(threshold: Duration) -> Vec<String> {
    vec!["1".to_string(), format!("{:.9}", threshold.as_secs_f64())]
}

/// `lat,lon,alt,YYYY,MM,DD,hh,mm,ss.sss,` with the time pushed ahead slightly
pub fn init_pos_time_args(loc: &EarthCoords, at: Timestamp) -> Vec<String> {
    let t = at + ChronoDuration::seconds(INIT_TIME_LEAD_SECS);
    let seconds = f64::from(t.second()) + f64::from(t.nanosecond() % 1_000_000_000) / 1e9;
    vec![
        format!("{:02}", loc.lat.trunc() as i64),
        format!("{:03}", loc.lon.trunc() as i64),
        format!("{}", loc.alt.trunc() as i64),
        format!("{:04}", t.year()),
        format!("{:02}", t.month()),
        format!("{:02}", t.day()),
        format!("{:02}", t.hour()),
        format!("{:02}", t.minute()),
        format!("{:06.3}", seconds),
        String::new(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gps::records::MAX_TRAIM_ERROR_SECS;
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::thread;

    #[derive(Default)]
    struct CapturingLink {
        lines: Mutex<Vec<String>>,
    }

    impl HostLink for Arc<CapturingLink> {
        fn send_host_line(&self, line: &str) {
            self.lines.lock().push(line.to_string());
        }
    }

    fn words(line: &str) -> Vec<String> {
        line.split(',').map(str::to_string).collect()
    }

    fn module(timings: GpsTimings) -> (Arc<GpsModule>, Arc<CapturingLink>) {
        let link = Arc::new(CapturingLink::default());
        let gps = Arc::new(GpsModule::new(0, Box::new(link.clone()), timings));
        (gps, link)
    }

    fn quick_timings() -> GpsTimings {
        GpsTimings {
            ack_timeout_secs: 2,
            reset_timeout_secs: 2,
            gprmc_timeout_secs: 2,
        }
    }

    #[test]
    fn test_position_hold_format() {
        let args = position_hold_args(&EarthCoords::new(30.428236, -84.285, 40.0));
        assert_eq!(args.join(","), "1,3025.694,N,08417.100,W,0040");
    }

    #[test]
    fn test_traim_format() {
        assert_eq!(traim_args(Duration::from_nanos(62)).join(","), "1,0.000000062");
    }

    #[test]
    fn test_init_pos_time_format() {
        let at = Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 50).unwrap();
        let args = init_pos_time_args(&EarthCoords::new(30.428236, -84.285, 40.0), at);
        assert_eq!(args.join(","), "30,-84,40,2024,03,01,00,00,07.000,");
    }

    #[test]
    fn test_gpgga_updates_satellites() {
        let (gps, _) = module(quick_timings());
        gps.handle_sentence(&words("GPGGA,123519,4807.038,N,01131.000,E,1,00,0.9,545.4,M,46.9,M,,"));
        assert_eq!(gps.satellites(), Some(0));
        assert!(!gps.got_sats.is_up());
        gps.handle_sentence(&words("GPGGA,123520,4807.038,N,01131.000,E,1,05,0.9,545.4,M,46.9,M,,"));
        assert_eq!(gps.satellites(), Some(5));
        assert!(gps.got_sats.is_up());
    }

    #[test]
    fn test_malformed_sentence_leaves_state() {
        let (gps, _) = module(quick_timings());
        gps.handle_sentence(&words("GPGGA,1,2,3"));
        assert_eq!(gps.satellites(), None);
    }

    #[test]
    fn test_reset_banner_toggles_resetting() {
        let (gps, _) = module(quick_timings());
        gps.traim_on.raise();
        gps.handle_sentence(&words("PDMEHEADER1,DeLORME GPS2058_HW_1.0.1"));
        assert!(gps.resetting.is_up());
        assert!(!gps.traim_on.is_up());
        gps.handle_sentence(&words("GPTXT,COSMICi Custom_Config_0.0.3"));
        assert!(!gps.resetting.is_up());
    }

    #[test]
    fn test_traim_snapshot() {
        let (gps, _) = module(quick_timings());
        gps.handle_sentence(&words("PDMETRAIM,0,1,0.000000020,0,0,0,0,0,0,0,0,0,0,0,0,0"));
        let snap = gps.snapshot();
        assert_eq!(snap.traim_status(), Some(TraimStatus::UnderAlarm));
        assert!(snap.traim_valid());
        let uncertainty = snap.reported_uncertainty().unwrap();
        assert!((uncertainty.as_secs_f64() - 20e-9).abs() < 1e-12);
        // No $GPRMC yet, so the drift is unknown.
        assert!(!snap.time_is_trustworthy());
    }

    #[test]
    fn test_trustworthy_time_needs_everything() {
        let (gps, _) = module(quick_timings());
        gps.handle_sentence(&words("GPGGA,123519,4807.038,N,01131.000,E,1,06,0.9,545.4,M,46.9,M,,"));
        gps.handle_sentence(&words("PDMETRAIM,0,1,0.000000020,0,0,0,0,0,0,0,0,0,0,0,0,0"));
        gps.traim_on.raise();
        let now = Utc::now();
        let gprmc = format!(
            "GPRMC,{},A,3025.694,N,08417.097,W,0.0,0.0,{},,",
            now.format("%H%M%S.000"),
            now.format("%d%m%y")
        );
        gps.handle_sentence(&words(&gprmc));
        assert!(gps.snapshot().time_is_trustworthy());

        gps.handle_sentence(&words("PDMETRAIM,1,1,0.000000020,6,0,0,0,0,0,0,0,0,0,0,0,0"));
        assert!(!gps.snapshot().time_is_trustworthy());
    }

    fn trusted_snapshot() -> GpsSnapshot {
        let traim = TraimRecord::parse(&words(
            "PDMETRAIM,0,1,0.000000020,0,0,0,0,0,0,0,0,0,0,0,0,0",
        ))
        .unwrap();
        GpsSnapshot {
            satellites: Some(6),
            has_satellite_lock: true,
            poshold_enabled: true,
            traim_enabled: true,
            resetting: false,
            ephemeris_good: true,
            almanac_good: true,
            last_fix_delta: Some(ChronoDuration::milliseconds(250)),
            traim: Some(traim),
        }
    }

    #[test]
    fn test_trust_needs_uncertainty_in_range() {
        let snap = trusted_snapshot();
        assert!(snap.time_is_trustworthy());
        for error in [500e-9, 0.0, -5e-9, f64::NAN] {
            let mut snap = trusted_snapshot();
            if let Some(t) = snap.traim.as_mut() {
                t.time_error = error;
            }
            assert!(!snap.time_is_trustworthy(), "time error {} trusted", error);
        }
        let mut snap = trusted_snapshot();
        if let Some(t) = snap.traim.as_mut() {
            t.time_error = MAX_TRAIM_ERROR_SECS;
        }
        assert!(snap.time_is_trustworthy());
    }

    #[test]
    fn test_trust_uses_full_drift() {
        let mut snap = trusted_snapshot();
        snap.last_fix_delta = Some(ChronoDuration::seconds(10));
        assert!(snap.time_is_trustworthy());
        snap.last_fix_delta = Some(ChronoDuration::milliseconds(10_900));
        assert!(!snap.time_is_trustworthy());
        snap.last_fix_delta = Some(ChronoDuration::milliseconds(-10_001));
        assert!(!snap.time_is_trustworthy());
        snap.last_fix_delta = None;
        assert!(!snap.time_is_trustworthy());
    }

    #[test]
    fn test_huge_traim_error_is_applied_without_panic() {
        let (gps, _) = module(quick_timings());
        gps.handle_sentence(&words("PDMETRAIM,0,1,1e30,0,0,0,0,0,0,0,0,0,0,0,0,0"));
        let snap = gps.snapshot();
        assert!(snap.traim_valid());
        assert_eq!(snap.reported_uncertainty(), None);
        assert!(!snap.time_is_trustworthy());

        gps.handle_sentence(&words("PDMETRAIM,0,1,inf,0,0,0,0,0,0,0,0,0,0,0,0,0"));
        assert!(gps.snapshot().traim.is_some_and(|t| t.time_error == 1e30));
    }

    #[test]
    fn test_command_acknowledged() {
        let (gps, link) = module(quick_timings());
        let replier = {
            let gps = gps.clone();
            let link = link.clone();
            thread::spawn(move || {
                while link.lines.lock().is_empty() {
                    thread::sleep(Duration::from_millis(5));
                }
                gps.handle_sentence(&words("PDME,22,OK"));
            })
        };
        assert!(gps.enable_traim(Duration::from_nanos(62)));
        assert!(gps.traim_on.is_up());
        assert_eq!(*link.lines.lock(), vec!["GPS $PDME,22,1,0.000000062"]);
        replier.join().unwrap();
    }

    #[test]
    fn test_command_rejects_mismatched_reply() {
        let (gps, link) = module(quick_timings());
        let replier = {
            let gps = gps.clone();
            let link = link.clone();
            thread::spawn(move || {
                while link.lines.lock().is_empty() {
                    thread::sleep(Duration::from_millis(5));
                }
                gps.handle_sentence(&words("PDME,9,OK"));
            })
        };
        assert!(!gps.hold_position(&EarthCoords::new(30.0, -84.0, 40.0)));
        assert!(!gps.poshold_on.is_up());
        replier.join().unwrap();
    }

    #[test]
    fn test_command_times_out() {
        let (gps, _) = module(GpsTimings {
            ack_timeout_secs: 0,
            reset_timeout_secs: 0,
            gprmc_timeout_secs: 0,
        });
        assert!(!gps.init_pos_time(&EarthCoords::new(0.0, 0.0, 0.0), Utc::now()));
    }

    #[test]
    fn test_cold_restart_waits_for_banner() {
        let (gps, link) = module(quick_timings());
        let banner = {
            let gps = gps.clone();
            let link = link.clone();
            thread::spawn(move || {
                while link.lines.lock().is_empty() {
                    thread::sleep(Duration::from_millis(5));
                }
                gps.handle_sentence(&words("PDMEHEADER1,DeLORME GPS2058_HW_1.0.1"));
                gps.handle_sentence(&words("PDMEHEADER2,DeLORME GPS2058_FW_2.0.1"));
                gps.handle_sentence(&words("GPTXT,COSMICi Custom_Config_0.0.3"));
            })
        };
        assert!(gps.restart(RestartKind::Cold));
        assert!(!gps.ephemeris_good.is_up());
        assert!(!gps.almanac_good.is_up());
        assert_eq!(*link.lines.lock(), vec!["GPS $PDME,0"]);
        banner.join().unwrap();
    }
}
