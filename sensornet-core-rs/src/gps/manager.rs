//! GPS manager: drives the CTU's receiver from power-up to trusted time
//!
//! The startup sequence runs on the manager's own worker thread:
//!
//! 1. wait for the CTU host to report ready
//! 2. start watching `$GPRMC` for clock drift, and set the receiver's clock
//!    if it is more than a minute off
//! 3. acquire satellites, escalating hot/warm/cold restarts on timeouts
//! 4. enter position-hold at the surveyed antenna position
//! 5. enable TRAIM and start judging its reports
//! 6. keep watching the satellite count
//!
//! TRAIM and position-hold reports arrive on reader threads; any corrective
//! command they trigger is queued back onto the worker, never run inline.
//! Every TRAIM report re-derives good time from
//! [`GpsSnapshot::time_is_trustworthy`](super::module::GpsSnapshot::time_is_trustworthy)
//! and reports the verdict to the run manager.

use super::module::{drift_within, GpsEvent, GpsModule, RestartKind, MAX_TIME_DRIFT_SECS};
use super::records::{TraimRecord, TraimStatus, MAX_TRAIM_ERROR_SECS};
use crate::config::{EarthCoords, SiteConfig};
use crate::flag::{Flag, WaitOutcome};
use crate::publisher::Issue;
use crate::runmgr::ReadinessHooks;
use crate::types::{now, NodeId, Timestamp};
use crate::worker::{Worker, WorkerHandle};
use chrono::Duration as ChronoDuration;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How far receiver time may be off before the manager resets its clock
pub const CLOCK_RESET_THRESHOLD_SECS: i64 = 60;

/// Satellite acquisition steps: optional restart, then how long to wait
pub const ACQUISITION_LADDER: [(Option<RestartKind>, Option<Duration>); 5] = [
    (None, Some(Duration::from_secs(5))),
    (Some(RestartKind::Hot), Some(Duration::from_secs(5))),
    (Some(RestartKind::Warm), Some(Duration::from_secs(40))),
    (Some(RestartKind::Cold), Some(Duration::from_secs(300))),
    (None, None),
];

/// Receiver operations the acquisition logic needs
pub trait GpsControl: Send + Sync {
    fn satellites(&self) -> Option<u32>;

    /// Wait for at least one satellite, giving up if `cancel` goes up
    fn wait_for_satellites(&self, timeout: Option<Duration>, cancel: &Flag) -> WaitOutcome;

    fn restart(&self, kind: RestartKind) -> bool;

    /// Receiver time minus system time, from the next fix
    fn time_delta(&self) -> Option<ChronoDuration>;

    fn init_pos_time(&self, loc: &EarthCoords, at: Timestamp) -> bool;
}

/// Adapts a [`GpsModule`] to [`GpsControl`] with the module's configured timeouts
pub struct ModuleControl {
    gps: Arc<GpsModule>,
    gprmc_timeout: Duration,
}

impl ModuleControl {
    pub fn new(gps: Arc<GpsModule>, gprmc_timeout: Duration) -> Self {
        Self { gps, gprmc_timeout }
    }
}

impl GpsControl for ModuleControl {
    fn satellites(&self) -> Option<u32> {
        self.gps.satellites()
    }

    fn wait_for_satellites(&self, timeout: Option<Duration>, cancel: &Flag) -> WaitOutcome {
        self.gps.got_sats.wait_up_unless(cancel, timeout)
    }

    fn restart(&self, kind: RestartKind) -> bool {
        self.gps.restart(kind)
    }

    fn time_delta(&self) -> Option<ChronoDuration> {
        let delta = self.gps.next_fix_delta(self.gprmc_timeout);
        if delta.is_none() {
            warn!(
                "GPS on node {}: no usable $GPRMC within {:?}",
                self.gps.node(),
                self.gprmc_timeout
            );
        }
        delta
    }

    fn init_pos_time(&self, loc: &EarthCoords, at: Timestamp) -> bool {
        self.gps.init_pos_time(loc, at)
    }
}

/// Set the receiver's clock from the system clock if it is far off
pub fn align_clock(gps: &dyn GpsControl, antenna: &EarthCoords) {
    let Some(delta) = gps.time_delta() else {
        return;
    };
    if !drift_within(delta, CLOCK_RESET_THRESHOLD_SECS) {
        warn!(
            "GPS clock is off by {:.3} s; initializing it from the system clock",
            seconds(delta)
        );
        gps.init_pos_time(antenna, now());
    }
}

/// Climb the acquisition ladder until a satellite is seen
///
/// Every restart is followed by a clock check, since restarts can lose
/// the receiver's notion of time.
pub fn acquire_satellites(gps: &dyn GpsControl, antenna: &EarthCoords, cancel: &Flag) -> WaitOutcome {
    if gps.satellites().unwrap_or(0) >= 1 {
        return WaitOutcome::Raised;
    }
    for (restart, wait) in ACQUISITION_LADDER {
        if let Some(kind) = restart {
            warn!("No satellites yet; trying a {:?} restart of the GPS", kind);
            gps.restart(kind);
            align_clock(gps, antenna);
        }
        match wait {
            Some(limit) => info!("Waiting up to {:?} for GPS satellites", limit),
            None => warn!("Still no GPS satellites; waiting indefinitely"),
        }
        match gps.wait_for_satellites(wait, cancel) {
            WaitOutcome::Raised => {
                info!("GPS has acquired satellites");
                return WaitOutcome::Raised;
            }
            WaitOutcome::Cancelled => return WaitOutcome::Cancelled,
            WaitOutcome::TimedOut => {}
        }
    }
    WaitOutcome::TimedOut
}

/// Judge a TRAIM report; true when it vouches for the receiver's timing
pub fn assess_traim(rec: &TraimRecord, satellites: Option<u32>) -> bool {
    match rec.solution {
        TraimStatus::UnderAlarm => debug!("TRAIM: all satellites within the alarm limit"),
        TraimStatus::OverAlarm => warn!("TRAIM: some satellites exceed the alarm limit"),
        TraimStatus::Unknown if rec.solution_code == 2 => {
            warn!("TRAIM: not enough satellites to judge timing")
        }
        TraimStatus::Unknown => error!("TRAIM: unrecognized solution code {}", rec.solution_code),
    }
    if !rec.is_valid() {
        warn!("TRAIM: solution is not valid");
    }
    if rec.all_satellites_bad(satellites) {
        warn!("TRAIM: all {} satellites in use are bad", rec.removed_satellites);
    } else if rec.removed_satellites > 0 {
        info!("TRAIM: ignoring {} bad satellites", rec.removed_satellites);
    }
    if !rec.uncertainty_in_range() {
        if rec.time_error > MAX_TRAIM_ERROR_SECS {
            warn!("TRAIM: time error {:.9} s exceeds 100 ns", rec.time_error);
        } else {
            warn!("TRAIM: no usable time error estimate ({})", rec.time_error);
        }
    }
    rec.vouches_for_time(satellites)
}

fn seconds(delta: ChronoDuration) -> f64 {
    delta.num_milliseconds() as f64 / 1000.0
}

struct ManagerInner {
    node: NodeId,
    gps: Arc<GpsModule>,
    control: ModuleControl,
    host_ready: Arc<Flag>,
    hooks: Arc<dyn ReadinessHooks>,
    antenna: EarthCoords,
    traim_threshold: Duration,
    turning_on_traim: Flag,
    turning_on_poshold: Flag,
    watching_traim: AtomicBool,
    watching_poshold: AtomicBool,
    worker: WorkerHandle,
}

/// Owns the manager's worker thread; dropping it stops the worker
pub struct GpsManager {
    inner: Arc<ManagerInner>,
    worker: Worker,
}

impl GpsManager {
    /// Spawn the manager's worker and queue the startup sequence on it
    pub fn start(
        gps: Arc<GpsModule>,
        host_ready: Arc<Flag>,
        hooks: Arc<dyn ReadinessHooks>,
        config: &SiteConfig,
    ) -> io::Result<Self> {
        let node = gps.node();
        let worker = Worker::spawn(format!("gps-manager-{}", node))?;
        let inner = Arc::new(ManagerInner::new(gps, host_ready, hooks, config, worker.handle()));

        let step = inner.clone();
        worker.submit(move || step.wait_host_ready());
        let step = inner.clone();
        worker.submit(move || step.initialize());
        let step = inner.clone();
        worker.submit(move || step.monitor());
        info!("GPS manager for node {} started", node);

        Ok(Self { inner, worker })
    }

    pub fn node(&self) -> NodeId {
        self.inner.node
    }

    pub fn stop(&self) {
        self.worker.stop();
    }

    pub fn join_until(&self, deadline: Instant) -> bool {
        self.worker.join_until(deadline)
    }
}

impl ManagerInner {
    fn new(
        gps: Arc<GpsModule>,
        host_ready: Arc<Flag>,
        hooks: Arc<dyn ReadinessHooks>,
        config: &SiteConfig,
        worker: WorkerHandle,
    ) -> Self {
        Self {
            node: gps.node(),
            control: ModuleControl::new(gps.clone(), config.gps.gprmc_timeout()),
            gps,
            host_ready,
            hooks,
            antenna: config.antenna,
            traim_threshold: config.traim_threshold(),
            turning_on_traim: Flag::new(false),
            turning_on_poshold: Flag::new(false),
            watching_traim: AtomicBool::new(false),
            watching_poshold: AtomicBool::new(false),
            worker,
        }
    }

    fn wait_host_ready(&self) {
        info!("GPS manager {}: waiting for the CTU host to be ready", self.node);
        match self.worker.wait_up(&self.host_ready, None) {
            WaitOutcome::Raised => info!("GPS manager {}: CTU host is ready", self.node),
            _ => debug!("GPS manager {}: stopped while waiting for host", self.node),
        }
    }

    fn initialize(self: &Arc<Self>) {
        self.watch_time();
        align_clock(&self.control, &self.antenna);

        let outcome = acquire_satellites(&self.control, &self.antenna, self.worker.stop_flag());
        if outcome != WaitOutcome::Raised {
            debug!("GPS manager {}: stopped during satellite acquisition", self.node);
            return;
        }

        self.turn_on_poshold();
        self.turn_on_traim();
    }

    fn monitor(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.gps
            .publisher()
            .subscribe("GPGGA", "gps-manager.check-satellites", move |issue: &Issue<GpsEvent>| {
                with_manager(&weak, |m| m.check_satellites(issue))
            });
        info!("GPS manager {}: initialization done, monitoring", self.node);
    }

    fn turn_on_poshold(self: &Arc<Self>) {
        self.turning_on_poshold.raise();
        if !self.gps.hold_position(&self.antenna) {
            error!("GPS manager {}: position-hold was not confirmed", self.node);
        }
        if !self.watching_poshold.swap(true, Ordering::SeqCst) {
            let weak = Arc::downgrade(self);
            self.gps.publisher().subscribe(
                "PDMEPOSHOLD",
                "gps-manager.check-poshold",
                move |issue: &Issue<GpsEvent>| with_manager(&weak, |m| m.check_poshold(issue)),
            );
        }
        self.turning_on_poshold.lower();
    }

    fn turn_on_traim(self: &Arc<Self>) {
        self.turning_on_traim.raise();
        if !self.gps.enable_traim(self.traim_threshold) {
            error!("GPS manager {}: TRAIM enable was not confirmed", self.node);
        }
        self.watch_traim();
        self.turning_on_traim.lower();
    }

    fn watch_time(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.gps
            .publisher()
            .subscribe("GPRMC", "gps-manager.check-time", move |issue: &Issue<GpsEvent>| {
                with_manager(&weak, |m| m.check_time(issue))
            });
    }

    fn watch_traim(self: &Arc<Self>) {
        if self.watching_traim.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(self);
        self.gps.publisher().subscribe(
            "PDMETRAIM",
            "gps-manager.check-traim",
            move |issue: &Issue<GpsEvent>| with_manager(&weak, |m| m.check_traim(issue)),
        );
    }

    /// Log drift on each fix; the time-good decision waits for the next TRAIM report
    fn check_time(&self, issue: &Issue<GpsEvent>) {
        let GpsEvent::Gprmc(_) = &issue.content else {
            return;
        };
        let Some(delta) = self.gps.snapshot().last_fix_delta else {
            return;
        };
        if drift_within(delta, MAX_TIME_DRIFT_SECS) {
            debug!("GPS time on node {} is within 10 s of system time", self.node);
        } else if delta < ChronoDuration::zero() {
            warn!(
                "GPS time on node {} is {:.3} s behind system time",
                self.node,
                -seconds(delta)
            );
        } else {
            warn!(
                "GPS time on node {} is {:.3} s ahead of system time",
                self.node,
                seconds(delta)
            );
        }
    }

    fn check_satellites(&self, issue: &Issue<GpsEvent>) {
        if let GpsEvent::Gpgga(rec) = &issue.content {
            debug!("GPS manager {}: {} satellites in use", self.node, rec.satellites);
        }
    }

    fn check_traim(self: &Arc<Self>, issue: &Issue<GpsEvent>) {
        let GpsEvent::Traim(rec) = &issue.content else {
            return;
        };
        assess_traim(rec, self.gps.satellites());
        if !rec.is_valid() && !self.turning_on_traim.is_up() {
            info!("GPS manager {}: TRAIM invalid; re-enabling it", self.node);
            self.turning_on_traim.raise();
            let me = self.clone();
            self.worker.submit(move || me.turn_on_traim());
        }
        if self.gps.snapshot().time_is_trustworthy() {
            self.hooks.on_gps_time_good();
        } else {
            self.hooks.on_gps_time_no_good();
        }
    }

    fn check_poshold(self: &Arc<Self>, issue: &Issue<GpsEvent>) {
        let GpsEvent::Poshold(rec) = &issue.content else {
            return;
        };
        if !rec.on && !self.turning_on_poshold.is_up() {
            warn!("GPS manager {}: position-hold is off; re-enabling it", self.node);
            self.turning_on_poshold.raise();
            let me = self.clone();
            self.worker.submit(move || me.turn_on_poshold());
        }
    }
}

fn with_manager<F>(weak: &Weak<ManagerInner>, f: F)
where
    F: FnOnce(&Arc<ManagerInner>),
{
    if let Some(manager) = weak.upgrade() {
        f(&manager);
    }
}
