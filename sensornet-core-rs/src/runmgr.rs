//! Run coordinator
//!
//! A run starts once the CTU host is ready, a detector host is ready and
//! the GPS reports trustworthy time. The startup sequence is queued on the
//! coordinator's worker when it is created and checks the three conditions
//! in that fixed order, however the producers interleave.

use crate::flag::{Flag, WaitOutcome};
use crate::types::NodeId;
use crate::watchbox::WatchBox;
use crate::worker::{Worker, WorkerHandle};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Readiness signals raised by node sessions and the GPS manager
pub trait ReadinessHooks: Send + Sync {
    fn on_ctu_ready(&self, node: NodeId);
    fn on_detector_ready(&self, node: NodeId);
    fn on_gps_time_good(&self);
    fn on_gps_time_no_good(&self);
}

/// Collaborators the coordinator starts, in order, once the run is cleared
pub trait RunControl: Send + Sync {
    fn start_timekeeper(&self);
    fn start_data_collector(&self);
    /// Tell the CTU on `node` to start the run
    fn start_ctu(&self, node: NodeId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    WaitingCtu,
    WaitingDetector,
    WaitingTime,
    StartingTimekeeper,
    StartingCollector,
    StartingCtu,
    Started,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunPhase::WaitingCtu => "waiting for CTU",
            RunPhase::WaitingDetector => "waiting for detector",
            RunPhase::WaitingTime => "waiting for good GPS time",
            RunPhase::StartingTimekeeper => "starting timekeeper",
            RunPhase::StartingCollector => "starting data collector",
            RunPhase::StartingCtu => "starting CTU",
            RunPhase::Started => "started",
        };
        write!(f, "{}", s)
    }
}

struct RunState {
    ctu_ready: Flag,
    detector_ready: Flag,
    good_time: Flag,
    ctu_node: Mutex<Option<NodeId>>,
    phase: Arc<WatchBox<RunPhase>>,
    control: Arc<dyn RunControl>,
    worker: WorkerHandle,
}

pub struct RunManager {
    state: Arc<RunState>,
    worker: Worker,
}

impl RunManager {
    /// Spawn the coordinator and queue the whole startup sequence
    pub fn start(control: Arc<dyn RunControl>) -> io::Result<Self> {
        let worker = Worker::spawn("run-manager")?;
        let phase = Arc::new(WatchBox::new());
        phase.set(RunPhase::WaitingCtu);
        let state = Arc::new(RunState {
            ctu_ready: Flag::new(false),
            detector_ready: Flag::new(false),
            good_time: Flag::new(false),
            ctu_node: Mutex::new(None),
            phase,
            control,
            worker: worker.handle(),
        });

        let s = state.clone();
        worker.submit(move || s.wait_for(RunPhase::WaitingCtu, &s.ctu_ready));
        let s = state.clone();
        worker.submit(move || s.wait_for(RunPhase::WaitingDetector, &s.detector_ready));
        let s = state.clone();
        worker.submit(move || s.wait_for(RunPhase::WaitingTime, &s.good_time));
        let s = state.clone();
        worker.submit(move || s.start_timekeeper());
        let s = state.clone();
        worker.submit(move || s.start_collector());
        let s = state.clone();
        worker.submit(move || s.start_ctu());

        Ok(Self { state, worker })
    }

    pub fn phase(&self) -> &Arc<WatchBox<RunPhase>> {
        &self.state.phase
    }

    /// Node that most recently reported a ready CTU host
    pub fn ctu_node(&self) -> Option<NodeId> {
        *self.state.ctu_node.lock()
    }

    pub fn stop(&self) {
        self.worker.stop();
    }

    pub fn join_until(&self, deadline: Instant) -> bool {
        self.worker.join_until(deadline)
    }
}

impl ReadinessHooks for RunManager {
    fn on_ctu_ready(&self, node: NodeId) {
        info!("Run manager: CTU on node {} is ready", node);
        *self.state.ctu_node.lock() = Some(node);
        self.state.ctu_ready.raise();
    }

    fn on_detector_ready(&self, node: NodeId) {
        info!("Run manager: shower detector on node {} is ready", node);
        self.state.detector_ready.raise();
    }

    fn on_gps_time_good(&self) {
        if !self.state.good_time.is_up() {
            info!("Run manager: GPS time is good");
        }
        self.state.good_time.raise();
    }

    fn on_gps_time_no_good(&self) {
        if self.state.good_time.is_up() {
            warn!("Run manager: GPS time is no longer good");
        }
        self.state.good_time.lower();
    }
}

impl RunState {
    fn enter(&self, phase: RunPhase) {
        debug!("Run manager: {}", phase);
        self.phase.set(phase);
    }

    fn wait_for(&self, phase: RunPhase, flag: &Flag) {
        self.enter(phase);
        if self.worker.wait_up(flag, None) != WaitOutcome::Raised {
            debug!("Run manager: stopped while {}", phase);
        }
    }

    fn start_timekeeper(&self) {
        self.enter(RunPhase::StartingTimekeeper);
        self.control.start_timekeeper();
    }

    fn start_collector(&self) {
        self.enter(RunPhase::StartingCollector);
        self.control.start_data_collector();
    }

    fn start_ctu(&self) {
        self.enter(RunPhase::StartingCtu);
        let Some(node) = *self.ctu_node.lock() else {
            error!("Run manager: no CTU node recorded; cannot start the run");
            return;
        };
        self.control.start_ctu(node);
        self.enter(RunPhase::Started);
        info!("Run manager: run started");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingControl {
        calls: Mutex<Vec<String>>,
    }

    impl RunControl for RecordingControl {
        fn start_timekeeper(&self) {
            self.calls.lock().push("timekeeper".into());
        }
        fn start_data_collector(&self) {
            self.calls.lock().push("collector".into());
        }
        fn start_ctu(&self, node: NodeId) {
            self.calls.lock().push(format!("ctu{}", node));
        }
    }

    fn wait_started(mgr: &RunManager) -> bool {
        let mut watcher = mgr.phase().watch();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if mgr.phase().latest() == Some(RunPhase::Started) {
                return true;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            watcher.wait_next(Some(left));
        }
    }

    #[test]
    fn test_gate_opens_in_any_raise_order() {
        let orders: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            let control = Arc::new(RecordingControl::default());
            let mgr = RunManager::start(control.clone()).unwrap();
            for step in order {
                match step {
                    0 => mgr.on_ctu_ready(0),
                    1 => mgr.on_detector_ready(2),
                    _ => mgr.on_gps_time_good(),
                }
            }
            assert!(wait_started(&mgr), "order {:?}", order);
            assert_eq!(*control.calls.lock(), vec!["timekeeper", "collector", "ctu0"]);
            mgr.stop();
            assert!(mgr.join_until(Instant::now() + Duration::from_secs(5)));
        }
    }

    #[test]
    fn test_start_fires_once() {
        let control = Arc::new(RecordingControl::default());
        let mgr = RunManager::start(control.clone()).unwrap();
        for _ in 0..3 {
            mgr.on_gps_time_good();
            mgr.on_detector_ready(1);
            mgr.on_ctu_ready(0);
        }
        assert!(wait_started(&mgr));
        mgr.on_ctu_ready(0);
        mgr.on_gps_time_good();
        thread::sleep(Duration::from_millis(50));
        let ctu_starts = control.calls.lock().iter().filter(|c| *c == "ctu0").count();
        assert_eq!(ctu_starts, 1);
    }

    #[test]
    fn test_gate_holds_without_good_time() {
        let control = Arc::new(RecordingControl::default());
        let mgr = RunManager::start(control.clone()).unwrap();
        mgr.on_ctu_ready(0);
        mgr.on_detector_ready(1);
        mgr.on_gps_time_good();
        mgr.on_gps_time_no_good();

        let mut watcher = mgr.phase().watch();
        while mgr.phase().latest() != Some(RunPhase::WaitingTime) {
            assert!(watcher.wait_next(Some(Duration::from_secs(5))).is_some());
        }
        thread::sleep(Duration::from_millis(100));
        assert!(control.calls.lock().is_empty());

        mgr.on_gps_time_good();
        assert!(wait_started(&mgr));
    }

    #[test]
    fn test_stop_while_waiting() {
        let control = Arc::new(RecordingControl::default());
        let mgr = RunManager::start(control.clone()).unwrap();
        mgr.stop();
        assert!(mgr.join_until(Instant::now() + Duration::from_secs(5)));
        assert!(control.calls.lock().is_empty());
        assert_eq!(mgr.phase().latest(), Some(RunPhase::WaitingCtu));
    }
}
