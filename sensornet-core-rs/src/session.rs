//! Per-node session state
//!
//! One [`NodeSession`] exists per node number for the life of the process.
//! All of a node's fields, its WiFi board model and its host model sit
//! behind a single lock. Work that calls out of the session (hooks, GPS
//! sentence handling, replies to the host) runs after that lock is
//! released, so nothing reachable from it can deadlock on the node.

use crate::bridge::BridgeLauncher;
use crate::config::SiteConfig;
use crate::gps::HostLink;
use crate::host::{parse_host_line, HostEffect, SensorHost};
use crate::nodelog::NodeLog;
use crate::runmgr::ReadinessHooks;
use crate::types::{BridgeMode, HostType, NodeId, NodeStatus, Timestamp};
use crate::wifi::{Channel, LineSink, RouteError, WiFiModule};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, error, info, warn, Level};

/// Services every node session is wired to
pub struct SessionContext {
    pub config: SiteConfig,
    pub hooks: Arc<dyn ReadinessHooks>,
    pub node_log: Arc<dyn NodeLog>,
    pub bridges: Arc<dyn BridgeLauncher>,
}

/// Mutable state of one node, guarded by the session lock
pub struct NodeState {
    pub ip: Option<String>,
    pub mac: Option<String>,
    pub status: NodeStatus,
    pub first_seen: Option<Timestamp>,
    pub on_at: Option<Timestamp>,
    pub last_seen: Option<Timestamp>,
    /// Last heartbeat sequence number and when it arrived
    pub last_heartbeat: Option<(u64, Timestamp)>,
    pub wifi: WiFiModule,
    pub host: SensorHost,
}

impl NodeState {
    fn saw_at(&mut self, when: Timestamp) {
        self.first_seen.get_or_insert(when);
        self.last_seen = Some(when);
        self.status = self.status.renewed();
    }
}

/// Point-in-time copy of a node's state for display and logs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub ip: Option<String>,
    pub mac: Option<String>,
    pub status: NodeStatus,
    pub first_seen: Option<Timestamp>,
    pub on_at: Option<Timestamp>,
    pub last_seen: Option<Timestamp>,
    pub last_heartbeat: Option<u64>,
    pub bridge_mode: String,
    pub host_type: String,
    pub host_ready: bool,
}

pub struct NodeSession {
    id: NodeId,
    me: Weak<NodeSession>,
    ctx: Arc<SessionContext>,
    state: Mutex<NodeState>,
}

/// Host link handed to a CTU's GPS model
struct SessionLink(Weak<NodeSession>);

impl HostLink for SessionLink {
    fn send_host_line(&self, line: &str) {
        if let Some(session) = self.0.upgrade() {
            if let Err(e) = session.send_host(line) {
                error!("Node {}: cannot send [{}] to host: {}", session.id, line, e);
            }
        }
    }
}

impl NodeSession {
    pub fn new(id: NodeId, ctx: Arc<SessionContext>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            me: me.clone(),
            ctx,
            state: Mutex::new(NodeState {
                ip: None,
                mac: None,
                status: NodeStatus::Unseen,
                first_seen: None,
                on_at: None,
                last_seen: None,
                last_heartbeat: None,
                wifi: WiFiModule::new(id),
                host: SensorHost::new(id),
            }),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn ip(&self) -> Option<String> {
        self.state.lock().ip.clone()
    }

    pub fn status(&self) -> NodeStatus {
        self.state.lock().status
    }

    /// Run `f` against the node's state under the session lock
    ///
    /// `f` must not call back into this session or the registry.
    pub fn inspect<R>(&self, f: impl FnOnce(&NodeState) -> R) -> R {
        f(&self.state.lock())
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let state = self.state.lock();
        NodeSnapshot {
            id: self.id,
            ip: state.ip.clone(),
            mac: state.mac.clone(),
            status: state.status,
            first_seen: state.first_seen,
            on_at: state.on_at,
            last_seen: state.last_seen,
            last_heartbeat: state.last_heartbeat.map(|(seq, _)| seq),
            bridge_mode: state.wifi.bridge_mode.to_string(),
            host_type: state.host.host_type().to_string(),
            host_ready: state.host.ready.is_up(),
        }
    }

    /// Move the node to a new IP address
    pub fn relocate(&self, ip: &str) {
        self.state.lock().ip = Some(ip.to_string());
    }

    /// Note that the node was heard from at `when`; clears any AWOL status
    pub fn saw_at(&self, when: Timestamp) {
        self.state.lock().saw_at(when);
    }

    /// Mark a node that was never seen powering on as on
    ///
    /// Returns false if the node had already been seen.
    pub fn assume_on(&self) -> bool {
        let mut state = self.state.lock();
        if state.status != NodeStatus::Unseen {
            return false;
        }
        state.status = NodeStatus::On;
        true
    }

    /// Handle a power-on report
    ///
    /// Bridge servers for the node are started the first time it powers on.
    /// They are launched after the session lock is released.
    pub fn turn_on(&self, mac: &str, when: Timestamp, main_conn: Option<Arc<dyn LineSink>>) {
        info!("Node {} turned on at {}", self.id, when.format("%Y-%m-%d %H:%M:%S"));
        let need_bridges = {
            let mut state = self.state.lock();
            match state.mac.as_deref() {
                Some(known) if known != mac => warn!(
                    "Node {} reports MAC address {} but had {}",
                    self.id, mac, known
                ),
                _ => {}
            }
            state.mac = Some(mac.to_string());
            state.status = NodeStatus::On;
            state.on_at = Some(when);
            state.saw_at(when);
            if let Some(conn) = main_conn {
                state.wifi.attach(Channel::Main, conn);
            }
            state.wifi.turned_on(when)
        };
        let Some(me) = self.me.upgrade().filter(|_| need_bridges) else {
            return;
        };
        match self.ctx.bridges.start_bridges(&me) {
            Ok(()) => self.state.lock().wifi.mark_bridges_started(),
            Err(e) => error!("Node {}: cannot start bridge servers: {}", self.id, e),
        }
    }

    pub fn record_heartbeat(&self, seq: u64, when: Timestamp) {
        let mut state = self.state.lock();
        if let Some((last, _)) = state.last_heartbeat {
            if seq != last.wrapping_add(1) {
                debug!("Node {}: heartbeat {} follows {}", self.id, seq, last);
            }
        }
        state.last_heartbeat = Some((seq, when));
    }

    pub fn set_bridge_mode(&self, mode: BridgeMode) {
        let mut state = self.state.lock();
        if state.wifi.bridge_mode != mode {
            info!(
                "Node {}: bridge mode {} -> {}",
                self.id, state.wifi.bridge_mode, mode
            );
        }
        if mode == BridgeMode::Unsupported {
            warn!("Node {} is in a bridge mode the server does not support", self.id);
        }
        state.wifi.bridge_mode = mode;
    }

    /// Mark the node as collecting data
    pub fn mark_running(&self) {
        let mut state = self.state.lock();
        if state.status == NodeStatus::On {
            state.status = NodeStatus::Running;
        }
    }

    /// Mark the node as silent; cleared on the next message from it
    pub fn mark_awol(&self) {
        let mut state = self.state.lock();
        let next = state.status.gone_awol();
        if next != state.status {
            warn!("Node {} has gone silent ({})", self.id, next);
        }
        state.status = next;
    }

    pub fn attach(&self, channel: Channel, conn: Arc<dyn LineSink>) {
        self.state.lock().wifi.attach(channel, conn);
    }

    /// Forget a closed connection. Returns false if it was already replaced.
    pub fn detach(&self, channel: Channel, conn_id: u64) -> bool {
        self.state.lock().wifi.detach(channel, conn_id)
    }

    pub fn send_host(&self, line: &str) -> Result<Channel, RouteError> {
        debug!("Node {}: to host: {}", self.id, line);
        self.state.lock().wifi.send_host(line)
    }

    pub fn send_script(&self, line: &str) -> Result<Channel, RouteError> {
        debug!("Node {}: to script: {}", self.id, line);
        self.state.lock().wifi.send_script(line)
    }

    /// Write a line to the node's own log
    pub fn log_line(&self, level: Level, line: &str) {
        self.ctx.node_log.log(self.id, level, line);
    }

    /// Handle one line received from the node's sensor host
    pub fn handle_host_line(&self, line: &str) {
        let words = match parse_host_line(line) {
            Ok(Some(words)) => words,
            Ok(None) => return,
            Err(e) => {
                error!("Node {}: dropping host line [{}]: {}", self.id, line.trim(), e);
                return;
            }
        };
        let me = self.me.clone();
        let effects = {
            let mut state = self.state.lock();
            state.host.handle_words(words, &self.ctx, move || -> Box<dyn HostLink> {
                Box::new(SessionLink(me))
            })
        };
        match effects {
            Ok(effects) => self.apply(effects),
            Err(e) => error!("Node {}: dropping host line [{}]: {}", self.id, line.trim(), e),
        }
    }

    fn apply(&self, effects: Vec<HostEffect>) {
        for effect in effects {
            match effect {
                HostEffect::SendToHost(line) => {
                    if let Err(e) = self.send_host(&line) {
                        warn!("Node {}: cannot send [{}] to host: {}", self.id, line, e);
                    }
                }
                HostEffect::CtuReady => self.ctx.hooks.on_ctu_ready(self.id),
                HostEffect::DetectorReady => self.ctx.hooks.on_detector_ready(self.id),
                HostEffect::ToGps(gps, words) => gps.handle_sentence(&words),
                HostEffect::PublishPps(publisher, issue) => {
                    publisher.publish(issue);
                }
                HostEffect::PublishDetector(publisher, issue) => {
                    publisher.publish(issue);
                }
            }
        }
    }

    pub fn host_type(&self) -> HostType {
        self.state.lock().host.host_type()
    }

    /// Tell background work owned by the node to stop
    pub fn stop(&self) {
        self.state.lock().host.stop();
    }

    pub fn join_until(&self, deadline: Instant) -> bool {
        let manager = self.state.lock().host.gps_manager();
        manager.map_or(true, |m| m.join_until(deadline))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::bridge::BridgeError;
    use crate::nodelog::MemoryNodeLog;

    #[derive(Default)]
    pub(crate) struct RecordingHooks {
        pub events: Mutex<Vec<String>>,
    }

    impl ReadinessHooks for RecordingHooks {
        fn on_ctu_ready(&self, node: NodeId) {
            self.events.lock().push(format!("ctu{}", node));
        }
        fn on_detector_ready(&self, node: NodeId) {
            self.events.lock().push(format!("detector{}", node));
        }
        fn on_gps_time_good(&self) {
            self.events.lock().push("good".into());
        }
        fn on_gps_time_no_good(&self) {
            self.events.lock().push("no-good".into());
        }
    }

    #[derive(Default)]
    pub(crate) struct CountingBridges {
        pub started: Mutex<Vec<NodeId>>,
    }

    impl BridgeLauncher for CountingBridges {
        fn start_bridges(&self, session: &Arc<NodeSession>) -> Result<(), BridgeError> {
            self.started.lock().push(session.id());
            Ok(())
        }
    }

    pub(crate) struct TestContext {
        pub ctx: Arc<SessionContext>,
        pub hooks: Arc<RecordingHooks>,
        pub log: Arc<MemoryNodeLog>,
        pub bridges: Arc<CountingBridges>,
    }

    pub(crate) fn context() -> TestContext {
        let hooks = Arc::new(RecordingHooks::default());
        let log = Arc::new(MemoryNodeLog::new());
        let bridges = Arc::new(CountingBridges::default());
        let ctx = Arc::new(SessionContext {
            config: SiteConfig::default(),
            hooks: hooks.clone(),
            node_log: log.clone(),
            bridges: bridges.clone(),
        });
        TestContext {
            ctx,
            hooks,
            log,
            bridges,
        }
    }
}
