//! End-to-end scenarios across the command layer, sessions, the run
//! manager and the TCP server.

use parking_lot::Mutex;
use sensornet_core::bridge::{BridgeError, BridgeLauncher};
use sensornet_core::nodelog::MemoryNodeLog;
use sensornet_core::wifi::Channel;
use sensornet_core::{
    now, BridgeMode, Dispatcher, HostType, InboundLine, NodeId, NodeSession, NodeStatus, ReadinessHooks,
    RunControl, RunManager, RunPhase, SensorNet, Server, SessionContext, SiteConfig,
};
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

struct NoBridges;

impl BridgeLauncher for NoBridges {
    fn start_bridges(&self, _session: &Arc<NodeSession>) -> Result<(), BridgeError> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingControl {
    ctu_starts: Mutex<Vec<NodeId>>,
}

impl RunControl for RecordingControl {
    fn start_timekeeper(&self) {}
    fn start_data_collector(&self) {}
    fn start_ctu(&self, node: NodeId) {
        self.ctu_starts.lock().push(node);
    }
}

struct Rig {
    net: Arc<SensorNet>,
    dispatcher: Dispatcher,
    log: Arc<MemoryNodeLog>,
    run: Arc<RunManager>,
    control: Arc<RecordingControl>,
}

fn rig() -> Rig {
    let control = Arc::new(RecordingControl::default());
    let run = Arc::new(RunManager::start(control.clone()).unwrap());
    let log = Arc::new(MemoryNodeLog::new());
    let ctx = Arc::new(SessionContext {
        config: SiteConfig::default(),
        hooks: run.clone(),
        node_log: log.clone(),
        bridges: Arc::new(NoBridges),
    });
    let net = Arc::new(SensorNet::new(ctx));
    Rig {
        dispatcher: Dispatcher::new(net.clone()),
        net,
        log,
        run,
        control,
    }
}

fn from_node(line: &str) -> InboundLine {
    InboundLine::new(line, "192.168.0.10", now())
}

fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_power_on_then_log_message() {
    let rig = rig();
    rig.dispatcher
        .dispatch(from_node("POWERED_ON 0 192.168.0.10 aa:bb:cc:dd:ee:ff"))
        .unwrap();
    rig.dispatcher
        .dispatch(from_node("LOGMSG 0 INFO 2 hello world"))
        .unwrap();

    let node = rig.net.get(0).expect("node 0 registered");
    assert_eq!(node.ip().as_deref(), Some("192.168.0.10"));
    assert_eq!(node.status(), NodeStatus::On);
    assert_eq!(rig.log.lines_for(0), vec!["Node 0:     hello world"]);
}

#[test]
fn test_bridge_mode_changes() {
    let rig = rig();
    rig.dispatcher
        .dispatch(from_node("BRIDGE_MODE 1 UART-ONLY"))
        .unwrap();
    let node = rig.net.get(1).unwrap();
    assert_eq!(node.inspect(|s| s.wifi.bridge_mode), BridgeMode::Uart);

    rig.dispatcher
        .dispatch(from_node("BRIDGE_MODE 1 TREFOIL"))
        .unwrap();
    assert_eq!(node.inspect(|s| s.wifi.bridge_mode), BridgeMode::Trefoil);
}

#[test]
fn test_power_on_is_idempotent() {
    let rig = rig();
    let when = now();
    let line = "POWERED_ON 3 192.168.0.10 aa:bb:cc:dd:ee:03";
    rig.dispatcher
        .dispatch(InboundLine::new(line, "192.168.0.10", when))
        .unwrap();
    let once = rig.net.snapshots();
    rig.dispatcher
        .dispatch(InboundLine::new(line, "192.168.0.10", when))
        .unwrap();
    assert_eq!(rig.net.snapshots(), once);
}

#[test]
fn test_run_starts_when_ctu_detector_and_time_are_ready() {
    let rig = rig();
    rig.dispatcher
        .dispatch(InboundLine::new("POWERED_ON 0 10.0.0.1 aa:00", "10.0.0.1", now()))
        .unwrap();
    rig.dispatcher
        .dispatch(InboundLine::new("POWERED_ON 2 10.0.0.2 aa:02", "10.0.0.2", now()))
        .unwrap();
    let ctu = rig.net.get(0).unwrap();
    let detector = rig.net.get(2).unwrap();

    detector.handle_host_line("HOST_STARTING,FEDM,2.0");
    detector.handle_host_line("HOST_READY");
    rig.run.on_gps_time_good();
    ctu.handle_host_line("HOST_STARTING,CTU_GPS,1.0");
    assert_eq!(ctu.host_type(), HostType::Ctu);
    thread::sleep(Duration::from_millis(50));
    assert!(rig.control.ctu_starts.lock().is_empty());

    ctu.handle_host_line("HOST_READY");
    eventually("run start", || rig.run.phase().latest() == Some(RunPhase::Started));
    assert_eq!(*rig.control.ctu_starts.lock(), vec![0]);

    rig.run.stop();
    rig.net.shutdown(Instant::now() + Duration::from_millis(200));
}

#[test]
fn test_server_accepts_nodes_and_bridges() {
    let config = SiteConfig::default()
        .with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .with_main_port(0)
        .with_bridge_base_ports(0, 0);
    let server = Server::start(config).unwrap();

    let mut main = TcpStream::connect(server.local_addr()).unwrap();
    main.write_all(b"POWERED_ON 0 127.0.0.1 aa:bb:cc:dd:ee:ff\n")
        .unwrap();
    eventually("node 0 on", || {
        server.net().get(0).map(|n| n.status()) == Some(NodeStatus::On)
    });
    let node = server.net().get(0).unwrap();
    assert!(node.inspect(|s| s.wifi.is_open(Channel::Main)));

    let uart_addr = server.bridges().local_addr(0, Channel::Uart).unwrap();
    let mut uart = TcpStream::connect(uart_addr).unwrap();
    uart.write_all(b"HOST_STARTING,FEDM,1.0\r\nHOST_READY\r\n")
        .unwrap();
    eventually("detector ready", || node.inspect(|s| s.host.ready.is_up()));
    assert_eq!(node.host_type(), HostType::ShowerDetector);
    assert!(node.inspect(|s| s.wifi.is_open(Channel::Uart)));

    drop(uart);
    eventually("UART detach", || !node.inspect(|s| s.wifi.is_open(Channel::Uart)));

    let addr = server.local_addr();
    assert!(server.shutdown(Duration::from_secs(5)));
    assert!(TcpStream::connect(addr).is_err());
    drop(main);
}
