//! Server assembly and shutdown
//!
//! [`Server::start`] wires the run manager, bridge servers, sensor net
//! registry and command handler together and opens the main listener.
//! [`Server::shutdown`] is the only way to take it down again.

use crate::bridge::BridgeServers;
use crate::commands::{CommandHandler, CommandQueue, InboundLine};
use crate::config::SiteConfig;
use crate::nodelog::{FileNodeLog, NodeLog, TracingNodeLog};
use crate::registry::SensorNet;
use crate::runmgr::{RunControl, RunManager};
use crate::session::SessionContext;
use crate::transport::{Connection, LineHandler, LineServer};
use crate::types::{now, NodeId};
use crate::wifi::{Channel, LineSink};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("cannot open node logs under {path}: {source}")]
    NodeLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot start {what}: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Run collaborators as far as this server provides them
struct NetRunControl {
    net: OnceLock<Weak<SensorNet>>,
}

impl RunControl for NetRunControl {
    fn start_timekeeper(&self) {
        warn!("No timekeeper is configured; run timing will not be tracked");
    }

    fn start_data_collector(&self) {
        warn!("No data collector is configured; pulse data will not be stored");
    }

    fn start_ctu(&self, node: NodeId) {
        let Some(session) = self.net.get().and_then(Weak::upgrade).and_then(|n| n.get(node)) else {
            error!("CTU node {} is not in the sensor net; cannot start the run", node);
            return;
        };
        match session.send_host("START") {
            Ok(channel) => {
                info!("Sent START to the CTU on node {} over {}", node, channel);
                session.mark_running();
            }
            Err(e) => error!("Cannot send START to the CTU on node {}: {}", node, e),
        }
    }
}

/// Feeds main-connection lines to the command handler
struct MainHandler {
    queue: CommandQueue,
    net: Weak<SensorNet>,
}

impl LineHandler for MainHandler {
    fn on_line(&self, conn: &Arc<Connection>, line: &str) {
        let msg = InboundLine::new(line, conn.peer_ip().to_string(), now()).with_conn(conn.clone());
        self.queue.push(msg);
    }

    fn on_disconnect(&self, conn: &Arc<Connection>) {
        let Some(net) = self.net.upgrade() else {
            return;
        };
        for id in net.ids() {
            let detached = net.get(id).is_some_and(|n| n.detach(Channel::Main, conn.id()));
            if detached {
                warn!("Node {}: main connection from {} closed", id, conn.peer_addr());
            }
        }
    }
}

pub struct Server {
    net: Arc<SensorNet>,
    run: Arc<RunManager>,
    bridges: Arc<BridgeServers>,
    commands: CommandHandler,
    main: LineServer,
    shutdown_timeout: Duration,
}

impl Server {
    pub fn start(config: SiteConfig) -> Result<Self, ServerError> {
        let control = Arc::new(NetRunControl {
            net: OnceLock::new(),
        });
        let run = Arc::new(
            RunManager::start(control.clone()).map_err(|source| ServerError::Spawn {
                what: "run manager",
                source,
            })?,
        );
        let bridges = Arc::new(BridgeServers::new(config.clone()));
        let node_log: Arc<dyn NodeLog> = match &config.log_dir {
            Some(dir) => Arc::new(FileNodeLog::new(dir).map_err(|source| ServerError::NodeLog {
                path: dir.clone(),
                source,
            })?),
            None => Arc::new(TracingNodeLog),
        };
        let ctx = Arc::new(SessionContext {
            config: config.clone(),
            hooks: run.clone(),
            node_log,
            bridges: bridges.clone(),
        });
        let net = Arc::new(SensorNet::new(ctx));
        let _ = control.net.set(Arc::downgrade(&net));

        let commands = CommandHandler::start(net.clone()).map_err(|source| ServerError::Spawn {
            what: "command handler",
            source,
        })?;
        let handler = Arc::new(MainHandler {
            queue: commands.queue(),
            net: Arc::downgrade(&net),
        });
        let addr = SocketAddr::new(config.bind_ip, config.main_port);
        let main = LineServer::bind("main", addr, handler)
            .map_err(|source| ServerError::Bind { addr, source })?;
        info!("Sensor net server listening on {}", main.local_addr());

        Ok(Self {
            net,
            run,
            bridges,
            commands,
            main,
            shutdown_timeout: config.shutdown_timeout(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.main.local_addr()
    }

    pub fn net(&self) -> &Arc<SensorNet> {
        &self.net
    }

    pub fn run_manager(&self) -> &Arc<RunManager> {
        &self.run
    }

    pub fn bridges(&self) -> &Arc<BridgeServers> {
        &self.bridges
    }

    pub fn commands(&self) -> CommandQueue {
        self.commands.queue()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Stop listening, close connections, stop every worker and join threads
    ///
    /// Returns false if some thread had to be abandoned.
    pub fn shutdown(self, timeout: Duration) -> bool {
        info!("Shutting down sensor net server");
        let deadline = Instant::now() + timeout;
        let mut clean = self.main.shutdown(deadline);
        clean &= self.bridges.shutdown(deadline);

        self.commands.stop();
        self.run.stop();
        clean &= self.net.shutdown(deadline);
        clean &= self.commands.join_until(deadline);
        clean &= self.run.join_until(deadline);

        debug!("Sensor net at shutdown:\n{}", self.net);
        if clean {
            info!("Sensor net server stopped");
        } else {
            warn!("Sensor net server stopped; some threads were abandoned");
        }
        clean
    }
}
