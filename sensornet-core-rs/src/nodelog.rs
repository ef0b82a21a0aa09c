//! Per-node log sinks
//!
//! Lines a node asks the server to log (`LOGMSG`) and lines read from its
//! AUXIO bridge go to a node-specific sink in addition to the shared
//! tracing output.

use crate::types::{now, NodeId};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn, Level};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub trait NodeLog: Send + Sync {
    fn log(&self, node: NodeId, level: Level, line: &str);
}

/// Emits node lines as tracing events under target `sensornet::node`
///
/// Events are emitted at debug level with the node's own level as a field,
/// so they stay out of the console unless that target is enabled.
#[derive(Debug, Default)]
pub struct TracingNodeLog;

impl NodeLog for TracingNodeLog {
    fn log(&self, node: NodeId, level: Level, line: &str) {
        debug!(target: "sensornet::node", node, level = %level, "{}", line);
    }
}

/// Appends node lines to `<dir>/node<N>.log`, one never-rotated file per node
pub struct FileNodeLog {
    dir: PathBuf,
    files: Mutex<HashMap<NodeId, RollingFileAppender>>,
}

impl FileNodeLog {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            files: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, node: NodeId) -> PathBuf {
        self.dir.join(format!("node{}.log", node))
    }

    fn open(&self, node: NodeId) -> io::Result<RollingFileAppender> {
        RollingFileAppender::builder()
            .rotation(Rotation::NEVER)
            .filename_prefix(format!("node{}.log", node))
            .build(&self.dir)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn append(&self, node: NodeId, level: Level, line: &str) -> io::Result<()> {
        let mut files = self.files.lock();
        let file = match files.entry(node) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(self.open(node)?),
        };
        writeln!(file, "{} {:<5} {}", now().to_rfc3339(), level.to_string(), line)?;
        file.flush()
    }
}

impl NodeLog for FileNodeLog {
    fn log(&self, node: NodeId, level: Level, line: &str) {
        if let Err(e) = self.append(node, level, line) {
            warn!("Cannot write log for node {} under {}: {}", node, self.dir.display(), e);
        }
    }
}

/// Keeps node lines in memory; handy for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryNodeLog {
    entries: Mutex<Vec<(NodeId, Level, String)>>,
}

impl MemoryNodeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(NodeId, Level, String)> {
        self.entries.lock().clone()
    }

    pub fn lines_for(&self, node: NodeId) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|(n, _, _)| *n == node)
            .map(|(_, _, line)| line.clone())
            .collect()
    }
}

impl NodeLog for MemoryNodeLog {
    fn log(&self, node: NodeId, level: Level, line: &str) {
        self.entries.lock().push((node, level, line.to_string()));
    }
}
