//! Newline-delimited TCP transport
//!
//! A [`LineServer`] owns a listening socket, one accept thread and one
//! reader thread per connection. Lines are handed to a [`LineHandler`]
//! with trailing CR/LF removed; outgoing lines get a `\n` appended.

use crate::flag::Flag;
use crate::panic::describe;
use crate::wifi::LineSink;
use crate::worker::TrackedThread;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How often the accept loop checks for shutdown
const ACCEPT_POLL: Duration = Duration::from_millis(50);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Callbacks for one listener's connections, run on the reader threads
pub trait LineHandler: Send + Sync + 'static {
    fn on_connect(&self, _conn: &Arc<Connection>) {}
    fn on_line(&self, conn: &Arc<Connection>, line: &str);
    fn on_disconnect(&self, _conn: &Arc<Connection>) {}
}

/// Write half of an accepted TCP connection
pub struct Connection {
    id: u64,
    peer: SocketAddr,
    stream: Mutex<TcpStream>,
}

impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            stream: Mutex::new(stream),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn peer_ip(&self) -> IpAddr {
        self.peer.ip()
    }

    /// Shut the socket down in both directions; the reader sees end of stream
    pub fn close(&self) {
        if let Err(e) = self.stream.lock().shutdown(Shutdown::Both) {
            debug!("Closing connection from {}: {}", self.peer, e);
        }
    }
}

impl LineSink for Connection {
    fn send_line(&self, line: &str) -> io::Result<()> {
        let mut stream = self.stream.lock();
        stream.write_all(line.as_bytes())?;
        stream.write_all(b"\n")?;
        stream.flush()
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }
}

struct Shared {
    name: String,
    stopping: Flag,
    handler: Arc<dyn LineHandler>,
    conns: Mutex<HashMap<u64, Arc<Connection>>>,
    readers: Mutex<Vec<TrackedThread>>,
}

pub struct LineServer {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    acceptor: Mutex<Option<TrackedThread>>,
}

impl LineServer {
    /// Bind `addr` and start accepting connections
    pub fn bind(
        name: impl Into<String>,
        addr: SocketAddr,
        handler: Arc<dyn LineHandler>,
    ) -> io::Result<Self> {
        let name = name.into();
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            name: name.clone(),
            stopping: Flag::new(false),
            handler,
            conns: Mutex::new(HashMap::new()),
            readers: Mutex::new(Vec::new()),
        });
        let acceptor = {
            let shared = shared.clone();
            TrackedThread::spawn(format!("{}-accept", name), move || accept_loop(shared, listener))?
        };
        info!("{} listening on {}", name, local_addr);
        Ok(Self {
            local_addr,
            shared,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.shared.conns.lock().len()
    }

    /// Stop accepting, close open connections and join all threads
    ///
    /// Returns false if some thread did not exit before `deadline`.
    pub fn shutdown(&self, deadline: Instant) -> bool {
        debug!("{}: shutting down", self.shared.name);
        self.shared.stopping.raise();
        let mut clean = match self.acceptor.lock().take() {
            Some(thread) => thread.join_until(deadline),
            None => true,
        };
        let conns: Vec<_> = self.shared.conns.lock().values().cloned().collect();
        for conn in conns {
            conn.close();
        }
        let readers = std::mem::take(&mut *self.shared.readers.lock());
        for reader in readers {
            clean &= reader.join_until(deadline);
        }
        clean
    }
}

impl Drop for LineServer {
    fn drop(&mut self) {
        self.shared.stopping.raise();
    }
}

fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    while !shared.stopping.is_up() {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = start_reader(&shared, stream, peer) {
                    error!("{}: cannot serve connection from {}: {}", shared.name, peer, e);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                shared.stopping.wait_up(Some(ACCEPT_POLL));
            }
            Err(e) => {
                warn!("{}: accept failed: {}", shared.name, e);
                shared.stopping.wait_up(Some(ACCEPT_POLL));
            }
        }
    }
    debug!("{}: no longer accepting", shared.name);
}

fn start_reader(shared: &Arc<Shared>, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    let reader = BufReader::new(stream.try_clone()?);
    let conn = Arc::new(Connection::new(stream, peer));
    info!("{}: connection from {}", shared.name, peer);
    shared.conns.lock().insert(conn.id, conn.clone());

    let thread = {
        let shared = shared.clone();
        let conn = conn.clone();
        TrackedThread::spawn(format!("{}-conn{}", shared.name, conn.id), move || {
            read_lines(&shared, &conn, reader)
        })
    };
    match thread {
        Ok(thread) => {
            let mut readers = shared.readers.lock();
            readers.retain(|t| !t.is_finished());
            readers.push(thread);
            Ok(())
        }
        Err(e) => {
            shared.conns.lock().remove(&conn.id);
            conn.close();
            Err(e)
        }
    }
}

fn read_lines(shared: &Shared, conn: &Arc<Connection>, mut reader: BufReader<TcpStream>) {
    guarded(shared, "on_connect", || shared.handler.on_connect(conn));
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\r', '\n']);
                guarded(shared, "on_line", || shared.handler.on_line(conn, line));
            }
            Err(e) => {
                if !shared.stopping.is_up() {
                    warn!("{}: read from {} failed: {}", shared.name, conn.peer, e);
                }
                break;
            }
        }
    }
    debug!("{}: connection from {} closed", shared.name, conn.peer);
    shared.conns.lock().remove(&conn.id);
    guarded(shared, "on_disconnect", || shared.handler.on_disconnect(conn));
}

/// Run a handler callback, logging instead of unwinding the reader thread
fn guarded(shared: &Shared, what: &str, f: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        error!("{}: {} handler failed: {}", shared.name, what, describe(payload.as_ref()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo {
        seen: Mutex<Vec<String>>,
        closed: Flag,
    }

    impl LineHandler for Echo {
        fn on_line(&self, conn: &Arc<Connection>, line: &str) {
            self.seen.lock().push(line.to_string());
            if line == "boom" {
                panic!("handler bug");
            }
            let _ = conn.send_line(&format!("echo {}", line));
        }

        fn on_disconnect(&self, _conn: &Arc<Connection>) {
            self.closed.raise();
        }
    }

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_lines_round_trip() {
        let handler = Arc::new(Echo {
            seen: Mutex::new(Vec::new()),
            closed: Flag::new(false),
        });
        let server = LineServer::bind("test", localhost(), handler.clone()).unwrap();
        let mut client = TcpStream::connect(server.local_addr()).unwrap();
        client.write_all(b"hello\r\nboom\nworld\n").unwrap();

        let mut reader = BufReader::new(client.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "echo hello\n");
        line.clear();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "echo world\n");
        assert_eq!(*handler.seen.lock(), vec!["hello", "boom", "world"]);

        drop(reader);
        drop(client);
        assert!(handler.closed.wait_up(Some(Duration::from_secs(5))));
        assert!(server.shutdown(Instant::now() + Duration::from_secs(5)));
    }

    #[test]
    fn test_shutdown_closes_connections_and_port() {
        let handler = Arc::new(Echo {
            seen: Mutex::new(Vec::new()),
            closed: Flag::new(false),
        });
        let server = LineServer::bind("test", localhost(), handler.clone()).unwrap();
        let addr = server.local_addr();
        let client = TcpStream::connect(addr).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while server.connection_count() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        assert!(server.shutdown(Instant::now() + Duration::from_secs(5)));
        assert!(handler.closed.is_up());
        assert!(TcpStream::connect(addr).is_err());
        drop(client);
    }
}
