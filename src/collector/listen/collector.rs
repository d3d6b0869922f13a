//! Ingestion listener: a collector that is also a socket server.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::Notify;
use tokio::time::timeout;

use super::address::{ListenAddress, Transport};
use super::parser::parse_line;
use crate::collector::{Collector, CollectorContext, CollectorError, MeasurementSender};
use crate::measurement::{Measurement, Unit};

/// Collector name, also the first segment of every submitted metric.
pub const LISTEN_NAME: &str = "listen";

/// Pause after a transient accept failure before accepting again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Lock-free listener counters, shared by every connection handler.
#[derive(Debug, Default)]
pub struct ListenStats {
    metrics: AtomicU64,
    connections: AtomicU64,
    parse_errors: AtomicU64,
}

impl ListenStats {
    /// Measurements accepted and queued.
    pub fn metrics(&self) -> u64 {
        self.metrics.load(Ordering::Relaxed)
    }

    /// Connections accepted.
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Lines rejected by the parser.
    pub fn parse_errors(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }
}

enum Acceptor {
    Tcp(TcpListener),
    Unix(UnixListener, SocketFile),
}

/// Latest bind generation of each socket path bound by this process.
fn socket_generations() -> MutexGuard<'static, HashMap<PathBuf, u64>> {
    static GENERATIONS: OnceLock<Mutex<HashMap<PathBuf, u64>>> = OnceLock::new();
    GENERATIONS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// A bound unix socket path, its bind generation, and the file identity it
/// had right after bind.
///
/// Another listener, here or in another process, may have replaced the file
/// since; only our own file is removed.
struct SocketFile {
    path: PathBuf,
    generation: u64,
    dev: u64,
    ino: u64,
}

impl SocketFile {
    fn bound(path: PathBuf) -> io::Result<Self> {
        let meta = std::fs::metadata(&path)?;
        let generation = {
            let mut generations = socket_generations();
            let latest = generations.entry(path.clone()).or_insert(0);
            *latest += 1;
            *latest
        };
        Ok(Self {
            path,
            generation,
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    fn is_ours(&self) -> bool {
        let latest = socket_generations().get(&self.path).copied();
        latest == Some(self.generation)
            && std::fs::metadata(&self.path)
                .map(|meta| meta.dev() == self.dev && meta.ino() == self.ino)
                .unwrap_or(false)
    }

    fn remove(&self) -> io::Result<()> {
        if !self.is_ours() {
            tracing::debug!(collector = LISTEN_NAME, path = %self.path.display(), "Socket file replaced, leaving it");
            return Ok(());
        }
        remove_socket_file(&self.path)
    }
}

enum Connection {
    Tcp(TcpStream, SocketAddr),
    Unix(UnixStream),
}

impl Acceptor {
    async fn accept(&self) -> io::Result<Connection> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok(Connection::Tcp(stream, peer))
            }
            Self::Unix(listener, _) => {
                let (stream, _) = listener.accept().await?;
                Ok(Connection::Unix(stream))
            }
        }
    }
}

/// State shared between the collector handle and its background tasks.
struct Shared {
    sender: MeasurementSender,
    stats: ListenStats,
    read_timeout: Duration,
    closing: AtomicBool,
    closed: Notify,
}

/// The `listen` collector.
///
/// The socket is bound at construction, so a bad address or an occupied port
/// fails startup. Accepting and reading run on their own tasks, independent of
/// the tick cadence; [`Collector::poll`] only reports stats when `meta` is on.
pub struct ListenCollector {
    shared: Arc<Shared>,
    meta: bool,
    local_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for ListenCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenCollector")
            .field("local_addr", &self.local_addr)
            .field("meta", &self.meta)
            .field("stats", &self.shared.stats)
            .finish()
    }
}

impl ListenCollector {
    /// Bind `address` and start the accept loop.
    ///
    /// `read_timeout` is the per-read deadline of every connection. Must be
    /// called from within a Tokio runtime.
    pub fn bind(
        address: &ListenAddress,
        sender: MeasurementSender,
        read_timeout: Duration,
        meta: bool,
    ) -> Result<Self, CollectorError> {
        let acceptor = bind_acceptor(address)?;
        let local_addr = match &acceptor {
            Acceptor::Tcp(listener) => Some(listener.local_addr()?),
            Acceptor::Unix(..) => None,
        };

        let shared = Arc::new(Shared {
            sender,
            stats: ListenStats::default(),
            read_timeout,
            closing: AtomicBool::new(false),
            closed: Notify::new(),
        });

        tokio::spawn(accept_loop(acceptor, shared.clone()));
        tracing::info!(collector = LISTEN_NAME, address = %address, "Listening");

        Ok(Self {
            shared,
            meta,
            local_addr,
        })
    }

    /// Build from the agent configuration (`listen.address`, `listen.meta`, `interval`).
    pub fn from_context(ctx: &CollectorContext) -> Result<Self, CollectorError> {
        let address: ListenAddress = ctx
            .config
            .listen
            .address
            .parse()
            .map_err(|e: super::AddressError| CollectorError::Config(e.to_string()))?;
        Self::bind(
            &address,
            ctx.sender.clone(),
            ctx.config.interval,
            ctx.config.listen.meta,
        )
    }

    /// Bound TCP address, `None` for unix sockets.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn stats(&self) -> &ListenStats {
        &self.shared.stats
    }
}

#[async_trait::async_trait]
impl Collector for ListenCollector {
    fn name(&self) -> &str {
        LISTEN_NAME
    }

    async fn poll(&self, tick: DateTime<Utc>) -> Result<(), CollectorError> {
        if !self.meta {
            return Ok(());
        }

        let stats = &self.shared.stats;
        let readings = [
            ("metrics", stats.metrics(), Unit::METRICS),
            ("connections", stats.connections(), Unit::CONNECTIONS),
            ("parse.errors", stats.parse_errors(), Unit::ERRORS),
        ];
        for (what, value, unit) in readings {
            let path = ["stats"].into_iter().chain(what.split('.'));
            self.shared
                .sender
                .send(Measurement::counter(tick, LISTEN_NAME, path, value, unit))
                .await?;
        }
        Ok(())
    }

    fn shutdown(&self) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.closed.notify_one();
        tracing::info!(collector = LISTEN_NAME, "Listener closing");
    }
}

impl Drop for ListenCollector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn bind_acceptor(address: &ListenAddress) -> Result<Acceptor, CollectorError> {
    match address.transport {
        Transport::Tcp | Transport::Tcp4 | Transport::Tcp6 => {
            let addr = resolve(address)?;
            let listener = std::net::TcpListener::bind(addr)?;
            listener.set_nonblocking(true)?;
            Ok(Acceptor::Tcp(TcpListener::from_std(listener)?))
        }
        Transport::Unix => {
            let path = PathBuf::from(&address.address);
            remove_socket_file(&path)?;
            let listener = std::os::unix::net::UnixListener::bind(&path)?;
            listener.set_nonblocking(true)?;
            let file = SocketFile::bound(path)?;
            Ok(Acceptor::Unix(UnixListener::from_std(listener)?, file))
        }
        Transport::Unixpacket => Err(CollectorError::Config(format!(
            "listen transport {} is not supported",
            address.transport
        ))),
    }
}

fn resolve(address: &ListenAddress) -> Result<SocketAddr, CollectorError> {
    let family_ok = |addr: &SocketAddr| match address.transport {
        Transport::Tcp4 => addr.is_ipv4(),
        Transport::Tcp6 => addr.is_ipv6(),
        _ => true,
    };

    address
        .address
        .to_socket_addrs()?
        .find(family_ok)
        .ok_or_else(|| {
            CollectorError::Config(format!(
                "listen address {address} does not resolve to a {} address",
                address.transport
            ))
        })
}

fn remove_socket_file(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

async fn accept_loop(acceptor: Acceptor, shared: Arc<Shared>) {
    loop {
        let accepted = tokio::select! {
            accepted = acceptor.accept() => accepted,
            _ = shared.closed.notified() => break,
        };

        match accepted {
            Ok(conn) => {
                shared.stats.connections.fetch_add(1, Ordering::Relaxed);
                match conn {
                    Connection::Tcp(stream, peer) => {
                        tokio::spawn(handle_connection(stream, peer.to_string(), shared.clone()));
                    }
                    Connection::Unix(stream) => {
                        let peer = stream
                            .peer_addr()
                            .ok()
                            .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                            .unwrap_or_else(|| "unix".to_string());
                        tokio::spawn(handle_connection(stream, peer, shared.clone()));
                    }
                }
            }
            Err(_) if shared.closing.load(Ordering::SeqCst) => break,
            Err(e) => {
                tracing::warn!(collector = LISTEN_NAME, error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }

    if let Acceptor::Unix(_, file) = &acceptor
        && let Err(e) = file.remove()
    {
        tracing::warn!(collector = LISTEN_NAME, path = %file.path.display(), error = %e, "Failed to remove socket file");
    }
    tracing::debug!(collector = LISTEN_NAME, "Accept loop stopped");
}

/// Read lines until EOF, a read error, an idle deadline, or the first bad line.
async fn handle_connection<S>(stream: S, peer: String, shared: Arc<Shared>)
where
    S: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();

    let reason = loop {
        let line = match timeout(shared.read_timeout, lines.next_line()).await {
            Err(_) => break "idle timeout",
            Ok(Err(e)) => {
                tracing::warn!(collector = LISTEN_NAME, peer = %peer, error = %e, "Read failed");
                break "read error";
            }
            Ok(Ok(None)) => break "end of stream",
            Ok(Ok(Some(line))) => line,
        };

        match parse_line(&line, LISTEN_NAME) {
            Ok(measurement) => {
                if shared.sender.send(measurement).await.is_err() {
                    break "queue closed";
                }
                shared.stats.metrics.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                shared.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(collector = LISTEN_NAME, peer = %peer, error = %e, line = %line, "Parse error");
                break "parse error";
            }
        }
    };

    tracing::debug!(collector = LISTEN_NAME, peer = %peer, reason, "Connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::MeasurementValue;
    use std::io::ErrorKind;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    fn tcp_listener(
        capacity: usize,
        read_timeout: Duration,
        meta: bool,
    ) -> Option<(ListenCollector, mpsc::Receiver<Measurement>)> {
        let (sender, rx) = MeasurementSender::channel(capacity);
        let address: ListenAddress = "tcp4,127.0.0.1:0".parse().unwrap();
        match ListenCollector::bind(&address, sender, read_timeout, meta) {
            Ok(collector) => Some((collector, rx)),
            Err(CollectorError::Io(e)) if e.kind() == ErrorKind::PermissionDenied => {
                // Some sandboxed environments disallow binding; skip the test.
                None
            }
            Err(e) => panic!("Failed to bind listener: {e}"),
        }
    }

    async fn recv(rx: &mut mpsc::Receiver<Measurement>) -> Measurement {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for a measurement")
            .expect("queue closed")
    }

    #[tokio::test]
    async fn test_tcp_lines_become_measurements() {
        let Some((collector, mut rx)) = tcp_listener(16, Duration::from_secs(5), false) else {
            return;
        };
        let addr = collector.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"90210 beverly.hills 10\n90210 beverly.hills 2.5 g Dollars,$\n")
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let first = recv(&mut rx).await;
        assert_eq!(first.name(None), "listen.beverly.hills");
        assert_eq!(first.value(), MeasurementValue::Counter(10));

        let second = recv(&mut rx).await;
        assert_eq!(second.value(), MeasurementValue::FloatGauge(2.5));
        assert_eq!(second.unit().abbr(), "$");

        assert_eq!(collector.stats().metrics(), 2);
        assert_eq!(collector.stats().connections(), 1);
    }

    #[tokio::test]
    async fn test_parse_error_closes_connection() {
        let Some((collector, mut rx)) = tcp_listener(16, Duration::from_secs(5), false) else {
            return;
        };
        let addr = collector.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"90210 ok.metric 1\n90210 bad.type 10 q\n90210 never.seen 3\n")
            .await
            .unwrap();

        let first = recv(&mut rx).await;
        assert_eq!(first.name(None), "listen.ok.metric");

        // The handler drops the connection on the bad line; the third line is never read.
        let mut buf = [0u8; 1];
        let read = timeout(Duration::from_secs(2), tokio::io::AsyncReadExt::read(&mut client, &mut buf))
            .await
            .expect("server should close the connection");
        assert!(matches!(read, Ok(0) | Err(_)));

        assert!(rx.try_recv().is_err());
        assert_eq!(collector.stats().parse_errors(), 1);
        assert_eq!(collector.stats().metrics(), 1);
    }

    #[tokio::test]
    async fn test_idle_connection_times_out() {
        let Some((collector, _rx)) = tcp_listener(16, Duration::from_millis(100), false) else {
            return;
        };
        let addr = collector.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let read = timeout(Duration::from_secs(2), tokio::io::AsyncReadExt::read(&mut client, &mut buf))
            .await
            .expect("idle connection should be closed after the read deadline");
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_meta_stats_emitted_on_poll() {
        let Some((collector, mut rx)) = tcp_listener(16, Duration::from_secs(5), true) else {
            return;
        };

        collector.poll(Utc::now()).await.unwrap();
        let names: Vec<String> = (0..3).map(|_| rx.try_recv().unwrap().name(None)).collect();
        assert_eq!(
            names,
            [
                "listen.stats.metrics",
                "listen.stats.connections",
                "listen.stats.parse.errors"
            ]
        );
    }

    #[tokio::test]
    async fn test_poll_without_meta_emits_nothing() {
        let Some((collector, mut rx)) = tcp_listener(16, Duration::from_secs(5), false) else {
            return;
        };
        collector.poll(Utc::now()).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_stops_accepting() {
        let Some((collector, _rx)) = tcp_listener(16, Duration::from_secs(5), false) else {
            return;
        };
        let addr = collector.local_addr().unwrap();

        collector.shutdown();
        collector.shutdown();

        let mut refused = false;
        for _ in 0..20 {
            if TcpStream::connect(addr).await.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(refused, "listener should stop accepting after shutdown");
    }

    #[tokio::test]
    async fn test_unix_socket_replaces_stale_file_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.sock");
        std::fs::write(&path, b"stale").unwrap();

        let (sender, mut rx) = MeasurementSender::channel(4);
        let address: ListenAddress = format!("unix,{}", path.display()).parse().unwrap();
        let collector = match ListenCollector::bind(&address, sender, Duration::from_secs(5), false) {
            Ok(c) => c,
            Err(CollectorError::Io(e)) if e.kind() == ErrorKind::PermissionDenied => return,
            Err(e) => panic!("Failed to bind unix listener: {e}"),
        };
        assert!(collector.local_addr().is_none());

        let mut client = UnixStream::connect(&path).await.unwrap();
        client.write_all(b"90210 via.unix 7\n").await.unwrap();
        assert_eq!(recv(&mut rx).await.name(None), "listen.via.unix");

        collector.shutdown();
        for _ in 0..40 {
            if !path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(!path.exists(), "socket file should be removed on shutdown");
    }

    #[tokio::test]
    async fn test_replaced_listener_keeps_successor_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.sock");
        let address: ListenAddress = format!("unix,{}", path.display()).parse().unwrap();

        let (sender, mut rx) = MeasurementSender::channel(4);
        let first = match ListenCollector::bind(&address, sender.clone(), Duration::from_secs(5), false) {
            Ok(c) => c,
            Err(CollectorError::Io(e)) if e.kind() == ErrorKind::PermissionDenied => return,
            Err(e) => panic!("Failed to bind unix listener: {e}"),
        };
        let second = ListenCollector::bind(&address, sender, Duration::from_secs(5), false).unwrap();

        // The first accept loop exits and must leave the successor's file alone.
        drop(first);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(path.exists(), "successor socket file was removed");

        let mut client = UnixStream::connect(&path).await.unwrap();
        client.write_all(b"90210 still.here 1\n").await.unwrap();
        assert_eq!(recv(&mut rx).await.name(None), "listen.still.here");

        drop(second);
        for _ in 0..40 {
            if !path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(!path.exists(), "socket file should be removed by its owner");
    }

    #[tokio::test]
    async fn test_unixpacket_is_rejected_at_bind() {
        let (sender, _rx) = MeasurementSender::channel(1);
        let address: ListenAddress = "unixpacket,/tmp/vigil-packet.sock".parse().unwrap();
        let err = ListenCollector::bind(&address, sender, Duration::from_secs(1), false).unwrap_err();
        assert!(matches!(err, CollectorError::Config(_)));
    }

    #[tokio::test]
    async fn test_tcp6_rejects_ipv4_address() {
        let (sender, _rx) = MeasurementSender::channel(1);
        let address: ListenAddress = "tcp6,127.0.0.1:0".parse().unwrap();
        let err = ListenCollector::bind(&address, sender, Duration::from_secs(1), false).unwrap_err();
        assert!(matches!(err, CollectorError::Config(_)));
    }
}
