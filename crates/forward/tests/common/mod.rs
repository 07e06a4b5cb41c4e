//! Common test utilities and helpers
#![allow(dead_code)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use forward::{ForwardError, HostPort, SessionConnector, TransportSession};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Counters shared between a test and the sessions it hands out.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub opened: AtomicUsize,
    pub closed: AtomicBool,
    fail_remaining: AtomicUsize,
    closed_labels: Mutex<Vec<String>>,
}

impl SessionStats {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Labels of the sessions closed so far, in close order.
    pub fn closed_labels(&self) -> Vec<String> {
        self.closed_labels.lock().unwrap().clone()
    }

    /// Make the next `n` stream opens fail.
    pub fn fail_next(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }
}

/// A transport session that "tunnels" by dialing the remote address directly.
#[derive(Debug, Default)]
pub struct TcpSession {
    pub stats: Arc<SessionStats>,
    label: String,
}

impl TcpSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stats(stats: Arc<SessionStats>, label: impl Into<String>) -> Self {
        Self {
            stats,
            label: label.into(),
        }
    }
}

#[async_trait]
impl TransportSession for TcpSession {
    type Stream = TcpStream;

    async fn open_stream(&self, remote: &HostPort) -> forward::Result<TcpStream> {
        self.stats.opened.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .stats
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ForwardError::OpenStream {
                remote: remote.clone(),
                message: "channel open refused by test session".into(),
            });
        }

        TcpStream::connect((remote.host.as_str(), remote.port))
            .await
            .map_err(|e| ForwardError::OpenStream {
                remote: remote.clone(),
                message: e.to_string(),
            })
    }

    async fn close(&self) -> forward::Result<()> {
        self.stats.closed.store(true, Ordering::SeqCst);
        self.stats.closed_labels.lock().unwrap().push(self.label.clone());
        Ok(())
    }
}

/// Hands out [`TcpSession`]s keyed by a client name; names in `unreachable`
/// fail to connect.
#[derive(Debug, Default)]
pub struct TestConnector {
    pub stats: Arc<SessionStats>,
    pub unreachable: HashSet<String>,
}

#[async_trait]
impl SessionConnector for TestConnector {
    type Params = String;
    type Session = TcpSession;

    async fn connect(&self, params: &String) -> forward::Result<TcpSession> {
        if self.unreachable.contains(params) {
            return Err(ForwardError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("{params} unreachable"),
            )));
        }
        Ok(TcpSession::with_stats(self.stats.clone(), params.as_str()))
    }
}

/// A port with nothing listening on it.
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind to random port");
    listener.local_addr().unwrap().port()
}

/// Simple echo TCP server for tunnel testing
pub struct EchoServer {
    pub addr: SocketAddr,
}

impl EchoServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind echo server");
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = socket.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });

        Self { addr }
    }

    pub fn remote(&self) -> HostPort {
        HostPort::new("127.0.0.1", self.addr.port())
    }
}

/// A TCP server that hands every accepted socket to the test.
pub struct SinkServer {
    pub addr: SocketAddr,
    accepted: mpsc::UnboundedReceiver<TcpStream>,
}

impl SinkServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind sink server");
        let addr = listener.local_addr().unwrap();
        let (tx, accepted) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                if tx.send(socket).is_err() {
                    break;
                }
            }
        });

        Self { addr, accepted }
    }

    pub fn remote(&self) -> HostPort {
        HostPort::new("127.0.0.1", self.addr.port())
    }

    /// The server side of the next relayed connection.
    pub async fn next(&mut self) -> TcpStream {
        tokio::time::timeout(Duration::from_secs(5), self.accepted.recv())
            .await
            .expect("timed out waiting for relayed connection")
            .expect("sink server stopped")
    }
}

/// Send `payload` and read the same number of bytes back.
pub async fn roundtrip(addr: SocketAddr, payload: &[u8]) -> std::io::Result<Vec<u8>> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(payload).await?;
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Wait for a condition to be true, with timeout
pub async fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    false
}
