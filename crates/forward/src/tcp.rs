use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{ForwardError, Result};
use crate::relay::{relay, RelayOutcome};
use crate::rule::ForwardRule;
use crate::session::TransportSession;

/// Consecutive non-transient accept failures before the forwarder gives up.
pub const MAX_CONSECUTIVE_ACCEPT_ERRORS: u32 = 32;

/// First delay after a non-transient accept failure; doubles up to the max.
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Handle to a running forwarder.
///
/// Dropping the handle leaves the forwarder running; use [`shutdown`] or
/// cancel the token it was started with.
///
/// [`shutdown`]: ForwarderHandle::shutdown
#[derive(Debug)]
pub struct ForwarderHandle {
    rule: ForwardRule,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    stopped: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl ForwarderHandle {
    pub fn rule(&self) -> &ForwardRule {
        &self.rule
    }

    /// The address actually bound, which differs from the rule for port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the accept loop and all of its relays have ended.
    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Resolves once the accept loop and all of its relays have ended.
    pub async fn stopped(&self) {
        self.stopped.cancelled().await
    }

    /// Wait for the forwarder to end on its own.
    pub async fn join(self) -> Result<()> {
        self.task.await?
    }

    /// Stop accepting, end every in-flight relay, and wait for both.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        self.join().await
    }
}

/// Owns one local listener for one [`ForwardRule`] and relays every accepted
/// connection over a fresh stream from the shared session.
pub struct Forwarder<S: TransportSession> {
    rule: ForwardRule,
    session: Arc<S>,
    listener: TcpListener,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    relays: TaskTracker,
}

impl<S: TransportSession> Forwarder<S> {
    /// Bind the rule's local address and spawn the accept loop.
    ///
    /// A bind failure is returned immediately and is meant to be fatal: there
    /// is no fallback port.
    pub async fn start(
        rule: ForwardRule,
        session: Arc<S>,
        cancel: CancellationToken,
    ) -> Result<ForwarderHandle> {
        let forwarder = Self::bind(rule, session, cancel).await?;
        let rule = forwarder.rule.clone();
        let local_addr = forwarder.local_addr;
        let cancel = forwarder.cancel.clone();
        let stopped = CancellationToken::new();

        let guard = stopped.clone().drop_guard();
        let task = tokio::spawn(async move {
            let _guard = guard;
            forwarder.run().await
        });

        info!("Forwarding {} -> {}", local_addr, rule.remote());

        Ok(ForwarderHandle {
            rule,
            local_addr,
            cancel,
            stopped,
            task,
        })
    }

    async fn bind(rule: ForwardRule, session: Arc<S>, cancel: CancellationToken) -> Result<Self> {
        let addr = rule.local_addr();
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            if e.kind() == io::ErrorKind::AddrInUse {
                ForwardError::PortInUse(rule.local_port())
            } else {
                ForwardError::Bind { addr, source: e }
            }
        })?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            rule,
            session,
            listener,
            local_addr,
            cancel,
            relays: TaskTracker::new(),
        })
    }

    #[instrument(name = "forwarder", skip(self), fields(port = self.local_addr.port(), remote = %self.rule.remote()))]
    async fn run(self) -> Result<()> {
        let this = &self;
        let result = accept_loop(
            this.local_addr.port(),
            &this.cancel,
            move || this.listener.accept(),
            move |(stream, peer): (TcpStream, SocketAddr)| this.dispatch(stream, peer),
        )
        .await;

        // Stop accepting before waiting on relays so the port is released.
        let Self { listener, relays, .. } = self;
        drop(listener);
        relays.close();
        relays.wait().await;

        match &result {
            Ok(()) => debug!("forwarder stopped"),
            Err(e) => error!(%e, "forwarder stopped"),
        }
        result
    }

    /// Open the remote stream for one accepted connection and hand the pair
    /// to a new relay task. A failed open drops only this connection.
    async fn dispatch(&self, local: TcpStream, peer: SocketAddr) {
        let port = self.local_addr.port();
        debug!(port, %peer, "accepted local connection");

        // Disable Nagle's algorithm for low-latency forwarding.
        let _ = local.set_nodelay(true);

        let remote = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            result = self.session.open_stream(self.rule.remote()) => result,
        };

        let remote = match remote {
            Ok(remote) => remote,
            Err(e) => {
                warn!(port, %peer, %e, "remote dial failed, dropping local connection");
                return;
            }
        };

        let cancel = self.cancel.clone();
        self.relays.spawn(async move {
            match relay(local, remote, &cancel).await {
                RelayOutcome::Failed { direction, error } => {
                    debug!(port, %peer, ?direction, %error, "connection closed with error");
                }
                outcome => debug!(port, %peer, ?outcome, "connection closed"),
            }
        });
    }
}

/// Accept until `cancel` fires, handing each connection to `handle`.
///
/// Connection-level errors are skipped. Any other error backs off
/// exponentially; after [`MAX_CONSECUTIVE_ACCEPT_ERRORS`] in a row without a
/// successful accept the loop gives up.
async fn accept_loop<C, A, AFut, H, HFut>(
    port: u16,
    cancel: &CancellationToken,
    mut accept: A,
    mut handle: H,
) -> Result<()>
where
    A: FnMut() -> AFut,
    AFut: Future<Output = io::Result<C>>,
    H: FnMut(C) -> HFut,
    HFut: Future<Output = ()>,
{
    let mut failures: u32 = 0;
    let mut backoff = ACCEPT_BACKOFF_MIN;

    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            result = accept() => result,
        };

        match accepted {
            Ok(conn) => {
                failures = 0;
                backoff = ACCEPT_BACKOFF_MIN;
                handle(conn).await;
            }
            Err(e) if is_connection_error(&e) => {
                debug!(port, %e, "connection dropped before accept completed");
            }
            Err(e) => {
                failures += 1;
                if failures >= MAX_CONSECUTIVE_ACCEPT_ERRORS {
                    return Err(ForwardError::Accept { port, source: e });
                }
                warn!(port, %e, failures, ?backoff, "failed to accept connection, backing off");

                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
            }
        }
    }
}

/// Errors that concern a single pending connection rather than the listener.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn other_error() -> io::Error {
        io::Error::other("too many open files")
    }

    fn reset_error() -> io::Error {
        io::Error::from(io::ErrorKind::ConnectionReset)
    }

    /// Run the accept loop over a scripted sequence of accept results. Once
    /// the script runs out the token is cancelled so the loop can end cleanly.
    async fn run_script(script: Vec<io::Result<u32>>) -> (Result<()>, usize, Vec<u32>) {
        let cancel = CancellationToken::new();
        let script = Mutex::new(VecDeque::from(script));
        let mut calls = 0;
        let mut handled = Vec::new();

        let result = accept_loop(
            4000,
            &cancel,
            || {
                calls += 1;
                let next = script.lock().unwrap().pop_front().unwrap_or_else(|| {
                    cancel.cancel();
                    Err(reset_error())
                });
                std::future::ready(next)
            },
            |conn| {
                handled.push(conn);
                std::future::ready(())
            },
        )
        .await;

        (result, calls, handled)
    }

    #[test]
    fn test_connection_errors_are_transient() {
        assert!(is_connection_error(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_connection_error(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_connection_error(&io::Error::from(io::ErrorKind::OutOfMemory)));
        assert!(!is_connection_error(&io::Error::other("too many open files")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_consecutive_errors_with_backoff() {
        let started = tokio::time::Instant::now();
        let script = (0..MAX_CONSECUTIVE_ACCEPT_ERRORS).map(|_| Err(other_error())).collect();

        let (result, calls, handled) = run_script(script).await;

        match result {
            Err(ForwardError::Accept { port, .. }) => assert_eq!(port, 4000),
            other => panic!("expected accept error, got {other:?}"),
        }
        assert_eq!(calls, MAX_CONSECUTIVE_ACCEPT_ERRORS as usize);
        assert!(handled.is_empty());

        // 5, 10, 20, ... 640 ms, then capped at 1 s for the remaining sleeps.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(24_275), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(25_000), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_errors_do_not_count_towards_limit() {
        let mut script: Vec<io::Result<u32>> = Vec::new();
        script.extend((0..MAX_CONSECUTIVE_ACCEPT_ERRORS - 1).map(|_| Err(other_error())));
        script.extend((0..10).map(|_| Err(reset_error())));
        script.push(Err(other_error()));

        let (result, calls, _) = run_script(script).await;

        assert!(matches!(result, Err(ForwardError::Accept { .. })), "{result:?}");
        assert_eq!(calls, MAX_CONSECUTIVE_ACCEPT_ERRORS as usize + 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_accept_resets_error_count() {
        let mut script: Vec<io::Result<u32>> = Vec::new();
        script.extend((0..MAX_CONSECUTIVE_ACCEPT_ERRORS - 1).map(|_| Err(other_error())));
        script.push(Ok(1));
        script.extend((0..MAX_CONSECUTIVE_ACCEPT_ERRORS - 1).map(|_| Err(other_error())));
        script.push(Ok(2));

        let (result, _, handled) = run_script(script).await;

        assert!(result.is_ok(), "{result:?}");
        assert_eq!(handled, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_stops_cleanly() {
        let cancel = CancellationToken::new();
        let mut calls = 0;

        let result = accept_loop(
            4000,
            &cancel,
            || {
                calls += 1;
                if calls == 3 {
                    cancel.cancel();
                }
                std::future::ready(Err::<u32, _>(other_error()))
            },
            |_| std::future::ready(()),
        )
        .await;

        assert!(result.is_ok(), "{result:?}");
        assert_eq!(calls, 3);
    }
}
