//! Bidirectional byte relay for one connection pair.
//!
//! Both directions are copied concurrently with `tokio::io::copy` on split
//! halves. As soon as either direction reaches end-of-stream or fails, both
//! write sides are shut down and both streams are dropped; the direction still
//! running is dropped with them.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Upper bound on flushing and shutting down one write side during teardown.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    LocalToRemote,
    RemoteToLocal,
}

/// Why a relay ended. Informational only; nothing is propagated upward.
#[derive(Debug)]
pub enum RelayOutcome {
    /// `direction` reached end-of-stream after copying `bytes`.
    Finished { direction: Direction, bytes: u64 },
    /// `direction` failed with a read or write error.
    Failed { direction: Direction, error: io::Error },
    /// The owning forwarder was shut down.
    Cancelled,
}

impl RelayOutcome {
    fn from_copy(direction: Direction, result: io::Result<u64>) -> Self {
        match result {
            Ok(bytes) => Self::Finished { direction, bytes },
            Err(error) => Self::Failed { direction, error },
        }
    }
}

/// Relay bytes between `local` and `remote` until one direction ends or
/// `cancel` fires. Both streams are closed before this returns.
pub async fn relay<L, R>(local: L, remote: R, cancel: &CancellationToken) -> RelayOutcome
where
    L: AsyncRead + AsyncWrite + Send,
    R: AsyncRead + AsyncWrite + Send,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let outcome = {
        let upstream = tokio::io::copy(&mut local_read, &mut remote_write);
        let downstream = tokio::io::copy(&mut remote_read, &mut local_write);

        tokio::select! {
            result = upstream => RelayOutcome::from_copy(Direction::LocalToRemote, result),
            result = downstream => RelayOutcome::from_copy(Direction::RemoteToLocal, result),
            _ = cancel.cancelled() => RelayOutcome::Cancelled,
        }
    };

    trace!(?outcome, "relay direction finished, closing both sides");
    close_write(&mut remote_write, "remote").await;
    close_write(&mut local_write, "local").await;

    outcome
}

async fn close_write<W: AsyncWrite + Unpin>(writer: &mut W, side: &'static str) {
    match tokio::time::timeout(CLOSE_TIMEOUT, writer.shutdown()).await {
        Ok(Ok(())) => {}
        // Already closed by the peer.
        Ok(Err(e)) => trace!(side, %e, "shutdown failed"),
        Err(_) => debug!(side, "shutdown timed out"),
    }
}
