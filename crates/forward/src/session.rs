//! The seam between the forwarding engine and the transport.
//!
//! Forwarders only ever call [`TransportSession::open_stream`]; establishing
//! the session is the job of a [`SessionConnector`].

use async_trait::async_trait;
use ssh::{SshParams, SshSession, SshStream};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{ForwardError, Result};
use crate::hostport::HostPort;

/// A long-lived authenticated connection that opens byte streams on demand.
///
/// Shared by reference between every forwarder bound to it, so opening a
/// stream takes `&self`. Opened streams are owned by the caller.
#[async_trait]
pub trait TransportSession: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + 'static;

    /// Open a fresh stream to `remote`. No retries.
    async fn open_stream(&self, remote: &HostPort) -> Result<Self::Stream>;

    /// Tear the session down. Called once, after all forwarders have stopped.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Establishes a [`TransportSession`] from connection parameters.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    type Params: Send + Sync;
    type Session: TransportSession;

    async fn connect(&self, params: &Self::Params) -> Result<Self::Session>;
}

#[async_trait]
impl TransportSession for SshSession {
    type Stream = SshStream;

    async fn open_stream(&self, remote: &HostPort) -> Result<Self::Stream> {
        self.open_direct_tcpip(&remote.host, remote.port)
            .await
            .map_err(|e| ForwardError::OpenStream {
                remote: remote.clone(),
                message: e.to_string(),
            })
    }

    async fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        Ok(self.disconnect().await?)
    }
}

/// Connects [`SshSession`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshConnector;

#[async_trait]
impl SessionConnector for SshConnector {
    type Params = SshParams;
    type Session = SshSession;

    async fn connect(&self, params: &SshParams) -> Result<SshSession> {
        Ok(SshSession::connect(params).await?)
    }
}
