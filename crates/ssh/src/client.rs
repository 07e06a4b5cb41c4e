use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg};
use tracing::{debug, info, instrument};

use crate::error::{Result, SshError};
use crate::handler::{default_known_hosts, ClientHandler, HostKeyPolicy};

/// Interval between SSH keepalive requests.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Unanswered keepalives before the session is considered dead.
const KEEPALIVE_MAX: usize = 3;

/// Default time allowed for TCP connect plus key exchange.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// A bidirectional byte stream carried by one `direct-tcpip` channel.
pub type SshStream = russh::ChannelStream<client::Msg>;

/// How to prove the user's identity to the remote host.
#[derive(Clone)]
pub enum Credential {
    Password(String),
    IdentityFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::IdentityFile { path, passphrase } => f
                .debug_struct("IdentityFile")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

/// Connection parameters for one remote host.
#[derive(Debug, Clone)]
pub struct SshParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub credential: Credential,
    pub host_key_policy: HostKeyPolicy,
    /// Overrides `~/.ssh/known_hosts`.
    pub known_hosts: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl SshParams {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>, credential: Credential) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            credential,
            host_key_policy: HostKeyPolicy::default(),
            known_hosts: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// `user@host:port`, used as the session label in logs.
    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

/// An authenticated SSH session wrapping a russh client handle.
///
/// The handle is shared by every forwarder bound to this session; opening a
/// channel only needs `&self`.
pub struct SshSession {
    handle: Handle<ClientHandler>,
    target: String,
}

impl SshSession {
    /// Connect and authenticate. Any failure here is fatal for the client.
    #[instrument(name = "ssh_connect", skip(params), fields(session = %params.target()))]
    pub async fn connect(params: &SshParams) -> Result<Self> {
        let client_config = Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            keepalive_max: KEEPALIVE_MAX,
            ..Default::default()
        });

        let addr_str = format!("{}:{}", params.host, params.port);
        let addr: SocketAddr = tokio::net::lookup_host(&addr_str)
            .await
            .map_err(|e| SshError::Connection(format!("failed to resolve '{addr_str}': {e}")))?
            .next()
            .ok_or_else(|| SshError::Connection(format!("no addresses found for '{addr_str}'")))?;

        let known_hosts = params.known_hosts.clone().or_else(default_known_hosts);
        let handler = ClientHandler::new(
            params.host.clone(),
            params.port,
            params.host_key_policy,
            known_hosts,
        );

        let mut handle = tokio::time::timeout(
            params.connect_timeout,
            client::connect(client_config, addr, handler),
        )
        .await
        .map_err(|_| {
            SshError::Connection(format!(
                "timed out after {:?} connecting to {addr}",
                params.connect_timeout
            ))
        })?
        .map_err(|e| SshError::Connection(e.to_string()))?;

        info!("SSH connection established to {}", addr);

        authenticate(&mut handle, &params.user, &params.credential).await?;

        Ok(Self {
            handle,
            target: params.target(),
        })
    }

    /// The `user@host:port` this session is connected to.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Whether the underlying connection has gone away.
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Open a `direct-tcpip` channel to `host:port` as seen from the remote side.
    pub async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<SshStream> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| {
                SshError::Channel(format!("failed to open direct-tcpip channel to {host}:{port}: {e}"))
            })?;

        debug!(session = %self.target, host, port, "direct-tcpip channel opened");
        Ok(channel.into_stream())
    }

    /// Close the SSH connection gracefully.
    pub async fn disconnect(&self) -> Result<()> {
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| SshError::Connection(format!("SSH disconnect failed: {e}")))?;
        Ok(())
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    user: &str,
    credential: &Credential,
) -> Result<()> {
    match credential {
        Credential::Password(password) => {
            let result = handle
                .authenticate_password(user, password)
                .await
                .map_err(|e| SshError::Auth(e.to_string()))?;

            if !result.success() {
                return Err(SshError::Auth(format!("password rejected for {user}")));
            }
            info!(user, "SSH password authentication successful");
        }
        Credential::IdentityFile { path, passphrase } => {
            debug!(key = %path.display(), "loading SSH key");
            let key = load_secret_key(path, passphrase.as_deref())
                .map_err(|e| SshError::Key(format!("failed to load key {}: {e}", path.display())))?;
            let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

            let result = handle
                .authenticate_publickey(user, key_with_hash)
                .await
                .map_err(|e| SshError::Auth(e.to_string()))?;

            if !result.success() {
                return Err(SshError::Auth(format!(
                    "key {} not accepted for {user}",
                    path.display()
                )));
            }
            info!(user, key = %path.display(), "SSH key authentication successful");
        }
    }

    Ok(())
}
