use std::net::SocketAddr;

use thiserror::Error;

use crate::hostport::HostPort;

/// Errors that can occur during forwarding operations.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("Local port {0} is already in use")]
    PortInUse(u16),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open stream to {remote}: {message}")]
    OpenStream { remote: HostPort, message: String },

    #[error("Session for client '{client}' could not be established: {message}")]
    Session { client: String, message: String },

    #[error("Listener on port {port} gave up after repeated accept failures: {source}")]
    Accept {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid address '{0}'")]
    InvalidAddress(String),

    #[error("Forwarder task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("SSH error: {0}")]
    Ssh(#[from] ssh::SshError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ForwardError>;
