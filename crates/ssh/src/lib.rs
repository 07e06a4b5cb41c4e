//! SSH transport sessions for ssh-relay.
//!
//! This crate provides:
//! - Password and public-key authenticated sessions over russh
//! - Host key verification policies backed by `known_hosts`
//! - `direct-tcpip` streams to addresses reachable from the remote host

pub mod client;
pub mod error;
pub mod handler;

pub use client::{Credential, SshParams, SshSession, SshStream};
pub use error::{Result, SshError};
pub use handler::{ClientHandler, HostKeyPolicy};
