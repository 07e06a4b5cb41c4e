//! Forwarding engine for ssh-relay.
//!
//! This crate provides:
//! - `Forwarder`: one local TCP listener per forward rule
//! - `relay`: bidirectional byte copy for one connection pair
//! - `SessionManager`: one transport session per client, one forwarder per rule
//! - `TransportSession`: the seam between the engine and SSH

pub mod error;
pub mod hostport;
pub mod manager;
pub mod relay;
pub mod rule;
pub mod session;
pub mod tcp;

pub use error::{ForwardError, Result};
pub use hostport::HostPort;
pub use manager::{ClientPlan, SessionManager};
pub use relay::{relay, Direction, RelayOutcome};
pub use rule::ForwardRule;
pub use session::{SessionConnector, SshConnector, TransportSession};
pub use tcp::{Forwarder, ForwarderHandle};
