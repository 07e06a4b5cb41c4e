use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::hostport::HostPort;

/// Immutable mapping from one local listening port to one remote address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRule {
    bind_address: IpAddr,
    local_port: u16,
    remote: HostPort,
}

impl ForwardRule {
    /// Listen on `127.0.0.1:<local_port>`. Port 0 picks an ephemeral port.
    pub fn new(local_port: u16, remote: HostPort) -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            local_port,
            remote,
        }
    }

    pub fn with_bind_address(mut self, bind_address: IpAddr) -> Self {
        self.bind_address = bind_address;
        self
    }

    pub fn bind_address(&self) -> IpAddr {
        self.bind_address
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.local_port)
    }

    pub fn remote(&self) -> &HostPort {
        &self.remote
    }
}

impl fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local_addr(), self.remote)
    }
}
