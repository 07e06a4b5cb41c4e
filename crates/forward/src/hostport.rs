use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

use crate::error::ForwardError;

/// Host used when a remote address is given as a bare port.
pub const DEFAULT_REMOTE_HOST: &str = "localhost";

/// A `host:port` pair, resolved on the far side of the transport.
///
/// Accepts `host:port`, `[v6addr]:port`, or a bare `port`, which is shorthand
/// for `localhost:port` on the remote machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn localhost(port: u16) -> Self {
        Self::new(DEFAULT_REMOTE_HOST, port)
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for HostPort {
    type Err = ForwardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || ForwardError::InvalidAddress(s.to_string());

        if let Ok(port) = s.parse::<u16>() {
            return Ok(Self::localhost(port));
        }

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            (host, tail.strip_prefix(':').ok_or_else(invalid)?)
        } else {
            s.rsplit_once(':').ok_or_else(invalid)?
        };

        if host.is_empty() || (!s.starts_with('[') && host.contains(':')) {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;

        Ok(Self::new(host, port))
    }
}

impl<'de> Deserialize<'de> for HostPort {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HostPortVisitor;

        impl Visitor<'_> for HostPortVisitor {
            type Value = HostPort;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a port number or a \"host:port\" string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<HostPort, E> {
                u16::try_from(v)
                    .map(HostPort::localhost)
                    .map_err(|_| E::custom(format!("port {v} out of range")))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<HostPort, E> {
                u16::try_from(v)
                    .map(HostPort::localhost)
                    .map_err(|_| E::custom(format!("port {v} out of range")))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<HostPort, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(HostPortVisitor)
    }
}
