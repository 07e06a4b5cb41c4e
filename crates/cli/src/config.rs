//! YAML configuration: which hosts to connect to and what to forward through each.
//!
//! ```yaml
//! clients:
//!   - ssh:
//!       host: jump.example.com
//!       port: "22"
//!       user: deploy
//!       password_env: JUMP_PASSWORD
//!     forwards:
//!       - local: "8080"
//!         remote: "9090"            # localhost:9090 as seen from the SSH host
//!       - local: 5433
//!         remote: db.internal:5432
//!         bind: 0.0.0.0
//! ```
//!
//! Ports may be written as numbers or strings.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use forward::{ClientPlan, ForwardRule, HostPort};
use serde::{de::Error as _, Deserialize, Deserializer};
use ssh::{Credential, HostKeyPolicy, SshParams};
use tracing::debug;

use crate::error::{Error, Result};

const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
}

/// One SSH session and the forwards carried over it.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Label for logs and errors; defaults to `user@host:port`.
    #[serde(default)]
    pub name: Option<String>,
    pub ssh: SshConfig,
    #[serde(default)]
    pub forwards: Vec<ForwardConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    pub host: String,
    #[serde(default = "default_ssh_port", deserialize_with = "deserialize_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Name of an environment variable holding the password.
    #[serde(default)]
    pub password_env: Option<String>,
    /// Private key path; `~` is expanded.
    #[serde(default)]
    pub identity_file: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
    #[serde(default)]
    pub known_hosts: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForwardConfig {
    #[serde(deserialize_with = "deserialize_port")]
    pub local: u16,
    /// `host:port`, or a bare port meaning `localhost` on the SSH host.
    pub remote: HostPort,
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(u16),
    Text(String),
}

fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    match PortValue::deserialize(deserializer)? {
        PortValue::Number(port) => Ok(port),
        PortValue::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| D::Error::custom(format!("invalid port '{text}'"))),
    }
}

impl Config {
    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "loaded config file");
        Self::from_yaml_str(&contents)
    }

    /// Parse and validate YAML text.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate().map_err(Error::Config)?;
        Ok(config)
    }

    /// Structural checks that do not touch the environment or filesystem.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.clients.is_empty() {
            return Err("no clients configured".into());
        }

        let mut bound = HashSet::new();
        for client in &self.clients {
            let name = client.name();
            let ssh = &client.ssh;

            if ssh.host.trim().is_empty() {
                return Err(format!("client '{name}': ssh.host is empty"));
            }
            if ssh.user.trim().is_empty() {
                return Err(format!("client '{name}': ssh.user is empty"));
            }
            if ssh.password.is_some() && ssh.password_env.is_some() {
                return Err(format!(
                    "client '{name}': set only one of password and password_env"
                ));
            }
            if ssh.password.is_none() && ssh.password_env.is_none() && ssh.identity_file.is_none() {
                return Err(format!(
                    "client '{name}': one of password, password_env or identity_file is required"
                ));
            }
            if ssh.connect_timeout_secs == 0 {
                return Err(format!("client '{name}': connect_timeout_secs must be positive"));
            }
            if client.forwards.is_empty() {
                return Err(format!("client '{name}': no forwards configured"));
            }

            for fwd in &client.forwards {
                if fwd.remote.port == 0 {
                    return Err(format!("client '{name}': remote port 0 in '{}'", fwd.remote));
                }
                let addr = SocketAddr::new(fwd.bind, fwd.local);
                if fwd.local != 0 && !bound.insert(addr) {
                    return Err(format!("local address {addr} is forwarded more than once"));
                }
            }
        }

        Ok(())
    }

    /// Resolve credentials and build one plan per client.
    pub fn plans(&self) -> Result<Vec<ClientPlan<SshParams>>> {
        self.clients.iter().map(ClientConfig::plan).collect()
    }
}

impl ClientConfig {
    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            format!("{}@{}:{}", self.ssh.user, self.ssh.host, self.ssh.port)
        })
    }

    pub fn plan(&self) -> Result<ClientPlan<SshParams>> {
        let name = self.name();
        let ssh = &self.ssh;

        let mut params = SshParams::new(&ssh.host, ssh.port, &ssh.user, ssh.credential(&name)?);
        params.host_key_policy = ssh.host_key_policy;
        params.known_hosts = ssh.known_hosts.as_deref().map(expand_path);
        params.connect_timeout = Duration::from_secs(ssh.connect_timeout_secs);

        let rules = self
            .forwards
            .iter()
            .map(|fwd| ForwardRule::new(fwd.local, fwd.remote.clone()).with_bind_address(fwd.bind))
            .collect();

        Ok(ClientPlan { name, params, rules })
    }
}

impl SshConfig {
    /// An identity file takes precedence over a password.
    fn credential(&self, client: &str) -> Result<Credential> {
        if let Some(path) = &self.identity_file {
            return Ok(Credential::IdentityFile {
                path: expand_path(path),
                passphrase: self.passphrase.clone(),
            });
        }
        if let Some(password) = &self.password {
            return Ok(Credential::Password(password.clone()));
        }
        if let Some(var) = &self.password_env {
            return std::env::var(var).map(Credential::Password).map_err(|_| {
                Error::Config(format!(
                    "client '{client}': environment variable {var} is not set"
                ))
            });
        }
        Err(Error::Config(format!("client '{client}': no credential configured")))
    }
}

/// Expand a leading `~/` to the user's home directory.
fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
