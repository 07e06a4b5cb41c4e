use std::fmt;
use std::path::PathBuf;

use russh::client::Handler;
use russh::keys::PublicKey;
use serde::Deserialize;
use tracing::{debug, info, warn};

/// How to handle SSH host key verification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Reject unknown or changed host keys.
    Strict,
    /// Accept unknown keys (add to known_hosts), reject changed keys.
    AcceptNew,
    /// Accept all keys (like `ssh -o StrictHostKeyChecking=no`).
    #[default]
    AcceptAll,
}

impl fmt::Display for HostKeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strict => write!(f, "strict"),
            Self::AcceptNew => write!(f, "accept-new"),
            Self::AcceptAll => write!(f, "accept-all"),
        }
    }
}

/// russh callback handler for one client session.
#[derive(Debug)]
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: Option<PathBuf>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, policy: HostKeyPolicy, known_hosts: Option<PathBuf>) -> Self {
        Self {
            host,
            port,
            policy,
            known_hosts,
        }
    }

    /// Check `key` against the known_hosts file, learning it under `AcceptNew`.
    fn verify_known_host(&self, key: &PublicKey) -> bool {
        let Some(path) = self.known_hosts.as_ref() else {
            warn!(host = %self.host, "no known_hosts file available, rejecting host key");
            return false;
        };

        match russh::keys::check_known_hosts_path(&self.host, self.port, key, path) {
            Ok(true) => {
                debug!(host = %self.host, "host key matches known_hosts");
                true
            }
            Ok(false) if self.policy == HostKeyPolicy::AcceptNew => {
                let learned =
                    russh::keys::known_hosts::learn_known_hosts_path(&self.host, self.port, key, path);
                match learned {
                    Ok(()) => info!(host = %self.host, path = %path.display(), "learned new host key"),
                    Err(e) => warn!(host = %self.host, %e, "failed to record host key"),
                }
                true
            }
            Ok(false) => {
                warn!(host = %self.host, "host key not present in known_hosts");
                false
            }
            Err(e) => {
                warn!(host = %self.host, %e, "host key verification failed");
                false
            }
        }
    }
}

impl Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match self.policy {
            HostKeyPolicy::AcceptAll => Ok(true),
            HostKeyPolicy::AcceptNew | HostKeyPolicy::Strict => {
                Ok(self.verify_known_host(server_public_key))
            }
        }
    }
}

/// Default `~/.ssh/known_hosts` location, if a home directory exists.
pub fn default_known_hosts() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ssh").join("known_hosts"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_key_policy_display() {
        assert_eq!(HostKeyPolicy::Strict.to_string(), "strict");
        assert_eq!(HostKeyPolicy::AcceptNew.to_string(), "accept-new");
        assert_eq!(HostKeyPolicy::AcceptAll.to_string(), "accept-all");
    }

    #[test]
    fn test_host_key_policy_default_accepts_all() {
        assert_eq!(HostKeyPolicy::default(), HostKeyPolicy::AcceptAll);
    }

    #[test]
    fn test_host_key_policy_deserialize() {
        let policy: HostKeyPolicy = serde_yaml::from_str("accept-new").unwrap();
        assert_eq!(policy, HostKeyPolicy::AcceptNew);

        let policy: HostKeyPolicy = serde_yaml::from_str("strict").unwrap();
        assert_eq!(policy, HostKeyPolicy::Strict);

        assert!(serde_yaml::from_str::<HostKeyPolicy>("sometimes").is_err());
    }

    #[test]
    fn test_default_known_hosts_under_ssh_dir() {
        if let Some(path) = default_known_hosts() {
            assert!(path.ends_with(".ssh/known_hosts"));
        }
    }

    const HOST_KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8g";
    const OTHER_HOST_KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIGVmZ2hpamtsbW5vcHFyc3R1dnd4eXp7fH1+f4CBgoOE";

    fn key(openssh: &str) -> PublicKey {
        PublicKey::from_openssh(openssh).unwrap()
    }

    #[test]
    fn test_accept_new_learns_then_recognises_key() {
        let dir = tempfile::tempdir().unwrap();
        let known_hosts = dir.path().join("ssh").join("known_hosts");
        let handler = ClientHandler::new(
            "bastion.example.com".into(),
            22,
            HostKeyPolicy::AcceptNew,
            Some(known_hosts.clone()),
        );

        assert!(handler.verify_known_host(&key(HOST_KEY)));
        let recorded = std::fs::read_to_string(&known_hosts).unwrap();
        assert!(recorded.contains("bastion.example.com"), "{recorded}");

        // Learned once, now matched without another write.
        assert!(handler.verify_known_host(&key(HOST_KEY)));
        assert_eq!(std::fs::read_to_string(&known_hosts).unwrap(), recorded);

        // A different key for a recorded host is a changed key, never learned.
        assert!(!handler.verify_known_host(&key(OTHER_HOST_KEY)));
    }

    #[test]
    fn test_strict_rejects_unknown_host() {
        let dir = tempfile::tempdir().unwrap();
        let known_hosts = dir.path().join("known_hosts");
        let handler = ClientHandler::new(
            "bastion.example.com".into(),
            2222,
            HostKeyPolicy::Strict,
            Some(known_hosts.clone()),
        );

        assert!(!handler.verify_known_host(&key(HOST_KEY)));
        assert!(!known_hosts.exists());
    }

    #[test]
    fn test_missing_known_hosts_path_rejects() {
        let handler = ClientHandler::new("h".into(), 22, HostKeyPolicy::AcceptNew, None);
        assert!(!handler.verify_known_host(&key(HOST_KEY)));
    }
}
