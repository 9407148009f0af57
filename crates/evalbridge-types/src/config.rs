//! Configuration tree for the bridge, deserialized from TOML.
//!
//! Every section defaults independently, so a config file only needs to name
//! the values it overrides.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// The protocol peer that evaluates code.
    pub peer: PeerConfig,
    /// Receive-loop tuning for protocol sessions.
    pub session: SessionConfig,
    /// Pending-call bookkeeping.
    pub registry: RegistryConfig,
    /// Bridge listener and outbound link.
    pub bridge: LinkConfig,
    /// Process execution.
    pub shell: ShellConfig,
    /// Filesystem access.
    pub fs: FsConfig,
}

impl BridgeConfig {
    /// Parse a config from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

/// Address of the protocol peer. Default: `127.0.0.1:7888`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7888,
        }
    }
}

impl PeerConfig {
    /// `host:port` form suitable for connecting.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Receive-loop bounds for a protocol session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Overall deadline for one request. Default: 10s.
    pub timeout_ms: u64,
    /// Longest single wait for data before counting an idle poll. Default: 50ms.
    pub poll_interval_ms: u64,
    /// Consecutive idle polls before giving up on more frames. Default: 200.
    pub max_idle_polls: u32,
    /// Largest buffered frame accepted from a peer. Default: 16 MiB.
    pub max_frame_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            poll_interval_ms: 50,
            max_idle_polls: 200,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Pending-call bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// How long a registered call may stay unsettled. Default: 30s.
    pub call_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
        }
    }
}

impl RegistryConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Bridge listener and optional outbound link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Address the bridge accepts peer links on. Default: `127.0.0.1:7889`.
    pub listen_addr: String,
    /// Peer bridge to dial at startup, if any.
    pub connect_addr: Option<String>,
    /// Capacity of each link's outbound queue. Default: 256.
    pub outbound_queue: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7889".to_string(),
            connect_addr: None,
            outbound_queue: 256,
        }
    }
}

/// Process execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Kill a process that runs longer than this. Default: 60.
    pub timeout_secs: u64,
    /// Extra environment variables passed through to children.
    pub allowed_env_vars: Vec<String>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            allowed_env_vars: Vec::new(),
        }
    }
}

/// Filesystem access policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Confine reads and writes to this directory when set.
    pub root: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.peer.address(), "127.0.0.1:7888");
        assert_eq!(config.session.timeout(), Duration::from_secs(10));
        assert_eq!(config.registry.call_timeout_ms, 30_000);
        assert!(config.bridge.connect_addr.is_none());
        assert!(config.fs.root.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = BridgeConfig::from_toml(
            r#"
            [peer]
            port = 50505

            [session]
            max_idle_polls = 5

            [shell]
            allowed_env_vars = ["JAVA_HOME"]
            "#,
        )
        .unwrap();
        assert_eq!(config.peer.host, "127.0.0.1");
        assert_eq!(config.peer.port, 50505);
        assert_eq!(config.session.max_idle_polls, 5);
        assert_eq!(config.session.poll_interval_ms, 50);
        assert_eq!(config.shell.allowed_env_vars, vec!["JAVA_HOME"]);
        assert_eq!(config.shell.timeout_secs, 60);
    }

    #[test]
    fn test_empty_toml() {
        let config = BridgeConfig::from_toml("").unwrap();
        assert_eq!(config.bridge.listen_addr, "127.0.0.1:7889");
    }
}
