//! qplace.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::Endpoint;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QplaceConfig {
    pub listener: ListenerConfig,
    pub messaging: MessagingConfig,
    pub link: LinkSettings,
    pub feed: FeedSettings,
}

/// Inbound broker connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
    /// Directory holding `ca.crt`, `tls.crt` and `tls.key`. Unset means
    /// brokers are accepted without identity verification.
    pub cert_dir: Option<PathBuf>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 55667,
            cert_dir: None,
        }
    }
}

/// Endpoint that broker connector services dial back to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    pub host: String,
    pub port: u16,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            host: "messaging".to_string(),
            port: 5672,
        }
    }
}

impl MessagingConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    pub request_timeout_ms: u64,
    pub attach_timeout_ms: u64,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            attach_timeout_ms: 5_000,
            max_attempts: 10,
            retry_backoff_ms: 1_000,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl LinkSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Desired-state feed endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
    pub host: String,
    pub port: u16,
    pub reconnect_delay_ms: u64,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            host: "configuration".to_string(),
            port: 5672,
            reconnect_delay_ms: 5_000,
        }
    }
}

impl FeedSettings {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl QplaceConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: QplaceConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Whether inbound broker connections are authenticated with mutual TLS.
    pub fn is_mutual_tls(&self) -> bool {
        self.listener.cert_dir.is_some()
    }
}
