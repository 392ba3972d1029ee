//! Client configuration
//!
//! Settings are read from an optional config file, then from environment
//! variables prefixed with `TETHER_` (nested keys use `__`, for example
//! `TETHER_CAMPAIGN__INTERVAL_MS`). The endpoint list may be given as a
//! comma-separated string: `TETHER_ENDPOINTS=10.0.0.1:2379,10.0.0.2:2379`.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{ConfigError, Result};
use crate::retry::RetryPolicy;

/// TTL in seconds applied to every lease lock unless the debug TTL is requested
pub const DEFAULT_LEASE_TTL: i64 = 5;
/// The only caller-supplied lease TTL that is honored
pub const DEBUG_LEASE_TTL: i64 = 60 * 60;
/// TTL in seconds of the lease backing a session
pub const DEFAULT_SESSION_TTL: i64 = 60;
/// Key written by the readiness ping
pub const SERVICE_PING_PATH: &str = "/etc/service/ping";

const ENV_PREFIX: &str = "TETHER";

/// Lease lock campaign settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CampaignSettings {
    pub interval_ms: u64,
    pub max_attempts: Option<u64>,
    pub deadline_ms: Option<u64>,
    /// Log the current holder on every n-th losing attempt
    pub warn_every: u64,
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            max_attempts: None,
            deadline_ms: None,
            warn_every: 60,
        }
    }
}

impl CampaignSettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(self.interval_ms),
            max_attempts: self.max_attempts,
            deadline: self.deadline_ms.map(Duration::from_millis),
        }
    }
}

/// Watch reconnect settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectSettings {
    pub interval_ms: u64,
    pub max_attempts: Option<u64>,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            interval_ms: 200,
            max_attempts: None,
        }
    }
}

impl ReconnectSettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(self.interval_ms),
            max_attempts: self.max_attempts,
            deadline: None,
        }
    }
}

/// Configuration for connecting to the backing store and tuning the
/// coordination primitives.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Store endpoints, e.g. `http://127.0.0.1:2379`
    pub endpoints: Vec<String>,
    pub dial_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub ping_timeout_ms: u64,
    pub ping_path: String,
    pub session_ttl: i64,
    pub campaign: CampaignSettings,
    pub watch_reconnect: ReconnectSettings,
    /// Delay between the self-termination signal and the forced exit
    pub exit_grace_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            dial_timeout_ms: 2000,
            request_timeout_ms: 5000,
            ping_timeout_ms: 1000,
            ping_path: SERVICE_PING_PATH.to_string(),
            session_ttl: DEFAULT_SESSION_TTL,
            campaign: CampaignSettings::default(),
            watch_reconnect: ReconnectSettings::default(),
            exit_grace_ms: 5000,
        }
    }
}

impl ClientConfig {
    /// Build a config from a comma-separated endpoint list.
    pub fn from_endpoints(endpoints: &str) -> Result<Self> {
        Self {
            endpoints: vec![endpoints.to_string()],
            ..Default::default()
        }
        .normalized()
    }

    /// Load from an optional file and the `TETHER_*` environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_endpoints(path, None)
    }

    /// Like [`load`](Self::load), with an endpoint list that overrides both
    /// the file and the environment.
    pub fn load_with_endpoints(path: Option<&Path>, endpoints: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("endpoints")
                .try_parsing(true),
        );
        builder = builder.set_override_option("endpoints", endpoints.map(|e| vec![e.to_string()]))?;

        let config: ClientConfig = builder.build()?.try_deserialize()?;
        config.normalized()
    }

    /// Replace the endpoint list, e.g. from a command line flag.
    pub fn with_endpoints(mut self, endpoints: &str) -> Result<Self> {
        self.endpoints = vec![endpoints.to_string()];
        self.normalized()
    }

    /// Split comma lists, trim, add a scheme where missing and validate.
    pub fn normalized(mut self) -> Result<Self> {
        let mut endpoints = Vec::new();
        for raw in &self.endpoints {
            for part in raw.split(',') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                endpoints.push(normalize_endpoint(part)?);
            }
        }
        if endpoints.is_empty() {
            return Err(ConfigError::MissingEndpoints);
        }
        self.endpoints = endpoints;

        if self.session_ttl <= 0 {
            return Err(ConfigError::InvalidSetting {
                key: "session_ttl",
                reason: format!("must be positive, got {}", self.session_ttl),
            });
        }
        if self.campaign.warn_every == 0 {
            return Err(ConfigError::InvalidSetting {
                key: "campaign.warn_every",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(self)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }
}

fn normalize_endpoint(endpoint: &str) -> Result<String> {
    let with_scheme = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    };

    let host = with_scheme
        .trim_start_matches("http://")
        .trim_start_matches("https://");
    if host.is_empty() || host.starts_with(':') || host.starts_with('/') {
        return Err(ConfigError::InvalidEndpoint(endpoint.to_string()));
    }

    Ok(with_scheme.trim_end_matches('/').to_string())
}
