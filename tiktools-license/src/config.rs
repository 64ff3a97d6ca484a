//! Engine configuration.

use crate::error::{LicenseError, LicenseResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Directory (under the user's home) holding the license cache.
pub const CACHE_DIR_NAME: &str = ".tiktools";

/// File name of the sealed license cache.
pub const CACHE_FILE_NAME: &str = "license_cache.enc";

/// Configuration for the licensing engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseConfig {
    /// Base URL of the authority (REST tables live under `/rest/v1/`).
    /// Required; there is no default.
    pub authority_url: String,
    /// Public API key sent with every authority request.
    pub api_key: String,
    /// Push endpoint. Derived from `authority_url` when unset.
    pub realtime_url: Option<String>,
    /// Version reported in activation and check-in records.
    pub app_version: String,
    /// Upper bound for every authority request.
    #[serde(with = "secs")]
    pub request_timeout: Duration,
    /// How long a cached entitlement may be trusted without an online check.
    #[serde(with = "secs")]
    pub offline_horizon: Duration,
    /// Keepalive period on the realtime connection.
    #[serde(with = "secs")]
    pub heartbeat_interval: Duration,
    /// Wait before reconnecting a dropped realtime connection.
    #[serde(with = "secs")]
    pub reconnect_backoff: Duration,
    /// Period of the pull-based safety net.
    #[serde(with = "secs")]
    pub poll_interval: Duration,
    /// Cache file location. Defaults to `~/.tiktools/license_cache.enc`.
    pub cache_path: Option<PathBuf>,
    /// Start the realtime channel after a successful validation.
    pub realtime_enabled: bool,
    /// Start the poll fallback after a successful validation.
    pub poll_enabled: bool,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            authority_url: String::new(),
            api_key: String::new(),
            realtime_url: None,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout: Duration::from_secs(10),
            offline_horizon: Duration::from_secs(24 * 60 * 60),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_backoff: Duration::from_secs(5),
            poll_interval: Duration::from_secs(10),
            cache_path: None,
            realtime_enabled: true,
            poll_enabled: true,
        }
    }
}

impl LicenseConfig {
    /// The push endpoint, derived from the REST base when not set explicitly.
    pub fn realtime_endpoint(&self) -> String {
        if let Some(url) = &self.realtime_url {
            return url.clone();
        }
        let base = self.authority_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!(
            "{ws_base}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            self.api_key
        )
    }

    /// The cache file path, resolving the per-user default.
    pub fn resolve_cache_path(&self) -> LicenseResult<PathBuf> {
        if let Some(path) = &self.cache_path {
            return Ok(path.clone());
        }
        let home = dirs::home_dir()
            .ok_or_else(|| LicenseError::Config("no home directory for license cache".to_string()))?;
        Ok(home.join(CACHE_DIR_NAME).join(CACHE_FILE_NAME))
    }

    /// Checks for values the engine cannot run with.
    pub fn validate(&self) -> LicenseResult<()> {
        if self.authority_url.is_empty() {
            return Err(LicenseError::Config("authority_url is required".to_string()));
        }
        if !(self.authority_url.starts_with("https://") || self.authority_url.starts_with("http://")) {
            return Err(LicenseError::Config(format!(
                "authority_url must be http(s): {}",
                self.authority_url
            )));
        }
        for (name, value) in [
            ("request_timeout", self.request_timeout),
            ("heartbeat_interval", self.heartbeat_interval),
            ("reconnect_backoff", self.reconnect_backoff),
            ("poll_interval", self.poll_interval),
        ] {
            if value.is_zero() {
                return Err(LicenseError::Config(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}

/// Serializes durations as (fractional) seconds.
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
