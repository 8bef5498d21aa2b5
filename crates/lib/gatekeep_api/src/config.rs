//! API server configuration.

use std::time::Duration;

use gatekeep_core::config::{AuthConfig, ConfigError};

/// Configuration for the HTTP layer.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    /// Service configuration shared with `gatekeep_core`.
    pub auth: AuthConfig,
    /// Deadline applied to every request.
    pub request_timeout: Duration,
    /// Key rate-limit buckets on `X-Forwarded-For` / `X-Real-IP` instead of
    /// the peer address. Only enable behind a trusted proxy.
    pub trust_proxy_headers: bool,
}

impl ApiConfig {
    pub fn new(auth: AuthConfig) -> Self {
        Self {
            auth,
            request_timeout: Duration::from_secs(10),
            trust_proxy_headers: false,
        }
    }

    /// Reads configuration from environment variables with sensible defaults.
    ///
    /// | Variable                          | Default |
    /// |-----------------------------------|---------|
    /// | `GATEKEEP_REQUEST_TIMEOUT_SECS`   | `10`    |
    /// | `GATEKEEP_TRUST_PROXY_HEADERS`    | `false` |
    ///
    /// plus everything read by [`AuthConfig::from_env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new(AuthConfig::from_env()?);
        if let Ok(raw) = std::env::var("GATEKEEP_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = raw.trim().parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::Invalid {
                    name: "GATEKEEP_REQUEST_TIMEOUT_SECS",
                    value: raw.clone(),
                    reason: e.to_string(),
                }
            })?;
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Ok(raw) = std::env::var("GATEKEEP_TRUST_PROXY_HEADERS") {
            config.trust_proxy_headers = matches!(raw.trim(), "1" | "true" | "yes");
        }
        Ok(config)
    }
}
