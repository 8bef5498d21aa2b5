//! Runtime configuration for gatekeep services.
//!
//! Everything is read from environment variables with sensible defaults;
//! see [`AuthConfig::from_env`] for the full table.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::Duration;
use rand::distr::Alphanumeric;
use rand::{Rng, rng};
use thiserror::Error;
use tracing::{info, warn};

use crate::models::TokenPurpose;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Per-purpose token signing secrets.
///
/// Each purpose has its own secret so that leaking one does not grant the
/// capabilities of another.
#[derive(Clone)]
pub struct TokenSecrets {
    access: String,
    refresh: String,
    register: String,
    restore: String,
}

impl TokenSecrets {
    pub fn new(
        access: impl Into<String>,
        refresh: impl Into<String>,
        register: impl Into<String>,
        restore: impl Into<String>,
    ) -> Self {
        Self {
            access: access.into(),
            refresh: refresh.into(),
            register: register.into(),
            restore: restore.into(),
        }
    }

    /// Resolve every secret from the environment or the persisted secret files.
    pub fn resolve() -> Self {
        Self {
            access: resolve_secret(TokenPurpose::Access),
            refresh: resolve_secret(TokenPurpose::Refresh),
            register: resolve_secret(TokenPurpose::Register),
            restore: resolve_secret(TokenPurpose::Restore),
        }
    }

    pub fn for_purpose(&self, purpose: TokenPurpose) -> &[u8] {
        match purpose {
            TokenPurpose::Access => self.access.as_bytes(),
            TokenPurpose::Refresh => self.refresh.as_bytes(),
            TokenPurpose::Register => self.register.as_bytes(),
            TokenPurpose::Restore => self.restore.as_bytes(),
        }
    }
}

impl fmt::Debug for TokenSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSecrets").finish_non_exhaustive()
    }
}

/// Token lifetimes per purpose.
#[derive(Debug, Clone, Copy)]
pub struct TokenLifetimes {
    pub access: Duration,
    pub refresh: Duration,
    pub register: Duration,
    pub restore: Duration,
}

impl TokenLifetimes {
    pub fn for_purpose(&self, purpose: TokenPurpose) -> Duration {
        match purpose {
            TokenPurpose::Access => self.access,
            TokenPurpose::Refresh => self.refresh,
            TokenPurpose::Register => self.register,
            TokenPurpose::Restore => self.restore,
        }
    }
}

impl Default for TokenLifetimes {
    fn default() -> Self {
        Self {
            access: Duration::minutes(15),
            refresh: Duration::days(30),
            register: Duration::minutes(10),
            restore: Duration::minutes(10),
        }
    }
}

/// Token-bucket parameters.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Tokens added per second.
    pub rate_per_sec: f64,
    /// Bucket capacity.
    pub burst: f64,
    /// How often the idle-bucket sweep runs.
    pub cleanup_interval: StdDuration,
    /// Buckets untouched for longer than this are evicted.
    pub idle_threshold: StdDuration,
}

impl Default for RateLimitConfig {
    /// 1 request/second, burst of 5.
    fn default() -> Self {
        Self {
            rate_per_sec: 1.0,
            burst: 5.0,
            cleanup_interval: StdDuration::from_secs(60),
            idle_threshold: StdDuration::from_secs(5 * 60),
        }
    }
}

impl RateLimitConfig {
    /// Defaults for OTP sends: 3 codes, then one per minute.
    pub fn otp_default() -> Self {
        Self {
            rate_per_sec: 1.0 / 60.0,
            burst: 3.0,
            ..Self::default()
        }
    }
}

/// One-time code parameters.
#[derive(Debug, Clone, Copy)]
pub struct OtpConfig {
    pub ttl: Duration,
    /// Number of decimal digits.
    pub length: usize,
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::minutes(5),
            length: 6,
        }
    }
}

/// Full configuration of the gatekeep services.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub secrets: TokenSecrets,
    pub lifetimes: TokenLifetimes,
    /// Per-client-address limit applied to every request.
    pub client_rate_limit: RateLimitConfig,
    /// Per-email limit applied to OTP sends.
    pub otp_rate_limit: RateLimitConfig,
    pub otp: OtpConfig,
    pub bcrypt_cost: u32,
}

impl AuthConfig {
    /// Build a config with default tunables around the given secrets.
    pub fn with_secrets(secrets: TokenSecrets) -> Self {
        Self {
            secrets,
            lifetimes: TokenLifetimes::default(),
            client_rate_limit: RateLimitConfig::default(),
            otp_rate_limit: RateLimitConfig::otp_default(),
            otp: OtpConfig::default(),
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }

    /// Reads configuration from environment variables with sensible defaults.
    ///
    /// | Variable                         | Default                        |
    /// |----------------------------------|--------------------------------|
    /// | `GATEKEEP_ACCESS_SECRET`         | generated & persisted to file  |
    /// | `GATEKEEP_REFRESH_SECRET`        | generated & persisted to file  |
    /// | `GATEKEEP_REGISTER_SECRET`       | generated & persisted to file  |
    /// | `GATEKEEP_RESTORE_SECRET`        | generated & persisted to file  |
    /// | `GATEKEEP_ACCESS_TTL_SECS`       | `900`                          |
    /// | `GATEKEEP_REFRESH_TTL_SECS`      | `2592000`                      |
    /// | `GATEKEEP_REGISTER_TTL_SECS`     | `600`                          |
    /// | `GATEKEEP_RESTORE_TTL_SECS`      | `600`                          |
    /// | `GATEKEEP_OTP_TTL_SECS`          | `300`                          |
    /// | `GATEKEEP_OTP_LENGTH`            | `6`                            |
    /// | `GATEKEEP_RATE_PER_SEC`          | `1`                            |
    /// | `GATEKEEP_RATE_BURST`            | `5`                            |
    /// | `GATEKEEP_OTP_RATE_PER_SEC`      | `0.0167`                       |
    /// | `GATEKEEP_OTP_RATE_BURST`        | `3`                            |
    /// | `GATEKEEP_CLEANUP_INTERVAL_SECS` | `60`                           |
    /// | `GATEKEEP_IDLE_THRESHOLD_SECS`   | `300`                          |
    /// | `GATEKEEP_BCRYPT_COST`           | `10`                           |
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::with_secrets(TokenSecrets::resolve());

        let lifetimes = TokenLifetimes {
            access: env_secs("GATEKEEP_ACCESS_TTL_SECS", defaults.lifetimes.access)?,
            refresh: env_secs("GATEKEEP_REFRESH_TTL_SECS", defaults.lifetimes.refresh)?,
            register: env_secs("GATEKEEP_REGISTER_TTL_SECS", defaults.lifetimes.register)?,
            restore: env_secs("GATEKEEP_RESTORE_TTL_SECS", defaults.lifetimes.restore)?,
        };

        let cleanup_interval = StdDuration::from_secs(env_parse(
            "GATEKEEP_CLEANUP_INTERVAL_SECS",
            defaults.client_rate_limit.cleanup_interval.as_secs(),
        )?);
        let idle_threshold = StdDuration::from_secs(env_parse(
            "GATEKEEP_IDLE_THRESHOLD_SECS",
            defaults.client_rate_limit.idle_threshold.as_secs(),
        )?);

        let client_rate_limit = RateLimitConfig {
            rate_per_sec: env_parse("GATEKEEP_RATE_PER_SEC", defaults.client_rate_limit.rate_per_sec)?,
            burst: env_parse("GATEKEEP_RATE_BURST", defaults.client_rate_limit.burst)?,
            cleanup_interval,
            idle_threshold,
        };
        let otp_rate_limit = RateLimitConfig {
            rate_per_sec: env_parse(
                "GATEKEEP_OTP_RATE_PER_SEC",
                defaults.otp_rate_limit.rate_per_sec,
            )?,
            burst: env_parse("GATEKEEP_OTP_RATE_BURST", defaults.otp_rate_limit.burst)?,
            cleanup_interval,
            idle_threshold,
        };

        let otp = OtpConfig {
            ttl: env_secs("GATEKEEP_OTP_TTL_SECS", defaults.otp.ttl)?,
            length: env_parse("GATEKEEP_OTP_LENGTH", defaults.otp.length)?,
        };

        let config = Self {
            secrets: defaults.secrets,
            lifetimes,
            client_rate_limit,
            otp_rate_limit,
            otp,
            bcrypt_cost: env_parse("GATEKEEP_BCRYPT_COST", defaults.bcrypt_cost)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the services cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, limit) in [
            ("GATEKEEP_RATE_PER_SEC", &self.client_rate_limit),
            ("GATEKEEP_OTP_RATE_PER_SEC", &self.otp_rate_limit),
        ] {
            if !(limit.rate_per_sec.is_finite() && limit.rate_per_sec > 0.0) {
                return Err(invalid(name, limit.rate_per_sec, "must be positive"));
            }
            if !(limit.burst.is_finite() && limit.burst >= 1.0) {
                return Err(invalid(name, limit.burst, "burst must be at least 1"));
            }
        }
        if self.otp.ttl <= Duration::zero() {
            return Err(invalid("GATEKEEP_OTP_TTL_SECS", self.otp.ttl.num_seconds(), "must be positive"));
        }
        if !(4..=10).contains(&self.otp.length) {
            return Err(invalid("GATEKEEP_OTP_LENGTH", self.otp.length, "must be 4..=10"));
        }
        if !(4..=31).contains(&self.bcrypt_cost) {
            return Err(invalid("GATEKEEP_BCRYPT_COST", self.bcrypt_cost, "must be 4..=31"));
        }
        for purpose in [
            TokenPurpose::Access,
            TokenPurpose::Refresh,
            TokenPurpose::Register,
            TokenPurpose::Restore,
        ] {
            if self.lifetimes.for_purpose(purpose) <= Duration::zero() {
                return Err(invalid(
                    "token lifetime",
                    purpose,
                    "must be positive",
                ));
            }
        }
        Ok(())
    }
}

fn invalid(name: &'static str, value: impl fmt::Display, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn env_parse<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|e: T::Err| {
            ConfigError::Invalid {
                name,
                value: raw.clone(),
                reason: e.to_string(),
            }
        }),
        _ => Ok(default),
    }
}

fn env_secs(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let secs: i64 = env_parse(name, default.num_seconds())?;
    Ok(Duration::seconds(secs))
}

/// Resolve a signing secret: env var `GATEKEEP_<PURPOSE>_SECRET` → persisted file → generated.
pub fn resolve_secret(purpose: TokenPurpose) -> String {
    let var = format!("GATEKEEP_{}_SECRET", purpose.as_str().to_uppercase());
    if let Ok(secret) = std::env::var(&var)
        && !secret.is_empty()
    {
        return secret;
    }
    let dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("gatekeep");
    resolve_secret_in(&dir, purpose)
}

/// Read the persisted secret for `purpose` from `dir`, generating and
/// persisting a new one if there is none.
pub fn resolve_secret_in(dir: &Path, purpose: TokenPurpose) -> String {
    let secret_path = dir.join(format!("{purpose}-secret"));
    if let Ok(existing) = std::fs::read_to_string(&secret_path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    let secret: String = rng()
        .sample_iter(&Alphanumeric)
        .take(64)
        .map(char::from)
        .collect();
    let _ = std::fs::create_dir_all(dir);
    match std::fs::write(&secret_path, &secret) {
        Ok(()) => info!(path = %secret_path.display(), %purpose, "generated new token secret"),
        Err(e) => warn!(%purpose, "could not persist generated secret: {e}"),
    }
    secret
}
