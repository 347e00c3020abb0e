//! Configuration types, built from environment variables.

use std::path::PathBuf;
use std::str::FromStr;

use secrecy::{ExposeSecret, SecretString};

use crate::error::ConfigError;

/// Minimum accepted length of the token signing secret, in bytes.
const MIN_SECRET_LEN: usize = 32;

/// Service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// HTTP listen port.
    pub port: u16,
    /// Directory for daily-rolling log files (stderr only when unset).
    pub log_dir: Option<PathBuf>,
    pub signup: SignupConfig,
    pub billing: BillingConfig,
}

/// Settings for the onboarding engine itself.
#[derive(Debug, Clone)]
pub struct SignupConfig {
    /// HS256 signing secret for session tokens.
    pub token_secret: SecretString,
    /// Session token lifetime.
    pub token_ttl: chrono::Duration,
    /// Incomplete registrations older than this are reaped.
    pub retention: chrono::Duration,
    /// Cron expression (with seconds field) for the reaper sweep.
    pub reaper_schedule: String,
}

/// Payment-processor credentials. Only carried as configuration; the engine
/// receives payment outcomes as opaque references.
#[derive(Debug, Clone, Default)]
pub struct BillingConfig {
    pub secret_key: Option<SecretString>,
    pub price_id: Option<String>,
}

impl BillingConfig {
    pub fn is_configured(&self) -> bool {
        self.secret_key
            .as_ref()
            .is_some_and(|k| !k.expose_secret().is_empty())
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let db_path = lookup("SIGNUP_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/signup.db"));
        let port = parse_or(&lookup, "SIGNUP_PORT", 8080u16)?;
        let log_dir = lookup("SIGNUP_LOG_DIR")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let token_secret = lookup("SIGNUP_TOKEN_SECRET")
            .ok_or_else(|| ConfigError::MissingEnvVar("SIGNUP_TOKEN_SECRET".into()))?;
        if token_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::InvalidValue {
                key: "SIGNUP_TOKEN_SECRET".into(),
                message: format!("must be at least {MIN_SECRET_LEN} bytes"),
            });
        }

        let token_ttl_hours = positive_hours(&lookup, "SIGNUP_TOKEN_TTL_HOURS")?;
        let retention_hours = positive_hours(&lookup, "SIGNUP_RETENTION_HOURS")?;

        let reaper_schedule =
            lookup("SIGNUP_REAPER_SCHEDULE").unwrap_or_else(|| "0 0 * * * *".to_string());
        cron::Schedule::from_str(&reaper_schedule).map_err(|e| ConfigError::InvalidValue {
            key: "SIGNUP_REAPER_SCHEDULE".into(),
            message: e.to_string(),
        })?;

        Ok(Self {
            db_path,
            port,
            log_dir,
            signup: SignupConfig {
                token_secret: SecretString::from(token_secret),
                token_ttl: chrono::Duration::hours(token_ttl_hours),
                retention: chrono::Duration::hours(retention_hours),
                reaper_schedule,
            },
            billing: BillingConfig {
                secret_key: lookup("BILLING_SECRET_KEY").map(SecretString::from),
                price_id: lookup("BILLING_PRICE_ID"),
            },
        })
    }
}

/// A duration in hours that defaults to one week and must be positive.
fn positive_hours(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<i64, ConfigError> {
    let hours = parse_or(lookup, key, 168i64)?;
    if hours <= 0 {
        return Err(ConfigError::InvalidValue {
            key: key.into(),
            message: "must be a positive number of hours".into(),
        });
    }
    Ok(hours)
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}
