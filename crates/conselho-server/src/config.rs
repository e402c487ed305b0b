//! Process configuration, read from `CONSELHO_*` environment variables.
//!
//! A `.env` file in the working directory is loaded first for local
//! development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use conselho_gateway::GatewayConfig;

/// JWT secrets that ship in sample files and must never reach production.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
    "secret",
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

#[derive(Clone, Debug)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub bind_address: SocketAddr,
    pub heartbeat_interval: Duration,
    pub billing_period: Duration,
}

impl Config {
    /// Read the process environment. `.env` is loaded by the binary before
    /// this is called.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key/value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let jwt_secret = lookup("CONSELHO_JWT_SECRET")
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVar("CONSELHO_JWT_SECRET".into()))?;
        if PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            return Err(ConfigError::InvalidValue(
                "CONSELHO_JWT_SECRET".into(),
                "still a placeholder; set a random secret".into(),
            ));
        }

        let db_path = lookup("CONSELHO_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("conselho.db"));

        let host = lookup("CONSELHO_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = parse_or(&lookup, "CONSELHO_PORT", 3000)?;
        let bind_address = format!("{}:{}", host, port)
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("CONSELHO_HOST".into(), e.to_string()))?;

        let heartbeat_secs: u64 = parse_or(&lookup, "CONSELHO_HEARTBEAT_SECS", 30)?;
        let billing_secs: u64 = parse_or(&lookup, "CONSELHO_BILLING_PERIOD_SECS", 60)?;
        for (key, value) in [
            ("CONSELHO_HEARTBEAT_SECS", heartbeat_secs),
            ("CONSELHO_BILLING_PERIOD_SECS", billing_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue(key.into(), "must be at least 1".into()));
            }
        }

        Ok(Self {
            jwt_secret,
            db_path,
            bind_address,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            billing_period: Duration::from_secs(billing_secs),
        })
    }

    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            heartbeat_interval: self.heartbeat_interval,
            billing_period: self.billing_period,
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(key.into(), e.to_string())),
        None => Ok(default),
    }
}
