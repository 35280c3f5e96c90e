//! Environment-driven server configuration.
//!
//! All settings come from the process environment (`.env` values are loaded
//! by the binary before this runs):
//!
//! - `PRIVATE_KEY` — allocator signing key, required
//! - `ALLOCATOR_ADDRESS` — expected signing address; must match the
//!   key-derived address unless `SKIP_SIGNING_VERIFICATION=true`
//! - `INDEXER_URL` — GraphQL endpoint of the protocol indexer, required
//! - `INDEXER_TIMEOUT_MS` — per-request indexer timeout, default 5000
//! - `HOST`, `PORT` — listening address, defaults `0.0.0.0:3000`

use alloy_primitives::Address;
use std::env;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

const ENV_PRIVATE_KEY: &str = "PRIVATE_KEY";
const ENV_ALLOCATOR_ADDRESS: &str = "ALLOCATOR_ADDRESS";
const ENV_SKIP_SIGNING_VERIFICATION: &str = "SKIP_SIGNING_VERIFICATION";
const ENV_INDEXER_URL: &str = "INDEXER_URL";
const ENV_INDEXER_TIMEOUT_MS: &str = "INDEXER_TIMEOUT_MS";
const ENV_HOST: &str = "HOST";
const ENV_PORT: &str = "PORT";

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_INDEXER_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {var}: {message}")]
    Invalid { var: &'static str, message: String },
}

/// Immutable server configuration resolved at startup.
#[derive(Debug, Clone)]
pub struct Config {
    private_key: String,
    allocator_address: Option<Address>,
    skip_signing_verification: bool,
    indexer_url: Url,
    indexer_timeout: Duration,
    host: IpAddr,
    port: u16,
}

impl Config {
    /// Resolves configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let private_key = lookup(ENV_PRIVATE_KEY)
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingVar(ENV_PRIVATE_KEY))?;

        let allocator_address = lookup(ENV_ALLOCATOR_ADDRESS)
            .filter(|v| !v.is_empty())
            .map(|raw| {
                Address::from_str(&raw).map_err(|e| ConfigError::Invalid {
                    var: ENV_ALLOCATOR_ADDRESS,
                    message: e.to_string(),
                })
            })
            .transpose()?;

        let skip_signing_verification = lookup(ENV_SKIP_SIGNING_VERIFICATION)
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(false);

        let indexer_url = lookup(ENV_INDEXER_URL)
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingVar(ENV_INDEXER_URL))?;
        let indexer_url = Url::parse(&indexer_url).map_err(|e| ConfigError::Invalid {
            var: ENV_INDEXER_URL,
            message: e.to_string(),
        })?;

        let indexer_timeout = match lookup(ENV_INDEXER_TIMEOUT_MS) {
            Some(raw) => raw.parse::<u64>().map_err(|e| ConfigError::Invalid {
                var: ENV_INDEXER_TIMEOUT_MS,
                message: e.to_string(),
            })?,
            None => DEFAULT_INDEXER_TIMEOUT_MS,
        };

        let host = match lookup(ENV_HOST) {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                var: ENV_HOST,
                message: format!("{raw:?} is not an IP address"),
            })?,
            None => DEFAULT_HOST.parse().expect("default host is a valid IP"),
        };

        let port = match lookup(ENV_PORT) {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                var: ENV_PORT,
                message: format!("{raw:?} is not a port number"),
            })?,
            None => DEFAULT_PORT,
        };

        Ok(Config {
            private_key,
            allocator_address,
            skip_signing_verification,
            indexer_url,
            indexer_timeout: Duration::from_millis(indexer_timeout),
            host,
            port,
        })
    }

    pub fn private_key(&self) -> &str {
        &self.private_key
    }

    pub fn allocator_address(&self) -> Option<Address> {
        self.allocator_address
    }

    pub fn skip_signing_verification(&self) -> bool {
        self.skip_signing_verification
    }

    pub fn indexer_url(&self) -> &Url {
        &self.indexer_url
    }

    pub fn indexer_timeout(&self) -> Duration {
        self.indexer_timeout
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}
