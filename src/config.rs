//! Client configuration from environment variables
//!
//! Recognized options (no others are read):
//! - `ER_SERVER` (required) - service host, e.g. `https://mep.pamdas.org`
//! - `ER_TOKEN` - bearer token for the HTTP transport
//! - `ER_PAGE_SIZE` (default: 4000)
//! - `ER_CONCURRENCY_LIMIT` (default: 5)
//! - `ER_TIMEZONE` (default: UTC) - IANA zone observations are converted to
//! - `ER_UNIT_TIMEOUT_SECS` (default: 300) - deadline per segment unit
//! - `ER_MAX_RETRIES` (default: 5) - transport retry budget
//! - `ER_REQUEST_TIMEOUT_SECS` (default: 60)

use chrono_tz::Tz;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PAGE_SIZE: usize = 4000;
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 5;
pub const DEFAULT_UNIT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Service host without the API suffix
    pub server: String,

    pub token: Option<String>,

    /// Records requested per page
    pub page_size: usize,

    /// Maximum simultaneously active paginated fetches
    pub concurrency_limit: usize,

    /// Zone every normalized timestamp is converted to
    pub target_timezone: Tz,

    /// Deadline for one segment unit, gate wait included
    pub unit_timeout: Duration,

    pub max_retries: u32,

    pub request_timeout: Duration,
}

impl ClientConfig {
    /// Configuration with defaults for everything but the server
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into().trim_end_matches('/').to_string(),
            token: None,
            page_size: DEFAULT_PAGE_SIZE,
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            target_timezone: Tz::UTC,
            unit_timeout: DEFAULT_UNIT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let server = lookup("ER_SERVER")
            .ok_or_else(|| ConfigError::MissingVariable("ER_SERVER".to_string()))?;

        if !server.starts_with("http://") && !server.starts_with("https://") {
            return Err(ConfigError::InvalidValue(
                "ER_SERVER must start with http:// or https://".to_string(),
            ));
        }

        let mut config = Self::new(server);
        config.token = lookup("ER_TOKEN").filter(|t| !t.is_empty());

        config = config.with_page_size(parse_var(&lookup, "ER_PAGE_SIZE", DEFAULT_PAGE_SIZE)?)?;
        config = config.with_concurrency_limit(parse_var(
            &lookup,
            "ER_CONCURRENCY_LIMIT",
            DEFAULT_CONCURRENCY_LIMIT,
        )?)?;

        if let Some(tz) = lookup("ER_TIMEZONE") {
            config = config.with_timezone(&tz)?;
        }

        config.unit_timeout = Duration::from_secs(parse_var(
            &lookup,
            "ER_UNIT_TIMEOUT_SECS",
            DEFAULT_UNIT_TIMEOUT.as_secs(),
        )?);
        config.max_retries = parse_var(&lookup, "ER_MAX_RETRIES", DEFAULT_MAX_RETRIES)?;
        config.request_timeout = Duration::from_secs(parse_var(
            &lookup,
            "ER_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT.as_secs(),
        )?);

        Ok(config)
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Result<Self, ConfigError> {
        if page_size == 0 {
            return Err(ConfigError::InvalidValue("page_size must be positive".to_string()));
        }
        self.page_size = page_size;
        Ok(self)
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Result<Self, ConfigError> {
        if limit == 0 {
            return Err(ConfigError::InvalidValue(
                "concurrency_limit must be positive".to_string(),
            ));
        }
        self.concurrency_limit = limit;
        Ok(self)
    }

    pub fn with_timezone(mut self, name: &str) -> Result<Self, ConfigError> {
        self.target_timezone = parse_timezone(name)?;
        Ok(self)
    }

    pub fn with_unit_timeout(mut self, timeout: Duration) -> Self {
        self.unit_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Root every resource path is resolved against
    pub fn service_root(&self) -> String {
        format!("{}/api/v1.0", self.server)
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz, ConfigError> {
    Tz::from_str(name.trim())
        .map_err(|_| ConfigError::InvalidValue(format!("unknown time zone `{}`", name)))
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{} = `{}`", name, raw))),
    }
}
