//! Configuration
//!
//! The hub is configured from the environment:
//!
//! - `PORT` — HTTP listen port
//! - `REDIS_ADDR` / `REDIS_PASS` — store endpoint and password
//! - `ARCHIVED_DIMS` — space-separated `name,minutes` pairs declaring the
//!   archival schedule, e.g. `country,10 fallback,10`

use crate::archive::{parse_archived_dims, ArchiveSpec};
use crate::error::{Error, Result};
use crate::model::Periods;
use crate::store::StoreConfig;
use crate::stream::StreamConfig;
use std::time::Duration;

/// Full hub configuration
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// HTTP listen port
    pub port: u16,

    /// Store connection settings
    pub store: StoreConfig,

    /// Reporting cadence and gauge bucketing
    pub periods: Periods,

    /// Streaming fan-out settings
    pub streaming: StreamConfig,

    /// Archival schedule; empty disables the archiver
    pub archived_dims: Vec<ArchiveSpec>,

    /// TTL of the country-query fast-path cache
    pub cache_ttl: Duration,
}

fn default_port() -> u16 {
    9000
}

fn default_addr() -> String {
    "127.0.0.1:6379".to_string()
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            store: StoreConfig::for_addr(&default_addr(), None),
            periods: Periods::default(),
            streaming: StreamConfig::default(),
            archived_dims: Vec::new(),
            cache_ttl: Duration::from_secs(60),
        }
    }
}

impl HubConfig {
    /// Load configuration from the environment
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("PORT") {
            config.port = port
                .parse()
                .map_err(|_| Error::Configuration(format!("invalid PORT '{port}'")))?;
        }

        let addr = std::env::var("REDIS_ADDR").unwrap_or_else(|_| default_addr());
        let pass = std::env::var("REDIS_PASS").ok();
        config.store = StoreConfig::for_addr(&addr, pass.as_deref());

        if let Ok(dims) = std::env::var("ARCHIVED_DIMS") {
            config.archived_dims = parse_archived_dims(&dims)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::Configuration("port cannot be 0".into()));
        }
        self.store
            .validate()
            .map_err(Error::Configuration)?;
        if self.periods.reporting_period.is_zero() {
            return Err(Error::Configuration(
                "reporting period must be non-zero".into(),
            ));
        }
        if self.streaming.interval.is_zero() {
            return Err(Error::Configuration(
                "streaming interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
