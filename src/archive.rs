//! Periodic snapshot archival
//!
//! For every `(dimension, interval)` pair declared in configuration, one
//! driver task sleeps to the next interval boundary, queries that dimension's
//! rollups and hands the snapshot to the warehouse writer. Failures are
//! logged and the next boundary retries; the driver never exits on a
//! transient error.
//!
//! The warehouse itself is an external collaborator; this module only owns
//! the driving contract.

use crate::engine::StatsHub;
use crate::error::{Error, Result};
use crate::model::{truncate_to_interval, Stats};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Destination for archived rollup snapshots
#[async_trait]
pub trait WarehouseWriter: Send + Sync {
    /// Persist one dimension's rollups for the interval bucket ending now
    async fn write_snapshot(
        &self,
        dim_name: &str,
        dim_stats: &HashMap<String, Stats>,
        bucket: DateTime<Utc>,
    ) -> Result<()>;
}

/// Writer used when no warehouse is configured; records the hand-off in the
/// log and drops the data
pub struct NullWarehouse;

#[async_trait]
impl WarehouseWriter for NullWarehouse {
    async fn write_snapshot(
        &self,
        dim_name: &str,
        dim_stats: &HashMap<String, Stats>,
        bucket: DateTime<Utc>,
    ) -> Result<()> {
        debug!(
            dim = dim_name,
            keys = dim_stats.len(),
            bucket = bucket.timestamp(),
            "no warehouse configured, dropping snapshot"
        );
        Ok(())
    }
}

// ============================================================================
// Schedule
// ============================================================================

/// One dimension's archival schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSpec {
    /// Dimension name to archive
    pub dim: String,
    /// Interval between snapshots
    pub interval: Duration,
}

/// Parse the `ARCHIVED_DIMS` form: space-separated `name,minutes` pairs,
/// e.g. `country,10 fallback,10`
pub fn parse_archived_dims(value: &str) -> Result<Vec<ArchiveSpec>> {
    let mut specs = Vec::new();
    for pair in value.split_whitespace() {
        let (dim, minutes) = pair.split_once(',').ok_or_else(|| {
            Error::Configuration(format!("archived dim '{pair}' is not name,minutes"))
        })?;
        if dim.is_empty() {
            return Err(Error::Configuration(format!(
                "archived dim '{pair}' has an empty name"
            )));
        }
        let minutes: u64 = minutes.parse().map_err(|_| {
            Error::Configuration(format!("archived dim '{pair}' has an invalid minute count"))
        })?;
        if minutes == 0 {
            return Err(Error::Configuration(format!(
                "archived dim '{pair}' must archive at least every minute"
            )));
        }
        specs.push(ArchiveSpec {
            dim: dim.to_string(),
            interval: Duration::from_secs(minutes * 60),
        });
    }
    Ok(specs)
}

// ============================================================================
// Driver
// ============================================================================

/// Drives snapshot archival for the configured dimensions
pub struct Archiver {
    hub: Arc<StatsHub>,
    writer: Arc<dyn WarehouseWriter>,
}

impl Archiver {
    /// Create a driver over the hub and warehouse writer
    pub fn new(hub: Arc<StatsHub>, writer: Arc<dyn WarehouseWriter>) -> Self {
        Self { hub, writer }
    }

    /// Spawn one driver task per spec
    pub fn spawn(self, specs: Vec<ArchiveSpec>) -> Vec<JoinHandle<()>> {
        specs
            .into_iter()
            .map(|spec| {
                info!(
                    dim = %spec.dim,
                    interval_secs = spec.interval.as_secs(),
                    "archiving dimension"
                );
                let hub = self.hub.clone();
                let writer = self.writer.clone();
                tokio::spawn(drive(hub, writer, spec))
            })
            .collect()
    }
}

async fn drive(hub: Arc<StatsHub>, writer: Arc<dyn WarehouseWriter>, spec: ArchiveSpec) {
    loop {
        let now = Utc::now();
        let boundary = truncate_to_interval(now, spec.interval)
            + chrono::Duration::from_std(spec.interval).unwrap_or_else(|_| chrono::Duration::zero());
        let wait = (boundary - now).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;

        if let Err(e) = archive_once(&hub, writer.as_ref(), &spec).await {
            warn!(dim = %spec.dim, error = %e, "archival failed, retrying next interval");
        }
    }
}

async fn archive_once(
    hub: &StatsHub,
    writer: &dyn WarehouseWriter,
    spec: &ArchiveSpec,
) -> Result<()> {
    let snapshot = hub.query_dims(std::slice::from_ref(&spec.dim)).await?;
    let bucket = truncate_to_interval(Utc::now(), spec.interval);
    for (dim_name, dim_stats) in &snapshot {
        writer.write_snapshot(dim_name, dim_stats, bucket).await?;
    }
    Ok(())
}
