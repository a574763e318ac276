//! The rollup engine
//!
//! [`StatsHub`] is the facade over the write and read paths. Both sides speak
//! the pipelined store protocol: a connection is borrowed for one logical
//! batch, the batch queues every command up front in a materialized order,
//! flushes once, and reads replies back in the same order.
//!
//! Writes eagerly maintain one rollup key per `(dimension, key, stat)` so
//! reads never scan per-contributor detail keys. Reads reconstruct per-
//! dimension [`Stats`] and synthesize the `total` dimension key in-process;
//! `total` is never persisted.

mod query;
mod write;

use crate::error::Result;
use crate::model::{Periods, Stats, StatsUpdate};
use crate::store::Store;
use std::collections::HashMap;
use std::sync::Arc;

/// Per-dimension query result: dimension name → dimension key → stats
pub type DimSnapshot = HashMap<String, HashMap<String, Stats>>;

/// The write/read engine over the shared store
pub struct StatsHub {
    store: Arc<dyn Store>,
    periods: Periods,
}

impl StatsHub {
    /// Create a hub over a store
    pub fn new(store: Arc<dyn Store>, periods: Periods) -> Self {
        Self { store, periods }
    }

    /// The gauge bucketing configuration
    pub fn periods(&self) -> &Periods {
        &self.periods
    }

    /// Post stats for one contributor, rolling them up into every declared
    /// dimension.
    ///
    /// Dimension names and keys are lowercased; the reserved dimension key
    /// `total` fails validation before any store I/O.
    pub async fn write(&self, id: &str, update: &StatsUpdate) -> Result<()> {
        self.write_update(id, update).await
    }

    /// Query rollups for the requested dimensions; an empty slice queries
    /// every dimension on record.
    pub async fn query_dims(&self, dim_names: &[String]) -> Result<DimSnapshot> {
        self.query_snapshot(dim_names).await
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}
