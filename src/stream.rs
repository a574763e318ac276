//! Streaming fan-out
//!
//! A single fan-out task owns the subscriber registry and the ring buffer of
//! recent snapshots; registration, closure and the interval tick are
//! multiplexed through its event loop, so no lock guards the registry.
//!
//! ```text
//!              ┌────────────────────────────┐
//!  subscribe ─▶│        fan-out task        │◀─ interval tick
//!  close ─────▶│  registry + ring buffer    │──▶ query_dims
//!              └─────────────┬──────────────┘
//!                            │ bounded mailboxes
//!                   ┌────────┴────────┐
//!                   ▼                 ▼
//!              subscriber 1 …   subscriber N
//! ```
//!
//! Every `interval` the task queries the dimensions its subscribers ask
//! about, wraps the snapshot in a [`StreamingUpdate`], remembers it in the
//! ring buffer, and pushes it into every subscriber's mailbox. Subscribers
//! project the shared snapshot down to the `{dimKey → value}` map matching
//! their filter. New subscribers are seeded with the buffered snapshots.

use crate::engine::{DimSnapshot, StatsHub};
use crate::error::Error;
use crate::model::{truncate_to_interval, Stats};
use crate::ring::RingBuffer;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the streaming fan-out
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// How often subscribers receive a fresh snapshot
    /// Default: 30 seconds
    pub interval: Duration,

    /// How much history the ring buffer retains for seeding new subscribers
    /// Default: 1 hour
    pub history: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            history: Duration::from_secs(60 * 60),
        }
    }
}

impl StreamConfig {
    /// Ring buffer capacity implied by `history / interval`
    pub fn ring_capacity(&self) -> usize {
        let ticks = self.history.as_millis() / self.interval.as_millis().max(1);
        (ticks as usize).max(1)
    }

    /// Mailbox bound per subscriber: enough for a full seed plus live ticks
    pub fn mailbox_capacity(&self) -> usize {
        self.ring_capacity() * 2
    }
}

// ============================================================================
// Filters and updates
// ============================================================================

/// Which stat a subscriber projects out of the snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatSelector {
    /// Project `counters[name]`
    Counter,
    /// Project `gaugesCurrent[name]` when non-zero, else `gauges[name]`
    Gauge,
    /// Member cardinality surfaces under `gauges[name]`
    Member,
}

impl std::str::FromStr for StatSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "counter" => Ok(StatSelector::Counter),
            "gauge" => Ok(StatSelector::Gauge),
            "member" => Ok(StatSelector::Member),
            other => Err(Error::Validation(format!("unknown stat type '{other}'"))),
        }
    }
}

/// One subscription's projection filter
#[derive(Debug, Clone)]
pub struct StreamFilter {
    /// Dimension to watch, lowercased
    pub dim_name: String,
    /// A single dimension key, or `None` for `*`
    pub dim_key: Option<String>,
    /// Stat kind to project
    pub stat_type: StatSelector,
    /// Stat name to project
    pub stat_name: String,
}

impl StreamFilter {
    /// Parse the path form `<dimName>/<dimKey|*>/<statType>/<statName>`
    pub fn parse(
        dim_name: &str,
        dim_key: &str,
        stat_type: &str,
        stat_name: &str,
    ) -> Result<Self, Error> {
        if dim_name.is_empty() || stat_name.is_empty() {
            return Err(Error::Validation(
                "dimension and stat name must not be empty".into(),
            ));
        }
        let dim_key = match dim_key {
            "*" => None,
            key => Some(key.to_lowercase()),
        };
        Ok(Self {
            dim_name: dim_name.to_lowercase(),
            dim_key,
            stat_type: stat_type.parse()?,
            stat_name: stat_name.to_string(),
        })
    }

    /// Project a snapshot down to `{dimKey → value}` for this filter.
    ///
    /// Keys with no recorded value for the stat are omitted.
    pub fn project(&self, update: &StreamingUpdate) -> BTreeMap<String, i64> {
        let mut values = BTreeMap::new();
        let Some(dim) = update.dims.get(&self.dim_name) else {
            return values;
        };
        for (dim_key, stats) in dim {
            if let Some(wanted) = &self.dim_key {
                if wanted != dim_key {
                    continue;
                }
            }
            if let Some(value) = self.value_of(stats) {
                values.insert(dim_key.clone(), value);
            }
        }
        values
    }

    fn value_of(&self, stats: &Stats) -> Option<i64> {
        match self.stat_type {
            StatSelector::Counter => stats.counters.get(&self.stat_name).copied(),
            StatSelector::Gauge | StatSelector::Member => {
                match stats.gauges_current.get(&self.stat_name) {
                    Some(&current) if current != 0 => Some(current),
                    _ => stats.gauges.get(&self.stat_name).copied(),
                }
            }
        }
    }
}

/// One interval's rollup snapshot, shared across subscribers
#[derive(Debug)]
pub struct StreamingUpdate {
    /// The interval boundary this snapshot belongs to
    pub as_of: DateTime<Utc>,
    /// Per-dimension rollups as the query engine produced them
    pub dims: DimSnapshot,
}

type SharedUpdate = Arc<StreamingUpdate>;

// ============================================================================
// Handle
// ============================================================================

/// A registered subscriber's receiving side
pub struct Subscription {
    /// Registry id, used to deregister on close
    pub id: u64,
    /// Snapshot mailbox, bounded by [`StreamConfig::mailbox_capacity`]
    pub updates: mpsc::Receiver<SharedUpdate>,
}

struct NewSubscriber {
    filter: StreamFilter,
    tx: mpsc::Sender<SharedUpdate>,
    id_tx: oneshot::Sender<u64>,
}

/// Cheap handle for registering and deregistering subscribers
#[derive(Clone)]
pub struct StreamHandle {
    new_tx: mpsc::Sender<NewSubscriber>,
    closed_tx: mpsc::Sender<u64>,
    mailbox_capacity: usize,
}

impl StreamHandle {
    /// Register a subscriber; returns `None` when the fan-out has shut down
    pub async fn subscribe(&self, filter: StreamFilter) -> Option<Subscription> {
        let (tx, rx) = mpsc::channel(self.mailbox_capacity);
        let (id_tx, id_rx) = oneshot::channel();
        self.new_tx
            .send(NewSubscriber { filter, tx, id_tx })
            .await
            .ok()?;
        let id = id_rx.await.ok()?;
        Some(Subscription { id, updates: rx })
    }

    /// Move a subscriber to CLOSED, removing it from the registry
    pub async fn unsubscribe(&self, id: u64) {
        let _ = self.closed_tx.send(id).await;
    }
}

// ============================================================================
// Fan-out task
// ============================================================================

struct Registered {
    filter: StreamFilter,
    tx: mpsc::Sender<SharedUpdate>,
}

/// Spawn the fan-out task and return its handle
pub fn spawn(hub: Arc<StatsHub>, config: StreamConfig) -> StreamHandle {
    let (new_tx, new_rx) = mpsc::channel(1);
    let (closed_tx, closed_rx) = mpsc::channel(1);
    let mailbox_capacity = config.mailbox_capacity();
    tokio::spawn(fan_out(hub, config, new_rx, closed_rx));
    StreamHandle {
        new_tx,
        closed_tx,
        mailbox_capacity,
    }
}

async fn fan_out(
    hub: Arc<StatsHub>,
    config: StreamConfig,
    mut new_rx: mpsc::Receiver<NewSubscriber>,
    mut closed_rx: mpsc::Receiver<u64>,
) {
    let mut registry: HashMap<u64, Registered> = HashMap::new();
    let mut ring: RingBuffer<SharedUpdate> = RingBuffer::new(config.ring_capacity());
    let mut next_id: u64 = 0;

    loop {
        let boundary = truncate_to_interval(Utc::now(), config.interval)
            + chrono::Duration::from_std(config.interval).unwrap_or_else(|_| chrono::Duration::zero());
        let wait = (boundary - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        tokio::select! {
            subscriber = new_rx.recv() => {
                let Some(subscriber) = subscriber else { return };
                next_id += 1;
                // Seed the newcomer with buffered history before live ticks
                for update in ring.iter() {
                    let _ = subscriber.tx.try_send(update.clone());
                }
                registry.insert(next_id, Registered {
                    filter: subscriber.filter,
                    tx: subscriber.tx,
                });
                let _ = subscriber.id_tx.send(next_id);
                debug!(subscribers = registry.len(), "stream subscriber registered");
            }
            closed = closed_rx.recv() => {
                let Some(id) = closed else { return };
                registry.remove(&id);
                debug!(subscribers = registry.len(), "stream subscriber closed");
            }
            _ = tokio::time::sleep(wait) => {
                tick(&hub, &mut registry, &mut ring, boundary).await;
            }
        }
    }
}

async fn tick(
    hub: &StatsHub,
    registry: &mut HashMap<u64, Registered>,
    ring: &mut RingBuffer<SharedUpdate>,
    as_of: DateTime<Utc>,
) {
    if registry.is_empty() {
        return;
    }

    let dim_names: Vec<String> = registry
        .values()
        .map(|sub| sub.filter.dim_name.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let dims = match hub.query_dims(&dim_names).await {
        Ok(dims) => dims,
        Err(e) => {
            warn!(error = %e, "streaming query failed, skipping interval");
            return;
        }
    };

    let update: SharedUpdate = Arc::new(StreamingUpdate { as_of, dims });
    ring.push(update.clone());

    let mut gone = Vec::new();
    for (id, sub) in registry.iter() {
        match sub.tx.try_send(update.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => gone.push(*id),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(subscriber = *id, "stream mailbox full, dropping interval");
            }
        }
    }
    for id in gone {
        registry.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Periods;
    use crate::store::{MemoryStore, Store};
    use crate::model::StatsUpdate;

    fn snapshot_with(
        dim: &str,
        entries: &[(&str, &str, i64)],
    ) -> StreamingUpdate {
        // entries: (dim_key, stat_name, counter value)
        let mut dims: DimSnapshot = HashMap::new();
        let mut keys: HashMap<String, Stats> = HashMap::new();
        for (key, stat, value) in entries {
            keys.entry(key.to_string())
                .or_default()
                .counters
                .insert(stat.to_string(), *value);
        }
        dims.insert(dim.to_string(), keys);
        StreamingUpdate {
            as_of: Utc::now(),
            dims,
        }
    }

    #[test]
    fn ring_capacity_from_history() {
        let config = StreamConfig::default();
        assert_eq!(config.ring_capacity(), 120);
        assert_eq!(config.mailbox_capacity(), 240);
    }

    #[test]
    fn filter_parse_rules() {
        let filter = StreamFilter::parse("Country", "ES", "counter", "counterA").unwrap();
        assert_eq!(filter.dim_name, "country");
        assert_eq!(filter.dim_key.as_deref(), Some("es"));

        let filter = StreamFilter::parse("country", "*", "gauge", "online").unwrap();
        assert_eq!(filter.dim_key, None);

        assert!(StreamFilter::parse("country", "es", "histogram", "x").is_err());
        assert!(StreamFilter::parse("", "es", "counter", "x").is_err());
    }

    #[test]
    fn project_single_key() {
        let update = snapshot_with("country", &[("es", "counterA", 50), ("de", "counterA", 70)]);
        let filter = StreamFilter::parse("country", "es", "counter", "counterA").unwrap();
        let values = filter.project(&update);
        assert_eq!(values.len(), 1);
        assert_eq!(values["es"], 50);
    }

    #[test]
    fn project_wildcard_includes_all_keys() {
        let update = snapshot_with("country", &[("es", "counterA", 50), ("de", "counterA", 70)]);
        let filter = StreamFilter::parse("country", "*", "counter", "counterA").unwrap();
        let values = filter.project(&update);
        assert_eq!(values.len(), 2);
        assert_eq!(values["de"], 70);
    }

    #[test]
    fn project_gauge_prefers_current_bucket() {
        let mut stats = Stats::default();
        stats.gauges.insert("online".into(), 3);
        stats.gauges_current.insert("online".into(), 7);

        let mut prior_only = Stats::default();
        prior_only.gauges.insert("online".into(), 4);

        let mut dims: DimSnapshot = HashMap::new();
        dims.insert(
            "country".into(),
            HashMap::from([("es".to_string(), stats), ("de".to_string(), prior_only)]),
        );
        let update = StreamingUpdate {
            as_of: Utc::now(),
            dims,
        };

        let filter = StreamFilter::parse("country", "*", "gauge", "online").unwrap();
        let values = filter.project(&update);
        assert_eq!(values["es"], 7);
        assert_eq!(values["de"], 4);
    }

    #[test]
    fn project_missing_dim_is_empty() {
        let update = snapshot_with("country", &[("es", "counterA", 50)]);
        let filter = StreamFilter::parse("user", "*", "counter", "counterA").unwrap();
        assert!(filter.project(&update).is_empty());
    }

    #[tokio::test]
    async fn fan_out_delivers_interval_snapshots() {
        let store = MemoryStore::new();
        let hub = Arc::new(StatsHub::new(
            Arc::new(store) as Arc<dyn Store>,
            Periods::default(),
        ));

        let mut update = StatsUpdate::default();
        update.dims.insert("country".into(), "es".into());
        update.stats.counters.insert("counterA".into(), 50);
        hub.write("myid1", &update).await.unwrap();

        let handle = spawn(
            hub,
            StreamConfig {
                interval: Duration::from_millis(50),
                history: Duration::from_millis(500),
            },
        );

        let filter = StreamFilter::parse("country", "es", "counter", "counterA").unwrap();
        let mut sub = handle.subscribe(filter.clone()).await.unwrap();

        let update = tokio::time::timeout(Duration::from_secs(2), sub.updates.recv())
            .await
            .expect("tick within deadline")
            .expect("fan-out alive");
        let values = filter.project(&update);
        assert_eq!(values.get("es"), Some(&50));

        handle.unsubscribe(sub.id).await;
    }
}
