//! Stat records, the key scheme and period bucketing
//!
//! All persisted state lives in the store under structured keys:
//!
//! ```text
//! <type>:<scope>:<name>[:<bucketUnix>]     stat values
//!   scope = detail:<id> | dim:<dimName>:<dimKey>
//!   type  = counter | gauge | member
//! key:<type>                               set of stat names seen per type
//! dim                                      set of dimension names seen
//! dim:<name>                               set of keys seen for a dimension
//! ```
//!
//! Dashes in generated keys are replaced by underscores so that stat names
//! like `bytes-given` stay addressable; clients keep seeing the dashed name.

use crate::error::Error;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Reserved dimension key, synthesized on read and rejected on write
pub const TOTAL_KEY: &str = "total";

/// Directory set holding every dimension name observed
pub const DIM_DIR: &str = "dim";

// ============================================================================
// Stats
// ============================================================================

/// A bundle of stats for one entity or one dimension key
///
/// `increments` is write-only: queries fold increments into `counters`.
/// `members` is write-only as well; the set cardinality surfaces as a gauge
/// under the member stat's name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Absolute counters, replace-on-write
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub counters: HashMap<String, i64>,

    /// Signed deltas, add-on-write
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub increments: HashMap<String, i64>,

    /// Gauges from the most recent fully closed period bucket
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub gauges: HashMap<String, i64>,

    /// Gauges from the still-open period bucket
    #[serde(
        default,
        rename = "gaugesCurrent",
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub gauges_current: HashMap<String, i64>,

    /// Set-membership samples: stat name to member identity
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub members: HashMap<String, String>,
}

impl Stats {
    /// True when no stat of any kind is present
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
            && self.increments.is_empty()
            && self.gauges.is_empty()
            && self.gauges_current.is_empty()
            && self.members.is_empty()
    }
}

/// A stats submission: a `Stats` bundle plus the dimensions it rolls up into
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsUpdate {
    /// Dimension name to dimension key, e.g. `{"country": "es"}`
    #[serde(default)]
    pub dims: HashMap<String, String>,

    /// The stats being reported
    #[serde(flatten)]
    pub stats: Stats,
}

impl StatsUpdate {
    /// Validate and lowercase the declared dimensions.
    ///
    /// Returns the dimensions as a sorted list for deterministic pipeline
    /// order. The reserved key `total` is rejected before any store I/O.
    pub fn normalized_dims(&self) -> Result<Vec<(String, String)>, Error> {
        let mut dims = Vec::with_capacity(self.dims.len());
        for (name, key) in &self.dims {
            let name = name.to_lowercase();
            let key = key.to_lowercase();
            if key == TOTAL_KEY {
                return Err(Error::Validation(format!(
                    "dimension key '{TOTAL_KEY}' is a reserved word"
                )));
            }
            dims.push((name, key));
        }
        dims.sort();
        Ok(dims)
    }
}

// ============================================================================
// Stat kinds
// ============================================================================

/// The four write semantics a submission carries.
///
/// Each kind maps to a store type, a detail operation and a rollup operation;
/// the write engine dispatches over this instead of per-kind callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    /// Absolute counter, `GETSET` detail, rollup incremented by the delta
    CounterSet,
    /// Monotonic increment, `INCRBY` on both detail and rollup
    CounterInc,
    /// Absolute gauge on period-bucketed, expiring keys
    Gauge,
    /// Set member, `SADD` on both detail and rollup
    Member,
}

impl StatKind {
    /// Key-type fragment this kind persists under
    pub fn store_type(self) -> &'static str {
        match self {
            StatKind::CounterSet | StatKind::CounterInc => "counter",
            StatKind::Gauge => "gauge",
            StatKind::Member => "member",
        }
    }

    /// Whether the rollup needs `new - old` from the detail write
    pub fn needs_delta(self) -> bool {
        matches!(self, StatKind::CounterSet | StatKind::Gauge)
    }

    /// Whether keys carry a period-bucket suffix and expire
    pub fn bucketed(self) -> bool {
        matches!(self, StatKind::Gauge)
    }

    /// Directory set recording every stat name seen for this kind
    pub fn name_dir(self) -> String {
        format!("key:{}", self.store_type())
    }
}

// ============================================================================
// Key scheme
// ============================================================================

/// Build a stat key from type, scope and stat name, normalizing dashes
pub fn stat_key(stat_type: &str, scope: &str, name: &str) -> String {
    format!("{stat_type}:{scope}:{name}").replace('-', "_")
}

/// Per-contributor scope fragment
pub fn detail_scope(id: &str) -> String {
    format!("detail:{id}")
}

/// Per-dimension rollup scope fragment
pub fn dim_scope(dim_name: &str, dim_key: &str) -> String {
    format!("dim:{dim_name}:{dim_key}")
}

/// Directory set holding every key seen for one dimension
pub fn dim_key_dir(dim_name: &str) -> String {
    format!("{DIM_DIR}:{dim_name}")
}

/// Qualify a key with a period bucket's unix-seconds start
pub fn bucket_key(key: &str, bucket_unix: i64) -> String {
    format!("{key}:{bucket_unix}")
}

// ============================================================================
// Periods
// ============================================================================

/// Reporting cadence and the derived gauge bucketing interval.
///
/// Gauge buckets are sized one slack wider than the reporting period so a
/// client reporting near a boundary with a skewed clock still lands in the
/// open bucket.
#[derive(Debug, Clone, Copy)]
pub struct Periods {
    /// How frequently clients report stats
    pub reporting_period: Duration,
    /// Slack added on top of the reporting period
    pub clock_slack: Duration,
}

impl Default for Periods {
    fn default() -> Self {
        Self {
            reporting_period: Duration::from_secs(5 * 60),
            clock_slack: Duration::from_secs(60),
        }
    }
}

impl Periods {
    /// Construct with an explicit reporting period, keeping the default slack
    pub fn with_reporting_period(reporting_period: Duration, clock_slack: Duration) -> Self {
        Self {
            reporting_period,
            clock_slack,
        }
    }

    /// The gauge bucketing interval (`reporting_period + clock_slack`)
    pub fn stats_period(&self) -> Duration {
        self.reporting_period + self.clock_slack
    }

    /// Start of the bucket containing `now`, in unix seconds
    pub fn bucket_start(&self, now: DateTime<Utc>) -> i64 {
        let period_ms = self.stats_period().as_millis() as i64;
        let now_ms = now.timestamp_millis();
        let start_ms = now_ms - now_ms.rem_euclid(period_ms);
        start_ms / 1000
    }

    /// Start of the most recent fully closed bucket, in unix seconds
    pub fn prior_bucket_start(&self, now: DateTime<Utc>) -> i64 {
        self.bucket_start(now) - self.stats_period().as_secs() as i64
    }

    /// Expiry instant for keys written into the bucket starting at
    /// `bucket_unix`: three buckets out
    pub fn expires_at(&self, bucket_unix: i64) -> i64 {
        bucket_unix + 3 * self.stats_period().as_secs() as i64
    }

    /// Wall-clock duration until the next bucket boundary
    pub fn until_next_bucket(&self, now: DateTime<Utc>) -> Duration {
        let period_ms = self.stats_period().as_millis() as i64;
        let now_ms = now.timestamp_millis();
        let next_ms = now_ms - now_ms.rem_euclid(period_ms) + period_ms;
        Duration::from_millis((next_ms - now_ms) as u64)
    }
}

/// Truncate `now` down to a multiple of `interval`
pub fn truncate_to_interval(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let interval_ms = interval.as_millis() as i64;
    let now_ms = now.timestamp_millis();
    let start_ms = now_ms - now_ms.rem_euclid(interval_ms);
    Utc.timestamp_millis_opt(start_ms)
        .single()
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_key_replaces_dashes() {
        let key = stat_key("counter", &dim_scope("country", "es"), "bytes-given");
        assert_eq!(key, "counter:dim:country:es:bytes_given");
    }

    #[test]
    fn detail_and_dim_scopes() {
        assert_eq!(detail_scope("instance-7"), "detail:instance-7");
        assert_eq!(
            stat_key("gauge", &detail_scope("instance-7"), "online"),
            "gauge:detail:instance_7:online"
        );
        assert_eq!(dim_key_dir("country"), "dim:country");
    }

    #[test]
    fn normalized_dims_lowercases_and_sorts() {
        let update = StatsUpdate {
            dims: HashMap::from([
                ("Country".to_string(), "ES".to_string()),
                ("user".to_string(), "Bob".to_string()),
            ]),
            ..Default::default()
        };
        let dims = update.normalized_dims().unwrap();
        assert_eq!(
            dims,
            vec![
                ("country".to_string(), "es".to_string()),
                ("user".to_string(), "bob".to_string()),
            ]
        );
    }

    #[test]
    fn reserved_total_rejected() {
        let update = StatsUpdate {
            dims: HashMap::from([("country".to_string(), "Total".to_string())]),
            ..Default::default()
        };
        assert!(update.normalized_dims().is_err());
    }

    #[test]
    fn bucket_math() {
        let periods = Periods::with_reporting_period(
            Duration::from_millis(1800),
            Duration::from_millis(200),
        );
        assert_eq!(periods.stats_period(), Duration::from_secs(2));

        let now = Utc.timestamp_opt(1_000_003, 0).unwrap();
        assert_eq!(periods.bucket_start(now), 1_000_002);
        assert_eq!(periods.prior_bucket_start(now), 1_000_000);
        assert_eq!(periods.expires_at(1_000_002), 1_000_008);
    }

    #[test]
    fn until_next_bucket_is_positive_and_bounded() {
        let periods = Periods::default();
        let wait = periods.until_next_bucket(Utc::now());
        assert!(wait <= periods.stats_period());
    }

    #[test]
    fn kind_dispatch_table() {
        assert_eq!(StatKind::CounterInc.store_type(), "counter");
        assert_eq!(StatKind::CounterSet.store_type(), "counter");
        assert_eq!(StatKind::Gauge.store_type(), "gauge");
        assert_eq!(StatKind::Member.store_type(), "member");

        assert!(StatKind::CounterSet.needs_delta());
        assert!(StatKind::Gauge.needs_delta());
        assert!(!StatKind::CounterInc.needs_delta());
        assert!(!StatKind::Member.needs_delta());

        assert!(StatKind::Gauge.bucketed());
        assert_eq!(StatKind::Member.name_dir(), "key:member");
    }

    #[test]
    fn stats_serialization_omits_empty_maps() {
        let mut stats = Stats::default();
        stats.counters.insert("counterA".to_string(), 50);
        let json = serde_json::to_string(&stats).unwrap();
        assert_eq!(json, r#"{"counters":{"counterA":50}}"#);

        stats.gauges_current.insert("gaugeA".to_string(), 1);
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("gaugesCurrent"));
    }

    #[test]
    fn update_deserializes_flat_stats() {
        let json = r#"{
            "dims": {"country": "es"},
            "counters": {"counterA": 50},
            "members": {"gaugeB": "item1"}
        }"#;
        let update: StatsUpdate = serde_json::from_str(json).unwrap();
        assert_eq!(update.dims["country"], "es");
        assert_eq!(update.stats.counters["counterA"], 50);
        assert_eq!(update.stats.members["gaugeB"], "item1");
    }
}
