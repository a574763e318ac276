//! The write path
//!
//! One submission fans out into at most four pipelined batches, one per stat
//! kind, on a single borrowed connection:
//!
//! 1. drain residual replies (a prior aborted batch must not misalign ours)
//! 2. queue the detail write for every stat name, in sorted order
//! 3. queue detail expiry for bucketed kinds, then flush
//! 4. receive the old detail value where the kind needs a delta, and queue
//!    the rollup op (and expiry) for every declared dimension
//! 5. record the stat names in the `key:<type>` directory
//!
//! After all four kinds, the dimension directory is updated and the batch is
//! flushed once; the sticky connection error is the single failure check.

use super::StatsHub;
use crate::error::{Error, Result};
use crate::model::{
    bucket_key, detail_scope, dim_key_dir, dim_scope, stat_key, StatKind, StatsUpdate, DIM_DIR,
};
use crate::store::{Command, Pipeline};
use chrono::Utc;
use std::collections::HashMap;

/// One value in a write batch
#[derive(Clone, Copy)]
enum StatValue<'a> {
    Int(i64),
    Member(&'a str),
}

impl<'a> StatValue<'a> {
    fn int(self) -> i64 {
        match self {
            StatValue::Int(v) => v,
            StatValue::Member(_) => 0,
        }
    }

    fn member(self) -> &'a str {
        match self {
            StatValue::Int(_) => "",
            StatValue::Member(m) => m,
        }
    }
}

fn sorted_int_entries(map: &HashMap<String, i64>) -> Vec<(&str, StatValue<'_>)> {
    let mut entries: Vec<_> = map
        .iter()
        .map(|(name, v)| (name.as_str(), StatValue::Int(*v)))
        .collect();
    entries.sort_by_key(|(name, _)| *name);
    entries
}

fn sorted_member_entries(map: &HashMap<String, String>) -> Vec<(&str, StatValue<'_>)> {
    let mut entries: Vec<_> = map
        .iter()
        .map(|(name, m)| (name.as_str(), StatValue::Member(m.as_str())))
        .collect();
    entries.sort_by_key(|(name, _)| *name);
    entries
}

/// The detail operation for one stat
fn detail_command(kind: StatKind, key: String, value: StatValue<'_>) -> Command {
    match kind {
        StatKind::CounterInc => Command::IncrBy(key, value.int()),
        StatKind::CounterSet | StatKind::Gauge => Command::GetSet(key, value.int()),
        StatKind::Member => Command::SAdd(key, vec![value.member().to_string()]),
    }
}

/// The rollup operation for one stat under one dimension key
fn rollup_command(kind: StatKind, key: String, value: StatValue<'_>, delta: i64) -> Command {
    match kind {
        StatKind::CounterInc => Command::IncrBy(key, value.int()),
        StatKind::CounterSet | StatKind::Gauge => Command::IncrBy(key, delta),
        StatKind::Member => Command::SAdd(key, vec![value.member().to_string()]),
    }
}

impl StatsHub {
    pub(crate) async fn write_update(&self, id: &str, update: &StatsUpdate) -> Result<()> {
        if id.is_empty() {
            return Err(Error::Validation("contributor id must not be empty".into()));
        }
        let dims = update.normalized_dims()?;

        let now = Utc::now();
        let bucket = self.periods().bucket_start(now);
        let expires = self.periods().expires_at(bucket);

        let mut pipe = self.store().pipeline().await?;
        let pipe = pipe.as_mut();

        self.write_kind(
            pipe,
            id,
            StatKind::CounterSet,
            &sorted_int_entries(&update.stats.counters),
            &dims,
            bucket,
            expires,
        )
        .await?;
        self.write_kind(
            pipe,
            id,
            StatKind::CounterInc,
            &sorted_int_entries(&update.stats.increments),
            &dims,
            bucket,
            expires,
        )
        .await?;
        self.write_kind(
            pipe,
            id,
            StatKind::Gauge,
            &sorted_int_entries(&update.stats.gauges),
            &dims,
            bucket,
            expires,
        )
        .await?;
        self.write_kind(
            pipe,
            id,
            StatKind::Member,
            &sorted_member_entries(&update.stats.members),
            &dims,
            bucket,
            expires,
        )
        .await?;

        // Keep the dimension directory current; SADD is idempotent so
        // concurrent writers race safely.
        for (dim_name, dim_key) in &dims {
            pipe.send(Command::SAdd(DIM_DIR.to_string(), vec![dim_name.clone()]));
            pipe.send(Command::SAdd(dim_key_dir(dim_name), vec![dim_key.clone()]));
        }
        pipe.flush().await?;
        Ok(())
    }

    /// Write one stat kind's batch: details first, then per-dimension rollups.
    ///
    /// For kinds that need a delta the detail write is a `GETSET`, so the
    /// rollup can be maintained with a single `INCRBY new - old` per
    /// dimension key instead of a scan over contributor ids.
    async fn write_kind(
        &self,
        pipe: &mut dyn Pipeline,
        id: &str,
        kind: StatKind,
        entries: &[(&str, StatValue<'_>)],
        dims: &[(String, String)],
        bucket: i64,
        expires: i64,
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        pipe.drain().await?;

        let scope = detail_scope(id);
        for (name, value) in entries {
            let mut key = stat_key(kind.store_type(), &scope, name);
            if kind.bucketed() {
                key = bucket_key(&key, bucket);
            }
            pipe.send(detail_command(kind, key, *value));
        }

        if kind.bucketed() {
            for (name, _) in entries {
                let key = bucket_key(&stat_key(kind.store_type(), &scope, name), bucket);
                pipe.send(Command::ExpireAt(key, expires));
            }
        }

        pipe.flush().await?;

        for (name, value) in entries {
            let delta = if kind.needs_delta() {
                let (old, _) = pipe.receive_int().await?;
                value.int() - old
            } else {
                0
            };

            for (dim_name, dim_key) in dims {
                let mut key = stat_key(kind.store_type(), &dim_scope(dim_name, dim_key), name);
                if kind.bucketed() {
                    key = bucket_key(&key, bucket);
                }
                pipe.send(rollup_command(kind, key.clone(), *value, delta));
                if kind.bucketed() {
                    pipe.send(Command::ExpireAt(key, expires));
                }
            }
        }

        let names: Vec<String> = entries.iter().map(|(name, _)| name.to_string()).collect();
        pipe.send(Command::SAdd(kind.name_dir(), names));
        Ok(())
    }
}
