//! The read path
//!
//! A query walks the dimension directory and reconstructs per-dimension
//! [`Stats`](crate::model::Stats) in three pipelined passes, one per stat
//! kind on record. Pipelining needs request/reply alignment, so dimension
//! names, their keys and the stat names are materialized into sorted lists
//! before anything is queued, and the same lists drive the receive loop.
//!
//! Gauges are read from two buckets: the prior period (the most recent fully
//! closed bucket, exposed as `gauges`) and the still-open current period
//! (`gaugesCurrent`). Member sets are read as their cardinality and surface
//! as gauges. The synthetic `total` key accumulates found values per
//! dimension and is never read from the store.

use super::{DimSnapshot, StatsHub};
use crate::error::Result;
use crate::model::{bucket_key, dim_key_dir, dim_scope, stat_key, Stats, TOTAL_KEY, DIM_DIR};
use crate::store::{strings_reply, Command, Pipeline};
use chrono::Utc;
use std::collections::HashMap;

/// One pipelined read pass over every `(dimension, key, stat)` triple
#[derive(Clone, Copy)]
enum ReadPass {
    Counters,
    Gauges { prior: i64, current: i64 },
    Members,
}

impl ReadPass {
    fn store_type(self) -> &'static str {
        match self {
            ReadPass::Counters => "counter",
            ReadPass::Gauges { .. } => "gauge",
            ReadPass::Members => "member",
        }
    }

    fn name_dir(self) -> String {
        format!("key:{}", self.store_type())
    }
}

fn slot<'a>(
    snapshot: &'a mut DimSnapshot,
    dim_name: &str,
    dim_key: &str,
) -> Option<&'a mut Stats> {
    snapshot.get_mut(dim_name).and_then(|dim| dim.get_mut(dim_key))
}

impl StatsHub {
    pub(crate) async fn query_snapshot(&self, dim_names: &[String]) -> Result<DimSnapshot> {
        let mut pipe = self.store().pipeline().await?;
        let pipe = pipe.as_mut();

        let dim_names: Vec<String> = if dim_names.is_empty() {
            let mut names =
                strings_reply(pipe.do_cmd(Command::SMembers(DIM_DIR.to_string())).await?)?;
            names.sort();
            names
        } else {
            dim_names.to_vec()
        };

        // Materialize each dimension's key list and pre-create every Stats
        // slot, including the synthetic total.
        let mut dim_keys: HashMap<String, Vec<String>> = HashMap::new();
        let mut snapshot: DimSnapshot = HashMap::new();
        for dim_name in &dim_names {
            let mut keys =
                strings_reply(pipe.do_cmd(Command::SMembers(dim_key_dir(dim_name))).await?)?;
            keys.sort();

            let mut dim_stats: HashMap<String, Stats> = keys
                .iter()
                .map(|key| (key.clone(), Stats::default()))
                .collect();
            dim_stats.insert(TOTAL_KEY.to_string(), Stats::default());

            dim_keys.insert(dim_name.clone(), keys);
            snapshot.insert(dim_name.clone(), dim_stats);
        }

        let now = Utc::now();
        let current = self.periods().bucket_start(now);
        let prior = self.periods().prior_bucket_start(now);

        self.read_pass(pipe, &dim_names, &dim_keys, &mut snapshot, ReadPass::Counters)
            .await?;
        self.read_pass(
            pipe,
            &dim_names,
            &dim_keys,
            &mut snapshot,
            ReadPass::Gauges { prior, current },
        )
        .await?;
        self.read_pass(pipe, &dim_names, &dim_keys, &mut snapshot, ReadPass::Members)
            .await?;

        Ok(snapshot)
    }

    async fn read_pass(
        &self,
        pipe: &mut dyn Pipeline,
        dim_names: &[String],
        dim_keys: &HashMap<String, Vec<String>>,
        snapshot: &mut DimSnapshot,
        pass: ReadPass,
    ) -> Result<()> {
        let mut stat_names = strings_reply(pipe.do_cmd(Command::SMembers(pass.name_dir())).await?)?;
        stat_names.sort();
        if stat_names.is_empty() {
            return Ok(());
        }

        for dim_name in dim_names {
            for dim_key in &dim_keys[dim_name] {
                for stat in &stat_names {
                    let base = stat_key(pass.store_type(), &dim_scope(dim_name, dim_key), stat);
                    match pass {
                        ReadPass::Counters => pipe.send(Command::Get(base)),
                        ReadPass::Gauges { prior, current } => {
                            pipe.send(Command::Get(bucket_key(&base, prior)));
                            pipe.send(Command::Get(bucket_key(&base, current)));
                        }
                        ReadPass::Members => pipe.send(Command::SCard(base)),
                    }
                }
            }
        }
        pipe.flush().await?;

        for dim_name in dim_names {
            let mut totals: HashMap<&str, i64> = HashMap::new();
            let mut totals_current: HashMap<&str, i64> = HashMap::new();

            for dim_key in &dim_keys[dim_name] {
                for stat in &stat_names {
                    // Replies must be consumed in queue order even when a
                    // snapshot slot is unexpectedly absent.
                    match pass {
                        ReadPass::Counters => {
                            let (val, found) = pipe.receive_int().await?;
                            if found {
                                if let Some(entry) = slot(snapshot, dim_name, dim_key) {
                                    entry.counters.insert(stat.clone(), val);
                                }
                                *totals.entry(stat.as_str()).or_insert(0) += val;
                            }
                        }
                        ReadPass::Gauges { .. } => {
                            let (val, found) = pipe.receive_int().await?;
                            if found {
                                if let Some(entry) = slot(snapshot, dim_name, dim_key) {
                                    entry.gauges.insert(stat.clone(), val);
                                }
                                *totals.entry(stat.as_str()).or_insert(0) += val;
                            }
                            let (val, found) = pipe.receive_int().await?;
                            if found {
                                if let Some(entry) = slot(snapshot, dim_name, dim_key) {
                                    entry.gauges_current.insert(stat.clone(), val);
                                }
                                *totals_current.entry(stat.as_str()).or_insert(0) += val;
                            }
                        }
                        ReadPass::Members => {
                            let (val, found) = pipe.receive_int().await?;
                            if found {
                                if let Some(entry) = slot(snapshot, dim_name, dim_key) {
                                    entry.gauges.insert(stat.clone(), val);
                                }
                                *totals.entry(stat.as_str()).or_insert(0) += val;
                            }
                        }
                    }
                }
            }

            if let Some(total) = slot(snapshot, dim_name, TOTAL_KEY) {
                match pass {
                    ReadPass::Counters => {
                        for (stat, sum) in totals {
                            total.counters.insert(stat.to_string(), sum);
                        }
                    }
                    ReadPass::Gauges { .. } | ReadPass::Members => {
                        for (stat, sum) in totals {
                            total.gauges.insert(stat.to_string(), sum);
                        }
                        for (stat, sum) in totals_current {
                            total.gauges_current.insert(stat.to_string(), sum);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
