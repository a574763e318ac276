//! End-to-end rollup scenarios
//!
//! Drives the write and query engines through the full update/rollup/expiry
//! sequence with shortened periods. The suite always runs against the
//! in-memory store; set `REDIS_ADDR` (and optionally `REDIS_PASS`) to run
//! the same sequence against a live store. The live variant flushes the
//! target database first, so point it at a test instance.

use dimhub::model::Periods;
use dimhub::store::{MemoryStore, RedisStore, Store, StoreConfig};
use dimhub::{DimSnapshot, Stats, StatsUpdate};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn test_periods() -> Periods {
    // reporting 1.8s, buckets 2s
    Periods::with_reporting_period(Duration::from_millis(1800), Duration::from_millis(200))
}

async fn sleep_till_next_bucket(periods: &Periods) {
    let wait = periods.until_next_bucket(chrono::Utc::now());
    tokio::time::sleep(wait + Duration::from_millis(20)).await;
}

fn update(
    dims: &[(&str, &str)],
    counters: &[(&str, i64)],
    increments: &[(&str, i64)],
    gauges: &[(&str, i64)],
    members: &[(&str, &str)],
) -> StatsUpdate {
    fn int_map(entries: &[(&str, i64)]) -> HashMap<String, i64> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }
    StatsUpdate {
        dims: dims
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        stats: Stats {
            counters: int_map(counters),
            increments: int_map(increments),
            gauges: int_map(gauges),
            members: members
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        },
    }
}

fn counter(snapshot: &DimSnapshot, path: &str) -> i64 {
    let [dim, key, stat]: [&str; 3] = path
        .split(':')
        .collect::<Vec<_>>()
        .try_into()
        .expect("path is dim:key:stat");
    snapshot[dim][key].counters.get(stat).copied().unwrap_or(0)
}

fn gauge(snapshot: &DimSnapshot, path: &str) -> i64 {
    let [dim, key, stat]: [&str; 3] = path
        .split(':')
        .collect::<Vec<_>>()
        .try_into()
        .expect("path is dim:key:stat");
    snapshot[dim][key].gauges.get(stat).copied().unwrap_or(0)
}

async fn run_scenarios(store: Arc<dyn Store>) {
    let periods = test_periods();
    let hub = dimhub::StatsHub::new(store, periods);
    let query_dims = vec!["country".to_string(), "user".to_string()];

    // A dim key of "total" is reserved; nothing may reach the store
    let bad = update(&[("country", "total")], &[("counterA", 10)], &[], &[], &[]);
    let err = hub.write("myid1", &bad).await.unwrap_err();
    assert!(err.is_validation());
    let clean = hub.query_dims(&[]).await.unwrap();
    assert!(clean.is_empty(), "reserved dim key must not create state");

    // S1: single id, two dims
    let first = update(
        &[("country", "es"), ("user", "bob")],
        &[("counterA", 50)],
        &[("counterB", 500)],
        &[("gaugeA", 5000), ("gaugeAA", 0)],
        &[("gaugeB", "item1")],
    );
    sleep_till_next_bucket(&periods).await;
    hub.write("myid1", &first).await.unwrap();
    sleep_till_next_bucket(&periods).await;
    let snapshot = hub.query_dims(&query_dims).await.unwrap();

    assert_eq!(counter(&snapshot, "country:es:counterA"), 50);
    assert_eq!(counter(&snapshot, "country:es:counterB"), 500);
    assert_eq!(gauge(&snapshot, "country:es:gaugeA"), 5000);
    assert_eq!(gauge(&snapshot, "country:es:gaugeAA"), 0);
    assert!(
        snapshot["country"]["es"].gauges.contains_key("gaugeAA"),
        "a written zero gauge is present, not merely defaulted"
    );
    assert_eq!(gauge(&snapshot, "country:es:gaugeB"), 1);
    assert_eq!(counter(&snapshot, "user:bob:counterA"), 50);
    assert_eq!(counter(&snapshot, "user:bob:counterB"), 500);
    assert_eq!(gauge(&snapshot, "user:bob:gaugeA"), 5000);
    assert_eq!(gauge(&snapshot, "user:bob:gaugeB"), 1);

    assert_eq!(counter(&snapshot, "country:total:counterA"), 50);
    assert_eq!(counter(&snapshot, "country:total:counterB"), 500);
    assert_eq!(gauge(&snapshot, "country:total:gaugeA"), 5000);
    assert_eq!(gauge(&snapshot, "country:total:gaugeAA"), 0);
    assert_eq!(gauge(&snapshot, "country:total:gaugeB"), 1);
    assert_eq!(counter(&snapshot, "user:total:counterA"), 50);
    assert_eq!(gauge(&snapshot, "user:total:gaugeB"), 1);

    // S2: update the same id; counters replace, increments add, members grow
    let second = update(
        &[("country", "es"), ("user", "bob")],
        &[("counterA", 60)],
        &[("counterB", 600)],
        &[("gaugeA", 0), ("gaugeAA", 50000)],
        &[("gaugeB", "item2")],
    );
    sleep_till_next_bucket(&periods).await;
    hub.write("myid1", &second).await.unwrap();
    sleep_till_next_bucket(&periods).await;
    let snapshot = hub.query_dims(&query_dims).await.unwrap();

    assert_eq!(counter(&snapshot, "country:es:counterA"), 60);
    assert_eq!(counter(&snapshot, "country:es:counterB"), 1100);
    assert_eq!(gauge(&snapshot, "country:es:gaugeA"), 0);
    assert_eq!(gauge(&snapshot, "country:es:gaugeAA"), 50000);
    assert_eq!(gauge(&snapshot, "country:es:gaugeB"), 2);
    assert_eq!(counter(&snapshot, "user:bob:counterA"), 60);
    assert_eq!(counter(&snapshot, "user:bob:counterB"), 1100);
    assert_eq!(gauge(&snapshot, "user:bob:gaugeB"), 2);
    assert_eq!(counter(&snapshot, "country:total:counterA"), 60);
    assert_eq!(gauge(&snapshot, "country:total:gaugeAA"), 50000);

    // S3: a duplicate member changes nothing
    let duplicate = update(
        &[("country", "es"), ("user", "bob")],
        &[],
        &[],
        &[],
        &[("gaugeB", "item2")],
    );
    sleep_till_next_bucket(&periods).await;
    hub.write("myid1", &duplicate).await.unwrap();
    sleep_till_next_bucket(&periods).await;
    let snapshot = hub.query_dims(&query_dims).await.unwrap();
    assert_eq!(gauge(&snapshot, "country:es:gaugeB"), 2);
    assert_eq!(gauge(&snapshot, "user:bob:gaugeB"), 2);

    // S4: second id in another country; user rollup spans both ids
    sleep_till_next_bucket(&periods).await;
    let keep_spanish = update(
        &[("country", "es"), ("user", "bob")],
        &[],
        &[],
        &[("gaugeA", 0), ("gaugeAA", 50000)],
        &[],
    );
    hub.write("myid1", &keep_spanish).await.unwrap();
    let german = update(
        &[("country", "de"), ("user", "bob")],
        &[("counterA", 70)],
        &[("counterB", 700)],
        &[("gaugeA", 7000), ("gaugeAA", 70000)],
        &[("gaugeB", "item3")],
    );
    hub.write("myid2", &german).await.unwrap();
    sleep_till_next_bucket(&periods).await;
    let snapshot = hub.query_dims(&query_dims).await.unwrap();

    assert_eq!(counter(&snapshot, "country:es:counterA"), 60);
    assert_eq!(counter(&snapshot, "country:es:counterB"), 1100);
    assert_eq!(gauge(&snapshot, "country:es:gaugeA"), 0);
    assert_eq!(gauge(&snapshot, "country:es:gaugeAA"), 50000);
    assert_eq!(gauge(&snapshot, "country:es:gaugeB"), 2);
    assert_eq!(counter(&snapshot, "country:de:counterA"), 70);
    assert_eq!(counter(&snapshot, "country:de:counterB"), 700);
    assert_eq!(gauge(&snapshot, "country:de:gaugeA"), 7000);
    assert_eq!(gauge(&snapshot, "country:de:gaugeAA"), 70000);
    assert_eq!(gauge(&snapshot, "country:de:gaugeB"), 1);
    assert_eq!(counter(&snapshot, "user:bob:counterA"), 130);
    assert_eq!(counter(&snapshot, "user:bob:counterB"), 1800);
    assert_eq!(gauge(&snapshot, "user:bob:gaugeA"), 7000);
    assert_eq!(gauge(&snapshot, "user:bob:gaugeB"), 3);

    assert_eq!(counter(&snapshot, "country:total:counterA"), 130);
    assert_eq!(counter(&snapshot, "country:total:counterB"), 1800);
    assert_eq!(gauge(&snapshot, "country:total:gaugeA"), 7000);
    assert_eq!(gauge(&snapshot, "country:total:gaugeAA"), 120000);
    assert_eq!(gauge(&snapshot, "country:total:gaugeB"), 3);
    assert_eq!(counter(&snapshot, "user:total:counterA"), 130);
    assert_eq!(gauge(&snapshot, "user:total:gaugeAA"), 120000);
    assert_eq!(gauge(&snapshot, "user:total:gaugeB"), 3);

    // S5: one silent bucket later, manual gauges read zero; members persist
    sleep_till_next_bucket(&periods).await;
    let snapshot = hub.query_dims(&query_dims).await.unwrap();
    assert_eq!(gauge(&snapshot, "country:es:gaugeA"), 0);
    assert_eq!(gauge(&snapshot, "country:es:gaugeB"), 2);
    assert_eq!(gauge(&snapshot, "country:de:gaugeA"), 0);
    assert_eq!(gauge(&snapshot, "country:de:gaugeB"), 1);
    assert_eq!(gauge(&snapshot, "user:bob:gaugeA"), 0);
    assert_eq!(gauge(&snapshot, "user:bob:gaugeB"), 3);

    // Counters survive bucket turnover untouched
    assert_eq!(counter(&snapshot, "country:es:counterA"), 60);
    assert_eq!(counter(&snapshot, "user:total:counterB"), 1800);
}

#[tokio::test]
async fn scenarios_against_memory_store() {
    run_scenarios(Arc::new(MemoryStore::new())).await;
}

#[tokio::test]
async fn scenarios_against_live_redis() {
    let Ok(addr) = std::env::var("REDIS_ADDR") else {
        eprintln!("REDIS_ADDR not set, skipping live store scenarios");
        return;
    };
    let pass = std::env::var("REDIS_PASS").ok();
    let config = StoreConfig::for_addr(&addr, pass.as_deref());

    // Clear out the test database before starting
    let client = redis::Client::open(config.url.clone()).expect("store url");
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .expect("store reachable");
    redis::cmd("FLUSHDB")
        .query_async::<()>(&mut conn)
        .await
        .expect("flushdb");

    let store = RedisStore::connect(config).await.expect("store connects");
    run_scenarios(Arc::new(store)).await;
}
