//! In-memory store double
//!
//! Implements the same pipelined surface as the Redis-backed store against
//! process-local tables, so the write and query engines can be exercised in
//! tests without an external store. Key expiry is honoured lazily: expired
//! keys are dropped when next touched.
//!
//! Not suitable for production use; all data is lost on restart and nothing
//! is shared between processes.

use crate::error::StoreError;
use crate::store::command::{Command, Reply};
use crate::store::connection::{Pipeline, Store};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

#[derive(Default)]
struct MemoryState {
    strings: HashMap<String, String>,
    sets: HashMap<String, BTreeSet<String>>,
    /// Expiry instants in unix milliseconds
    expires: HashMap<String, i64>,
}

impl MemoryState {
    fn purge(&mut self, key: &str) {
        let now_ms = Utc::now().timestamp_millis();
        if let Some(&at_ms) = self.expires.get(key) {
            if at_ms <= now_ms {
                self.strings.remove(key);
                self.sets.remove(key);
                self.expires.remove(key);
            }
        }
    }

    fn apply(&mut self, cmd: Command) -> Result<Reply, StoreError> {
        match cmd {
            Command::Get(key) => {
                self.purge(&key);
                Ok(match self.strings.get(&key) {
                    Some(v) => Reply::Data(v.clone().into_bytes()),
                    None => Reply::Nil,
                })
            }
            Command::GetSet(key, val) => {
                self.purge(&key);
                self.expires.remove(&key);
                Ok(match self.strings.insert(key, val.to_string()) {
                    Some(old) => Reply::Data(old.into_bytes()),
                    None => Reply::Nil,
                })
            }
            Command::Set(key, val) => {
                self.purge(&key);
                self.expires.remove(&key);
                self.strings.insert(key, val.to_string());
                Ok(Reply::Status("OK".to_string()))
            }
            Command::IncrBy(key, delta) => {
                self.purge(&key);
                let current = match self.strings.get(&key) {
                    Some(v) => v.parse::<i64>().map_err(|_| {
                        StoreError::Protocol("value is not an integer".to_string())
                    })?,
                    None => 0,
                };
                let next = current + delta;
                self.strings.insert(key, next.to_string());
                Ok(Reply::Int(next))
            }
            Command::ExpireAt(key, at) => {
                self.purge(&key);
                if self.strings.contains_key(&key) || self.sets.contains_key(&key) {
                    self.expires.insert(key, at * 1000);
                    Ok(Reply::Int(1))
                } else {
                    Ok(Reply::Int(0))
                }
            }
            Command::SAdd(key, members) => {
                self.purge(&key);
                let set = self.sets.entry(key).or_default();
                let mut added = 0;
                for member in members {
                    if set.insert(member) {
                        added += 1;
                    }
                }
                Ok(Reply::Int(added))
            }
            Command::SRem(key, members) => {
                self.purge(&key);
                let mut removed = 0;
                if let Some(set) = self.sets.get_mut(&key) {
                    for member in &members {
                        if set.remove(member) {
                            removed += 1;
                        }
                    }
                }
                Ok(Reply::Int(removed))
            }
            Command::SMembers(key) => {
                self.purge(&key);
                Ok(match self.sets.get(&key) {
                    Some(set) => Reply::Array(
                        set.iter()
                            .map(|m| Reply::Data(m.clone().into_bytes()))
                            .collect(),
                    ),
                    None => Reply::Array(Vec::new()),
                })
            }
            Command::SCard(key) => {
                self.purge(&key);
                Ok(Reply::Int(
                    self.sets.get(&key).map(|s| s.len() as i64).unwrap_or(0),
                ))
            }
            Command::Ping => Ok(Reply::Status("PONG".to_string())),
        }
    }
}

/// Process-local store for tests and prototyping
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every key
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.strings.clear();
        state.sets.clear();
        state.expires.clear();
    }

    /// Raw string value for a key, if present and unexpired
    pub fn raw_get(&self, key: &str) -> Option<String> {
        let mut state = self.state.lock();
        state.purge(key);
        state.strings.get(key).cloned()
    }

    /// Number of live keys of either shape
    pub fn key_count(&self) -> usize {
        let state = self.state.lock();
        state.strings.len() + state.sets.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn pipeline(&self) -> Result<Box<dyn Pipeline>, StoreError> {
        Ok(Box::new(MemoryPipeline {
            state: self.state.clone(),
            pending: Vec::new(),
            replies: VecDeque::new(),
            err: None,
        }))
    }
}

struct MemoryPipeline {
    state: Arc<Mutex<MemoryState>>,
    pending: Vec<Command>,
    replies: VecDeque<Reply>,
    err: Option<StoreError>,
}

#[async_trait]
impl Pipeline for MemoryPipeline {
    fn send(&mut self, cmd: Command) {
        if self.err.is_some() {
            return;
        }
        self.pending.push(cmd);
    }

    async fn flush(&mut self) -> Result<(), StoreError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        let mut state = self.state.lock();
        for cmd in self.pending.drain(..) {
            match state.apply(cmd) {
                Ok(reply) => self.replies.push_back(reply),
                Err(e) => {
                    self.err = Some(e.clone());
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<Reply, StoreError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        match self.replies.pop_front() {
            Some(reply) => Ok(reply),
            None => {
                let err = StoreError::Protocol("receive with no buffered reply".to_string());
                self.err = Some(err.clone());
                Err(err)
            }
        }
    }

    async fn drain(&mut self) -> Result<(), StoreError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        self.flush().await?;
        self.replies.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn getset_returns_previous_value() {
        let store = MemoryStore::new();
        let mut pipe = store.pipeline().await.unwrap();

        let reply = pipe.do_cmd(Command::GetSet("k".into(), 5)).await.unwrap();
        assert_eq!(reply, Reply::Nil);

        let reply = pipe.do_cmd(Command::GetSet("k".into(), 9)).await.unwrap();
        assert_eq!(reply, Reply::Data(b"5".to_vec()));
    }

    #[tokio::test]
    async fn incrby_creates_at_zero() {
        let store = MemoryStore::new();
        let mut pipe = store.pipeline().await.unwrap();
        assert_eq!(
            pipe.do_cmd(Command::IncrBy("k".into(), 7)).await.unwrap(),
            Reply::Int(7)
        );
        assert_eq!(
            pipe.do_cmd(Command::IncrBy("k".into(), -2)).await.unwrap(),
            Reply::Int(5)
        );
    }

    #[tokio::test]
    async fn sets_dedupe_and_count() {
        let store = MemoryStore::new();
        let mut pipe = store.pipeline().await.unwrap();

        pipe.send(Command::SAdd("s".into(), vec!["a".into(), "b".into()]));
        pipe.send(Command::SAdd("s".into(), vec!["b".into()]));
        pipe.send(Command::SCard("s".into()));
        pipe.flush().await.unwrap();

        assert_eq!(pipe.receive().await.unwrap(), Reply::Int(2));
        assert_eq!(pipe.receive().await.unwrap(), Reply::Int(0));
        assert_eq!(pipe.receive().await.unwrap(), Reply::Int(2));
    }

    #[tokio::test]
    async fn expireat_in_past_removes_key() {
        let store = MemoryStore::new();
        let mut pipe = store.pipeline().await.unwrap();

        pipe.do_cmd(Command::Set("k".into(), 1)).await.unwrap();
        pipe.do_cmd(Command::ExpireAt("k".into(), 1)).await.unwrap();
        assert_eq!(pipe.do_cmd(Command::Get("k".into())).await.unwrap(), Reply::Nil);
    }

    #[tokio::test]
    async fn receive_without_reply_poisons_pipeline() {
        let store = MemoryStore::new();
        let mut pipe = store.pipeline().await.unwrap();

        assert!(pipe.receive().await.is_err());
        // Sticky: even a well-formed command now fails
        assert!(pipe.do_cmd(Command::Ping).await.is_err());
    }

    #[tokio::test]
    async fn drain_discards_unread_replies() {
        let store = MemoryStore::new();
        let mut pipe = store.pipeline().await.unwrap();

        pipe.send(Command::Set("a".into(), 1));
        pipe.send(Command::Set("b".into(), 2));
        pipe.flush().await.unwrap();
        pipe.drain().await.unwrap();

        assert!(pipe.receive().await.is_err());
    }
}
