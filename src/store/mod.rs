//! Pipelined client for the Redis-protocol store
//!
//! The hub's state lives in a remote key-value store; every engine operation
//! is a small, bounded number of pipelined round trips. This module provides:
//!
//! - a typed [`Command`]/[`Reply`] surface over the wire protocol
//! - the [`Pipeline`] borrow with `send`/`flush`/`receive`/`drain` semantics
//!   and first-error-is-sticky decoration
//! - the connection pool ([`RedisStore`]) with fail-fast authentication
//! - an in-memory double ([`MemoryStore`]) for tests

pub mod command;
pub mod connection;
pub mod memory;
pub mod util;

pub use command::{int_reply, strings_reply, Command, Reply};
pub use connection::{Pipeline, RedisStore, Store, StoreConfig};
pub use memory::MemoryStore;
