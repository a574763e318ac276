//! Typed command and reply surface of the store protocol
//!
//! The engine speaks in these variants instead of raw command strings so the
//! pipelined batches stay auditable in logs and replayable against the
//! in-memory store double.

use crate::error::StoreError;

/// A single store command the engine can queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Read a string value
    Get(String),
    /// Replace a value, returning the previous one
    GetSet(String, i64),
    /// Replace a value
    Set(String, i64),
    /// Add a signed delta, creating the key at zero
    IncrBy(String, i64),
    /// Expire a key at the given unix-seconds instant
    ExpireAt(String, i64),
    /// Add members to a set
    SAdd(String, Vec<String>),
    /// Remove members from a set
    SRem(String, Vec<String>),
    /// List all members of a set
    SMembers(String),
    /// Cardinality of a set
    SCard(String),
    /// Liveness probe
    Ping,
}

impl Command {
    /// The wire-level command name
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get(_) => "GET",
            Command::GetSet(..) => "GETSET",
            Command::Set(..) => "SET",
            Command::IncrBy(..) => "INCRBY",
            Command::ExpireAt(..) => "EXPIREAT",
            Command::SAdd(..) => "SADD",
            Command::SRem(..) => "SREM",
            Command::SMembers(_) => "SMEMBERS",
            Command::SCard(_) => "SCARD",
            Command::Ping => "PING",
        }
    }
}

/// A single reply from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Key missing or set empty
    Nil,
    /// Native integer reply
    Int(i64),
    /// Bulk bytes reply
    Data(Vec<u8>),
    /// Array reply (e.g. `SMEMBERS`)
    Array(Vec<Reply>),
    /// Status line reply (e.g. `OK`, `PONG`)
    Status(String),
}

/// Decode a reply into `(value, found)`.
///
/// A `Nil` reply is not an error; it yields `(0, false)` and the caller skips
/// the entry. Raw bytes are parsed as base-10. Any other shape is a decoding
/// failure, surfaced as a store error.
pub fn int_reply(reply: Reply) -> Result<(i64, bool), StoreError> {
    match reply {
        Reply::Nil => Ok((0, false)),
        Reply::Int(v) => Ok((v, true)),
        Reply::Data(bytes) => {
            let text = std::str::from_utf8(&bytes)
                .map_err(|e| StoreError::Decode(format!("non-utf8 integer reply: {e}")))?;
            let v = text
                .parse::<i64>()
                .map_err(|e| StoreError::Decode(format!("unparseable integer reply: {e}")))?;
            Ok((v, true))
        }
        other => Err(StoreError::Decode(format!(
            "value of unknown type returned from store: {other:?}"
        ))),
    }
}

/// Decode an array reply into strings, e.g. a `SMEMBERS` result
pub fn strings_reply(reply: Reply) -> Result<Vec<String>, StoreError> {
    let items = match reply {
        Reply::Nil => return Ok(Vec::new()),
        Reply::Array(items) => items,
        other => {
            return Err(StoreError::Decode(format!(
                "expected array reply, got {other:?}"
            )))
        }
    };
    items
        .into_iter()
        .map(|item| match item {
            Reply::Data(bytes) => String::from_utf8(bytes)
                .map_err(|e| StoreError::Decode(format!("non-utf8 set member: {e}"))),
            Reply::Status(s) => Ok(s),
            other => Err(StoreError::Decode(format!(
                "expected bulk set member, got {other:?}"
            ))),
        })
        .collect()
}
