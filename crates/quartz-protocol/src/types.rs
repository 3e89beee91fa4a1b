//! RESP reply trees.
//!
//! The [`Reply`] enum represents a single parsed RESP value as returned by
//! the backend. Bulk payloads use `Bytes`, so cloning a reply shares the
//! underlying buffer instead of copying it — a reply handed to both a
//! future holder and a callback costs one refcount bump.

use bytes::Bytes;

/// A single parsed RESP reply.
///
/// Covers the five reply types a Redis-compatible backend produces:
/// status strings, errors, integers, bulk strings, and arrays, plus the
/// nil marker used for missing keys (`$-1`) and nil arrays (`*-1`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Status response, e.g. `+OK\r\n`.
    Status(String),

    /// Error response, e.g. `-ERR unknown command\r\n`.
    Error(String),

    /// 64-bit signed integer, e.g. `:42\r\n`.
    Integer(i64),

    /// Bulk (binary-safe) string, e.g. `$5\r\nhello\r\n`.
    Bulk(Bytes),

    /// Nil, e.g. `$-1\r\n` or `*-1\r\n`.
    Nil,

    /// Ordered array of replies, e.g. `*2\r\n:1\r\n:2\r\n`.
    Array(Vec<Reply>),
}

impl Reply {
    /// Returns `true` if this reply is nil.
    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    /// Returns the bulk payload, if this is a bulk string.
    pub fn as_bulk(&self) -> Option<&Bytes> {
        match self {
            Reply::Bulk(data) => Some(data),
            _ => None,
        }
    }

    /// Returns the integer value, if this is an integer reply.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the element slice, if this is an array reply.
    pub fn as_array(&self) -> Option<&[Reply]> {
        match self {
            Reply::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the error text, if this is an error reply.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Reply::Error(msg) => Some(msg),
            _ => None,
        }
    }

    /// Renders the reply in a compact, single-line form for diagnostics,
    /// similar to what redis-cli prints.
    pub fn describe(&self) -> String {
        match self {
            Reply::Status(s) => format!("+{s}"),
            Reply::Error(msg) => format!("-{msg}"),
            Reply::Integer(n) => format!("(integer) {n}"),
            Reply::Bulk(data) => format!("\"{}\"", String::from_utf8_lossy(data)),
            Reply::Nil => "(nil)".to_string(),
            Reply::Array(items) => {
                let inner: Vec<String> = items.iter().map(Reply::describe).collect();
                format!("[{}]", inner.join(", "))
            }
        }
    }
}
