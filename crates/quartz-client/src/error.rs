//! Error types for client construction and typed command wrappers.

use quartz_protocol::ProtocolError;
use thiserror::Error;

/// Errors detected when constructing a client from its options.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The member list was empty. A client needs at least one endpoint
    /// to cycle through.
    #[error("member list cannot be empty")]
    EmptyMembers,

    /// An endpoint string didn't parse as `host:port`.
    #[error("invalid endpoint '{0}': expected host:port")]
    InvalidEndpoint(String),
}

/// Why a live connection was torn down.
///
/// Handed to connection listeners alongside the epoch of the connection
/// that died; also logged by the connection manager.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    /// The byte stream stopped being parseable RESP. Unrecoverable for
    /// this connection; replies already consumed stay delivered.
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    /// The handshake plugin rejected a reply, or ran out of rounds.
    #[error("handshake rejected")]
    HandshakeRejected,

    /// The backend closed the connection.
    #[error("connection closed by backend")]
    Eof,

    /// The backend answered with a MOVED redirect; the connection is
    /// being re-pointed at the new owner. Never surfaced to request
    /// futures.
    #[error("redirected to a different endpoint")]
    Redirected,

    /// A reply arrived with no request in flight. The pipeline is
    /// desynchronized and cannot be trusted.
    #[error("unsolicited reply with no request in flight")]
    Desynchronized,
}

/// Errors surfaced by the typed command wrappers.
///
/// The raw `execute` path never produces these: it hands back whatever
/// reply tree the backend sent, nil included. The wrappers add the
/// interpretation step, and this is what interpretation can fail with.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplyError {
    /// The request resolved with no reply: the client shut down, or the
    /// retry strategy gave up on the connection.
    #[error("no reply: connection unavailable or client shut down")]
    NoReply,

    /// The backend answered with an error reply.
    #[error("server error: {0}")]
    Server(String),

    /// The reply type didn't match what the command contract promises.
    #[error("unexpected reply: {0}")]
    Unexpected(String),
}
