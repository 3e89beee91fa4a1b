//! Protocol error types for RESP parsing.

use thiserror::Error;

/// Errors that can occur when parsing the RESP wire format.
///
/// Every variant except [`ProtocolError::Incomplete`] means the byte
/// stream is corrupt: the connection it came from cannot be recovered
/// and must be torn down.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The input buffer doesn't contain a complete reply yet.
    /// The caller should read more data and try again.
    #[error("incomplete reply: need more data")]
    Incomplete,

    /// The first byte of a reply didn't match any known RESP type prefix.
    #[error("invalid type prefix: {0:#04x}")]
    InvalidPrefix(u8),

    /// Failed to parse an integer value from the reply content.
    #[error("invalid integer encoding")]
    InvalidInteger,

    /// A bulk string or array declared an invalid length.
    #[error("invalid declared length: {0}")]
    InvalidLength(i64),

    /// A bulk string declared a length above the protocol maximum.
    #[error("bulk string too large: {0} bytes")]
    BulkTooLarge(usize),

    /// An array declared more elements than the protocol maximum.
    #[error("too many array elements: {0}")]
    TooManyElements(usize),

    /// Arrays nested deeper than the protocol maximum.
    #[error("nesting exceeds maximum depth of {0}")]
    NestingTooDeep(usize),

    /// A status or error line contained invalid UTF-8.
    #[error("invalid utf-8 in {0} line")]
    InvalidUtf8(&'static str),
}
