//! quartz-protocol: RESP wire protocol implementation.
//!
//! Provides incremental parsing of backend replies, direct-to-buffer
//! serialization, and command encoding for client-to-backend traffic.
//!
//! # quick start
//!
//! ```
//! use quartz_protocol::{encode_command, parse_reply, Reply};
//!
//! // encode a command the way a client sends it
//! let cmd = encode_command(&["GET", "foo"]);
//! assert_eq!(&cmd[..], b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");
//!
//! // parse a reply as it comes off the wire
//! let (reply, consumed) = parse_reply(b"$5\r\nhello\r\n").unwrap().unwrap();
//! assert_eq!(reply.as_bulk().map(|b| &b[..]), Some(&b"hello"[..]));
//! assert_eq!(consumed, 11);
//! ```

pub mod encode;
pub mod error;
pub mod multi;
pub mod parse;
mod serialize;
pub mod types;

pub use encode::{encode_command, encode_command_into};
pub use error::ProtocolError;
pub use multi::MultiBuilder;
pub use parse::parse_reply;
pub use types::Reply;
