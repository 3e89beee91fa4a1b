//! Command encoding.
//!
//! Clients send every command as a RESP multi-bulk array of bulk strings:
//! `*<argc>\r\n` followed by `$<len>\r\n<arg>\r\n` per argument. This is
//! the one encoding the backend accepts regardless of command, so the
//! encoder is a single pure function over an argv slice.

use bytes::{BufMut, Bytes, BytesMut};

use crate::serialize::write_i64;

/// Encodes an argv slice into a ready-to-send command buffer.
///
/// Arguments are binary-safe; each is written as a bulk string. An empty
/// argv produces an empty buffer (staging it is a caller bug — no
/// backend accepts a zero-argument command).
pub fn encode_command<A: AsRef<[u8]>>(argv: &[A]) -> Bytes {
    debug_assert!(!argv.is_empty(), "commands need at least one argument");

    let mut size = 16;
    for arg in argv {
        size += arg.as_ref().len() + 16;
    }
    let mut buf = BytesMut::with_capacity(size);

    encode_command_into(argv, &mut buf);
    buf.freeze()
}

/// Encodes an argv slice into an existing buffer.
///
/// Used when several commands are concatenated into one write, e.g. by
/// the MULTI builder.
pub fn encode_command_into<A: AsRef<[u8]>>(argv: &[A], dst: &mut BytesMut) {
    if argv.is_empty() {
        return;
    }

    dst.put_u8(b'*');
    write_i64(argv.len() as i64, dst);
    dst.put_slice(b"\r\n");

    for arg in argv {
        let arg = arg.as_ref();
        dst.put_u8(b'$');
        write_i64(arg.len() as i64, dst);
        dst.put_slice(b"\r\n");
        dst.put_slice(arg);
        dst.put_slice(b"\r\n");
    }
}
