//! Direct-to-buffer RESP serialization of reply trees.
//!
//! Writes replies directly into a `BytesMut` buffer with no intermediate
//! allocations. Integer-to-string conversion uses `itoa` for fast
//! stack-based formatting.
//!
//! A client has no business sending replies; this exists for the other
//! direction — test harnesses scripting a backend, and tools that echo
//! replies back onto a wire.

use bytes::{BufMut, BytesMut};

use crate::types::Reply;

impl Reply {
    /// Serializes this reply into the provided buffer.
    ///
    /// Writes the full RESP wire representation, including type prefix
    /// and trailing `\r\n` delimiters. Nil encodes as `$-1\r\n`.
    pub fn serialize(&self, dst: &mut BytesMut) {
        match self {
            Reply::Status(s) => {
                dst.put_u8(b'+');
                dst.put_slice(s.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Reply::Error(msg) => {
                dst.put_u8(b'-');
                dst.put_slice(msg.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Reply::Integer(n) => {
                dst.put_u8(b':');
                write_i64(*n, dst);
                dst.put_slice(b"\r\n");
            }
            Reply::Bulk(data) => {
                dst.put_u8(b'$');
                write_i64(data.len() as i64, dst);
                dst.put_slice(b"\r\n");
                dst.put_slice(data);
                dst.put_slice(b"\r\n");
            }
            Reply::Nil => {
                dst.put_slice(b"$-1\r\n");
            }
            Reply::Array(items) => {
                dst.put_u8(b'*');
                write_i64(items.len() as i64, dst);
                dst.put_slice(b"\r\n");
                for item in items {
                    item.serialize(dst);
                }
            }
        }
    }
}

/// Writes an i64 as its decimal ASCII representation directly into the buffer.
pub(crate) fn write_i64(val: i64, dst: &mut BytesMut) {
    let mut buf = itoa::Buffer::new();
    dst.put_slice(buf.format(val).as_bytes());
}
