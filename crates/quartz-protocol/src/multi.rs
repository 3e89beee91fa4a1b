//! Builder for MULTI/EXEC command bundles.
//!
//! Accumulates argv vectors and emits them as one contiguous buffer
//! bracketed by `MULTI` and `EXEC`, so the whole transaction travels in a
//! single write. The backend answers with one reply per bracketed line
//! (`+OK`, then `+QUEUED` per command, then the EXEC result array).

use bytes::{Bytes, BytesMut};

use crate::encode::encode_command_into;

/// Accumulates commands for a single MULTI/EXEC bundle.
#[derive(Default)]
pub struct MultiBuilder {
    commands: BytesMut,
    len: usize,
}

impl MultiBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one command to the bundle.
    pub fn add<A: AsRef<[u8]>>(&mut self, argv: &[A]) -> &mut Self {
        encode_command_into(argv, &mut self.commands);
        self.len += 1;
        self
    }

    /// Number of commands added so far (excluding the MULTI/EXEC brackets).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of replies the backend will send for the built buffer:
    /// one for MULTI, one per queued command, one for EXEC.
    pub fn reply_count(&self) -> usize {
        self.len + 2
    }

    /// Emits the bracketed buffer: `MULTI`, every added command in order,
    /// `EXEC`.
    pub fn build(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.commands.len() + 32);
        encode_command_into(&["MULTI"], &mut buf);
        buf.extend_from_slice(&self.commands);
        encode_command_into(&["EXEC"], &mut buf);
        buf.freeze()
    }
}
