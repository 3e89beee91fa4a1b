//! Client-side replica of a server-side versioned hash.
//!
//! The backend assigns every mutation of a versioned hash a revision
//! number and publishes the change on `__vhash@<key>`. A [`SharedHash`]
//! subscribes to that channel and keeps a local copy of the hash current
//! by applying revisions strictly in sequence. Whenever the sequence
//! breaks — missed revisions, a fresh connection, first construction —
//! it pulls a full snapshot with `VHGETALL` and replaces its contents
//! wholesale ("resilvering").
//!
//! Reads are eventually consistent: another client may have mutated the
//! hash and received an acknowledgement while our copy is still catching
//! up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use quartz_protocol::{encode_command, MultiBuilder, Reply};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::client::{Client, ClientCore};
use crate::error::ConnectionError;
use crate::listener::ConnectionListener;
use crate::stager::ReplyFuture;
use crate::subscriber::{Message, Subscriber};
use crate::sync;

/// Channel prefix for versioned-hash update feeds.
const UPDATE_CHANNEL_PREFIX: &str = "__vhash@";

struct HashState {
    version: u64,
    contents: HashMap<String, String>,
}

struct HashInner {
    key: String,
    core: Arc<ClientCore>,
    state: RwLock<HashState>,

    /// The in-flight resilver request, if any. At most one exists at a
    /// time; readers and the update feed poll it without blocking and
    /// apply the snapshot once it resolves.
    resilver: Mutex<Option<ReplyFuture>>,
}

/// A replicated map bound to one versioned hash key.
///
/// Constructed from a command client (for writes and snapshots) and a
/// subscriber (for the update feed). Dropping the hash detaches it from
/// both.
pub struct SharedHash {
    inner: Arc<HashInner>,
    listener_handle: Arc<dyn ConnectionListener>,
    client_core: Arc<ClientCore>,
    feed_task: JoinHandle<()>,
}

impl SharedHash {
    /// Attaches to `key`: subscribes to its update channel, registers
    /// for reconnect notifications, and requests the initial snapshot.
    pub fn new(client: &Client, subscriber: &Subscriber, key: impl Into<String>) -> Self {
        let key = key.into();
        let inner = Arc::new(HashInner {
            key: key.clone(),
            core: client.core().clone(),
            state: RwLock::new(HashState {
                version: 0,
                contents: HashMap::new(),
            }),
            resilver: Mutex::new(None),
        });

        let listener_handle: Arc<dyn ConnectionListener> = inner.clone();
        client.attach_listener(Arc::downgrade(&listener_handle));

        let mut subscription = subscriber.subscribe(&format!("{UPDATE_CHANNEL_PREFIX}{key}"));
        let feed_inner = inner.clone();
        let feed_task = tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                feed_inner.process_incoming(message);
            }
        });

        inner.trigger_resilver();

        Self {
            inner,
            listener_handle,
            client_core: client.core().clone(),
            feed_task,
        }
    }

    /// Reads one field of the local copy.
    pub fn get(&self, field: &str) -> Option<String> {
        self.inner.check_resilver();
        sync::read(&self.inner.state).contents.get(field).cloned()
    }

    /// The revision the local copy is at.
    pub fn get_current_version(&self) -> u64 {
        self.inner.check_resilver();
        sync::read(&self.inner.state).version
    }

    /// Number of fields in the local copy.
    pub fn len(&self) -> usize {
        self.inner.check_resilver();
        sync::read(&self.inner.state).contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sets one field on the backend. Best-effort: the write is a
    /// MULTI-bundled `VHSET` with no acknowledgement; the local copy
    /// changes only when the resulting revision arrives on the update
    /// feed. An empty value deletes the field.
    pub async fn set(&self, field: impl Into<String>, value: impl Into<String>) {
        self.set_batch([(field.into(), value.into())]).await;
    }

    /// Sets a batch of fields in one MULTI bundle. Empty values delete.
    pub async fn set_batch(&self, batch: impl IntoIterator<Item = (String, String)>) {
        let mut multi = MultiBuilder::new();
        for (field, value) in batch {
            if value.is_empty() {
                multi.add(&["VHDEL", &field]);
            } else {
                multi.add(&["VHSET", &field, &value]);
            }
        }
        if multi.is_empty() {
            return;
        }

        let reply_count = multi.reply_count();
        self.client_core
            .stage_discard(multi.build(), reply_count)
            .await;
    }

    /// Deletes one field on the backend (best-effort, like
    /// [`set`](Self::set)).
    pub async fn del(&self, field: impl Into<String>) {
        self.set(field, "").await;
    }

    /// Offers one revision from the update feed.
    ///
    /// Applies it only when it is exactly the next revision; the return
    /// value is `false` when the local copy cannot be brought up to date
    /// incrementally and a resilver is needed. Normally driven by the
    /// subscription; public so feeds can be injected directly.
    pub fn feed_revision(&self, revision: u64, updates: &[(String, String)]) -> bool {
        self.inner.feed_revision(revision, updates)
    }

    /// Requests a fresh snapshot unless one is already on the wire.
    pub fn trigger_resilver(&self) {
        self.inner.trigger_resilver();
    }
}

impl Drop for SharedHash {
    fn drop(&mut self) {
        self.client_core.detach(&self.listener_handle);
        self.feed_task.abort();
    }
}

impl HashInner {
    /// Applies one incremental revision if it continues the sequence.
    fn feed_revision(&self, revision: u64, updates: &[(String, String)]) -> bool {
        let mut state = sync::write(&self.state);

        if revision <= state.version {
            // our copy claims to be newer than the server's feed; that
            // should not happen, resync to whatever the server has
            error!(
                key = %self.key,
                revision,
                version = state.version,
                "local copy ahead of update feed, requesting resync"
            );
            return false;
        }

        if revision >= state.version + 2 {
            warn!(
                key = %self.key,
                revision,
                version = state.version,
                "missed revisions, requesting resync"
            );
            return false;
        }

        for (field, value) in updates {
            if value.is_empty() {
                state.contents.remove(field);
            } else {
                state.contents.insert(field.clone(), value.clone());
            }
        }
        state.version = revision;
        true
    }

    /// Replaces the local copy with a snapshot.
    fn resilver(&self, revision: u64, contents: HashMap<String, String>) {
        let mut state = sync::write(&self.state);

        if revision < state.version {
            warn!(
                key = %self.key,
                revision,
                version = state.version,
                "snapshot older than local copy, discarding"
            );
            return;
        }

        warn!(
            key = %self.key,
            from = state.version,
            to = revision,
            "resilvering"
        );
        state.version = revision;
        state.contents = contents;
    }

    /// Issues `VHGETALL` unless a snapshot request is already in flight;
    /// an in-flight one will bridge whatever gap prompted this call.
    fn trigger_resilver(&self) {
        let mut slot = sync::lock(&self.resilver);
        if slot.is_some() {
            return;
        }
        debug!(key = %self.key, "requesting snapshot");
        *slot = Some(
            self.core
                .stage_future_bypass(encode_command(&["VHGETALL", &self.key]), 1),
        );
    }

    /// Non-blocking poll of the pending snapshot request.
    fn check_resilver(&self) {
        let resolved = {
            let mut slot = sync::lock(&self.resilver);
            match slot.as_mut().and_then(ReplyFuture::try_resolve) {
                Some(reply) => {
                    *slot = None;
                    Some(reply)
                }
                None => None,
            }
        };

        if let Some(reply) = resolved {
            self.handle_snapshot_reply(reply);
        }
    }

    /// Parses a `VHGETALL` reply: `[revision, [field1, value1, …]]`.
    fn handle_snapshot_reply(&self, reply: Option<Reply>) {
        let Some(reply) = reply else {
            // the request died with the connection; reconnecting
            // schedules a fresh one
            debug!(key = %self.key, "snapshot request resolved empty");
            return;
        };

        let Some((revision, contents)) = parse_snapshot(&reply) else {
            warn!(
                key = %self.key,
                reply = %reply.describe(),
                "could not parse snapshot reply"
            );
            return;
        };

        self.resilver(revision, contents);
    }

    /// Handles one frame from the update channel. Payloads are RESP
    /// arrays `[revision, field1, value1, …]`.
    fn process_incoming(&self, message: Message) {
        self.check_resilver();

        let Some(payload) = message.payload else {
            return;
        };

        let Some((revision, updates)) = parse_update(&payload) else {
            warn!(key = %self.key, "could not parse update payload, ignoring");
            return;
        };

        if !self.feed_revision(revision, &updates) {
            self.trigger_resilver();
        }
    }
}

impl ConnectionListener for HashInner {
    fn notify_connection_lost(&self, _epoch: u64, _err: &ConnectionError) {}

    fn notify_connection_established(&self, epoch: u64) {
        debug!(key = %self.key, epoch, "connection re-established, scheduling resync");
        // collect a previously resolved snapshot first so the slot is
        // free for a fresh request against the new connection
        self.check_resilver();
        self.trigger_resilver();
    }
}

/// Decodes `[revision, [f1, v1, f2, v2, …]]`.
fn parse_snapshot(reply: &Reply) -> Option<(u64, HashMap<String, String>)> {
    let items = reply.as_array()?;
    if items.len() != 2 {
        return None;
    }
    let revision = u64::try_from(items[0].as_integer()?).ok()?;
    let pairs = items[1].as_array()?;
    if pairs.len() % 2 != 0 {
        return None;
    }

    let mut contents = HashMap::with_capacity(pairs.len() / 2);
    for chunk in pairs.chunks_exact(2) {
        let field = utf8(chunk[0].as_bulk()?)?;
        let value = utf8(chunk[1].as_bulk()?)?;
        contents.insert(field, value);
    }
    Some((revision, contents))
}

/// Decodes an update payload: a RESP array `[revision, f1, v1, …]`.
fn parse_update(payload: &[u8]) -> Option<(u64, Vec<(String, String)>)> {
    let (reply, consumed) = quartz_protocol::parse_reply(payload).ok()??;
    if consumed != payload.len() {
        return None;
    }

    let items = reply.as_array()?;
    let (revision_item, rest) = items.split_first()?;
    let revision = u64::try_from(revision_item.as_integer()?).ok()?;
    if rest.len() % 2 != 0 {
        return None;
    }

    let mut updates = Vec::with_capacity(rest.len() / 2);
    for chunk in rest.chunks_exact(2) {
        let field = utf8(chunk[0].as_bulk()?)?;
        let value = utf8(chunk[1].as_bulk()?)?;
        updates.push((field, value));
    }
    Some((revision, updates))
}

fn utf8(data: &bytes::Bytes) -> Option<String> {
    String::from_utf8(data.to_vec()).ok()
}
