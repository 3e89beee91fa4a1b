//! The request stager: an ordered queue of in-flight requests.
//!
//! Callers append encoded requests at the tail; the writer drains them to
//! the wire in order; replies satisfy them from the head, strictly FIFO.
//! The stager owns each request from stage until it is satisfied or
//! cleared, which is what makes resending after a reconnect possible: a
//! request stays queued until its reply actually arrives, and the write
//! cursor rewinds to the head when a fresh connection is activated.
//!
//! # Handshake gate
//!
//! Handshake rounds are staged separately and always drain first. While
//! the gate is closed no user payload is handed to the writer; the
//! connection manager opens the gate once the handshake validates.
//!
//! # Backpressure
//!
//! The blocking strategy is a semaphore sized to the in-flight cap. Each
//! non-bypass stage holds one permit until the request leaves the queue.
//! Bypass exists for traffic originating inside connection callbacks
//! (re-subscriptions, resilver requests): those run on the reader task,
//! and parking them on a full queue would deadlock the very loop that
//! drains it.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use quartz_protocol::Reply;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};

use crate::config::BackpressureStrategy;
use crate::sync;

/// How a staged request reports its outcome.
pub(crate) enum Completion {
    /// Resolve a [`ReplyFuture`].
    Future(oneshot::Sender<Option<Reply>>),

    /// Invoke a callback on the reader task. Must not block.
    Callback(Box<dyn FnOnce(Option<Reply>) + Send>),

    /// Nobody is listening (fire-and-forget control traffic).
    Discard,
}

impl Completion {
    fn complete(self, reply: Option<Reply>) {
        match self {
            Completion::Future(tx) => {
                let _ = tx.send(reply);
            }
            Completion::Callback(cb) => cb(reply),
            Completion::Discard => {}
        }
    }
}

struct StagedRequest {
    bytes: Bytes,
    completion: Completion,

    /// How many backend replies this request consumes. One for ordinary
    /// commands; a MULTI bundle consumes one per bracketed line and the
    /// completion receives the last (the EXEC result). Zero marks
    /// fire-and-forget requests that are popped as soon as they are
    /// written (subscription control traffic — in subscription mode the
    /// reply stream doesn't flow through the stager at all).
    reply_count: usize,

    _permit: Option<OwnedSemaphorePermit>,
}

struct Inner {
    queue: VecDeque<StagedRequest>,

    /// Index into `queue` of the next request the writer should send.
    /// Everything before it has been written on the current connection
    /// and awaits a reply; activation rewinds it to zero so pending
    /// requests are resent.
    next_to_write: usize,

    /// Staged handshake rounds, drained before anything else.
    handshake: VecDeque<Bytes>,

    /// Closed from activation until the handshake validates. While
    /// closed, user payloads stay queued.
    gate_closed: bool,

    /// Set once at shutdown; stages after this resolve immediately
    /// with nil.
    shut: bool,
}

/// Single-consumer staging queue shared by callers, the writer task, and
/// the connection manager.
pub(crate) struct RequestStager {
    inner: Mutex<Inner>,
    writable: Notify,
    limiter: Option<Arc<Semaphore>>,
}

impl RequestStager {
    pub(crate) fn new(backpressure: BackpressureStrategy) -> Self {
        let limiter = match backpressure {
            BackpressureStrategy::None => None,
            BackpressureStrategy::Blocking { max_in_flight } => {
                Some(Arc::new(Semaphore::new(max_in_flight)))
            }
        };

        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                next_to_write: 0,
                handshake: VecDeque::new(),
                gate_closed: false,
                shut: false,
            }),
            writable: Notify::new(),
            limiter,
        }
    }

    /// Appends a request at the tail, waiting on backpressure unless
    /// bypassed.
    pub(crate) async fn stage(
        &self,
        bytes: Bytes,
        completion: Completion,
        reply_count: usize,
        bypass_backpressure: bool,
    ) {
        let permit = match (&self.limiter, bypass_backpressure) {
            (Some(limiter), false) => {
                // acquire before touching the queue; the semaphore is
                // never closed, so the only exit is a permit
                match limiter.clone().acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => None,
                }
            }
            _ => None,
        };

        self.push(bytes, completion, reply_count, permit);
    }

    /// Appends a request without waiting. Used by code running on the
    /// reader task (connection callbacks), which must never park.
    pub(crate) fn stage_bypass(&self, bytes: Bytes, completion: Completion, reply_count: usize) {
        self.push(bytes, completion, reply_count, None);
    }

    fn push(
        &self,
        bytes: Bytes,
        completion: Completion,
        reply_count: usize,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        {
            let mut inner = sync::lock(&self.inner);
            if inner.shut {
                drop(inner);
                completion.complete(None);
                return;
            }
            inner.queue.push_back(StagedRequest {
                bytes,
                completion,
                reply_count,
                _permit: permit,
            });
        }
        self.writable.notify_one();
    }

    /// Stages one handshake round. Handshake bytes jump the queue and
    /// ignore the gate; they are what the gate is waiting for.
    pub(crate) fn stage_handshake(&self, bytes: Bytes) {
        sync::lock(&self.inner).handshake.push_back(bytes);
        self.writable.notify_one();
    }

    /// Opens the gate: the handshake validated and user payloads may be
    /// written.
    pub(crate) fn handshake_completed(&self) {
        sync::lock(&self.inner).gate_closed = false;
        self.writable.notify_one();
    }

    /// Prepares the queue for a freshly established connection: discards
    /// stale handshake rounds, closes the gate if a handshake is
    /// configured, and rewinds the write cursor so every still-pending
    /// request is resent.
    pub(crate) fn activate(&self, gate_closed: bool) {
        let mut inner = sync::lock(&self.inner);
        inner.handshake.clear();
        inner.gate_closed = gate_closed;
        inner.next_to_write = 0;
        drop(inner);
        self.writable.notify_one();
    }

    /// Hands the writer the next buffer to put on the wire, or `None` if
    /// there is nothing writable right now.
    pub(crate) fn next_writable(&self) -> Option<Bytes> {
        let mut inner = sync::lock(&self.inner);

        if let Some(bytes) = inner.handshake.pop_front() {
            return Some(bytes);
        }
        if inner.gate_closed {
            return None;
        }

        if inner.next_to_write < inner.queue.len() {
            let idx = inner.next_to_write;
            if inner.queue[idx].reply_count == 0 {
                // fire-and-forget: leaves the queue at write time
                let req = inner.queue.remove(idx).expect("index checked above");
                return Some(req.bytes);
            }
            let bytes = inner.queue[idx].bytes.clone();
            inner.next_to_write += 1;
            return Some(bytes);
        }

        None
    }

    /// Parks until [`next_writable`](Self::next_writable) may have
    /// something new.
    pub(crate) async fn wait_writable(&self) {
        self.writable.notified().await;
    }

    /// Feeds one reply to the head of the queue. Returns `false` if no
    /// request was in flight — the reply stream is desynchronized and the
    /// caller should drop the connection.
    pub(crate) fn satisfy(&self, reply: Reply) -> bool {
        let completed = {
            let mut inner = sync::lock(&self.inner);
            let Some(head) = inner.queue.front_mut() else {
                return false;
            };

            head.reply_count -= 1;
            if head.reply_count > 0 {
                // interior reply of a MULTI bundle (+OK / +QUEUED);
                // only the final one resolves the completion
                return true;
            }

            let req = inner.queue.pop_front().expect("front checked above");
            if inner.next_to_write > 0 {
                inner.next_to_write -= 1;
            }
            req
        };

        completed.completion.complete(Some(reply));
        true
    }

    /// Fails every pending request with nil. Invoked at shutdown, and by
    /// the connection manager when the retry strategy gives up on an
    /// outage.
    pub(crate) fn clear_pending(&self) {
        let drained: Vec<StagedRequest> = {
            let mut inner = sync::lock(&self.inner);
            inner.next_to_write = 0;
            inner.queue.drain(..).collect()
        };

        for req in drained {
            req.completion.complete(None);
        }
    }

    /// Marks the stager shut (future stages resolve nil immediately) and
    /// fails everything pending.
    pub(crate) fn shutdown(&self) {
        sync::lock(&self.inner).shut = true;
        self.clear_pending();
        self.writable.notify_one();
    }

    /// Number of staged-but-unanswered requests.
    #[allow(dead_code)] // used in tests
    pub(crate) fn pending(&self) -> usize {
        sync::lock(&self.inner).queue.len()
    }
}

/// A future reply. Resolves to `None` when the request was failed with
/// nil: client shutdown, retry strategy exhaustion, or a dropped client.
pub struct ReplyFuture {
    rx: oneshot::Receiver<Option<Reply>>,
}

impl ReplyFuture {
    pub(crate) fn new() -> (Self, oneshot::Sender<Option<Reply>>) {
        let (tx, rx) = oneshot::channel();
        (Self { rx }, tx)
    }

    /// Non-blocking poll: `Some(reply)` once resolved, `None` while the
    /// request is still in flight.
    pub fn try_resolve(&mut self) -> Option<Option<Reply>> {
        match self.rx.try_recv() {
            Ok(reply) => Some(reply),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(None),
        }
    }
}

impl Future for ReplyFuture {
    type Output = Option<Reply>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(reply)) => Poll::Ready(reply),
            Poll::Ready(Err(_)) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
