//! The client: one long-lived connection, a pipelined request path, and
//! the failover machinery that keeps both alive.
//!
//! A [`Client`] owns a driver task that cycles through the configured
//! members, opens the byte stream, runs the handshake, and then reads
//! replies until the connection dies — at which point it backs off,
//! reconnects, and (depending on the retry strategy) either resends or
//! fails whatever was still pending. Each live connection also gets a
//! writer task that drains the request stager onto the wire.
//!
//! Requests are pipelined: callers stage encoded commands and receive
//! futures that resolve strictly in staging order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use quartz_protocol::{encode_command, parse_reply, MultiBuilder, Reply};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::{Endpoint, Members, Options, RetryStrategy, TlsConfig};
use crate::error::{ConfigError, ConnectionError, ReplyError};
use crate::handshake::{Handshake, HandshakeStatus};
use crate::hash::HashKey;
use crate::intercepts;
use crate::listener::{ConnectionListener, ListenerSet};
use crate::stager::{Completion, ReplyFuture, RequestStager};
use crate::stream::{self, MaybeTlsStream};
use crate::subscriber::{Message, MessageListener};

/// Reconnection backoff bounds: start at 1 ms, add 1 ms per failed
/// attempt, cap at 2048 ms. Reset as soon as a read delivers bytes.
const BACKOFF_START: Duration = Duration::from_millis(1);
const BACKOFF_CAP: Duration = Duration::from_millis(2048);

/// A handshake that keeps answering "valid but incomplete" past this
/// many rounds is treated as invalid.
const MAX_HANDSHAKE_ROUNDS: usize = 8;

/// State shared between the public handle, the driver task, and
/// components layered on the client.
pub(crate) struct ClientCore {
    pub(crate) stager: RequestStager,
    listeners: ListenerSet,
    epoch: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl ClientCore {
    /// Stages a request from inside a connection callback: synchronous,
    /// bypasses backpressure, resolves a future.
    pub(crate) fn stage_future_bypass(&self, bytes: Bytes, reply_count: usize) -> ReplyFuture {
        let (fut, tx) = ReplyFuture::new();
        self.stager
            .stage_bypass(bytes, Completion::Future(tx), reply_count);
        fut
    }

    /// Stages fire-and-forget control traffic (popped at write time,
    /// no completion). Subscription commands use this.
    pub(crate) fn stage_control(&self, bytes: Bytes) {
        self.stager.stage_bypass(bytes, Completion::Discard, 0);
    }

    /// Stages a request whose replies are consumed but not reported
    /// (best-effort writes). Subject to backpressure like any other
    /// user request.
    pub(crate) async fn stage_discard(&self, bytes: Bytes, reply_count: usize) {
        self.stager
            .stage(bytes, Completion::Discard, reply_count, false)
            .await;
    }

    /// See [`Client::detach_listener`].
    pub(crate) fn detach(&self, listener: &Arc<dyn ConnectionListener>) {
        self.listeners.detach(listener);
    }

    /// A bare core for exercising components without a live connection.
    #[cfg(test)]
    pub(crate) fn test_core() -> Arc<ClientCore> {
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        Arc::new(ClientCore {
            stager: RequestStager::new(crate::config::BackpressureStrategy::none()),
            listeners: ListenerSet::new(),
            epoch: AtomicU64::new(0),
            shutdown_tx,
        })
    }
}

/// A pipelined client for a Redis-compatible replicated backend.
///
/// Dropping the client shuts it down: the driver and writer tasks stop
/// and every pending request resolves with nil.
pub struct Client {
    core: Arc<ClientCore>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Builds a client and starts its driver task.
    ///
    /// Must be called from within a tokio runtime. Fails if the member
    /// list is empty.
    pub fn new(options: Options) -> Result<Self, ConfigError> {
        if options.members.is_empty() {
            return Err(ConfigError::EmptyMembers);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let core = Arc::new(ClientCore {
            stager: RequestStager::new(options.backpressure),
            listeners: ListenerSet::new(),
            epoch: AtomicU64::new(0),
            shutdown_tx,
        });

        let driver = Driver {
            core: core.clone(),
            shutdown: shutdown_rx,
            members: options.members,
            next_member: 0,
            redirected: None,
            redirection_active: false,
            transparent_redirects: options.transparent_redirects,
            retry: options.retry_strategy,
            tls: options.tls,
            handshake: options.handshake,
            message_listener: options.message_listener,
            backoff: BACKOFF_START,
            last_available: Instant::now(),
        };
        tokio::spawn(driver.run());

        Ok(Self { core })
    }

    /// Convenience constructor for a single endpoint with default
    /// options.
    pub fn connect(host: impl Into<String>, port: u16) -> Result<Self, ConfigError> {
        Self::new(Options::new(Members::single(host, port)))
    }

    /// Stages a command and returns the future reply.
    ///
    /// Waits only when the backpressure cap is reached; the returned
    /// future is where the reply itself is awaited.
    pub async fn execute<A: AsRef<[u8]>>(&self, argv: &[A]) -> ReplyFuture {
        self.execute_encoded(encode_command(argv)).await
    }

    /// Stages an already-encoded request buffer.
    pub async fn execute_encoded(&self, bytes: Bytes) -> ReplyFuture {
        let (fut, tx) = ReplyFuture::new();
        self.core
            .stager
            .stage(bytes, Completion::Future(tx), 1, false)
            .await;
        fut
    }

    /// Stages a command with a callback instead of a future. The
    /// callback runs on the connection manager's task and must not
    /// block; it receives `None` when the request is failed with nil.
    pub async fn execute_callback<A, F>(&self, argv: &[A], callback: F)
    where
        A: AsRef<[u8]>,
        F: FnOnce(Option<Reply>) + Send + 'static,
    {
        self.core
            .stager
            .stage(
                encode_command(argv),
                Completion::Callback(Box::new(callback)),
                1,
                false,
            )
            .await;
    }

    /// Stages a MULTI/EXEC bundle as one wire write. The future resolves
    /// with the EXEC reply; the interior `+OK`/`+QUEUED` acknowledgements
    /// are consumed silently.
    pub async fn execute_multi(&self, builder: MultiBuilder) -> ReplyFuture {
        let reply_count = builder.reply_count();
        let (fut, tx) = ReplyFuture::new();
        self.core
            .stager
            .stage(builder.build(), Completion::Future(tx), reply_count, false)
            .await;
        fut
    }

    /// Stages a command and waits for its reply in one call.
    pub async fn exec<A: AsRef<[u8]>>(&self, argv: &[A]) -> Option<Reply> {
        self.execute(argv).await.await
    }

    /// The epoch of the most recently established connection. Zero until
    /// the first connection succeeds.
    pub fn epoch(&self) -> u64 {
        self.core.epoch.load(Ordering::Acquire)
    }

    /// Registers a connection lifecycle listener. Held weakly: dropping
    /// the listener's owner is enough to stop notifications, though
    /// [`detach_listener`](Self::detach_listener) makes the stop a
    /// synchronized barrier.
    pub fn attach_listener(&self, listener: Weak<dyn ConnectionListener>) {
        self.core.listeners.attach(listener);
    }

    /// Removes a listener. When this returns, no further callback to it
    /// can be in flight.
    pub fn detach_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.core.listeners.detach(listener);
    }

    /// Typed wrapper handle for hash commands against `key`.
    pub fn hash(&self, key: impl Into<String>) -> HashKey<'_> {
        HashKey::new(self, key.into())
    }

    /// `EXISTS key` — 1 if the key exists, 0 otherwise.
    pub async fn exists(&self, key: &str) -> Result<i64, ReplyError> {
        match self.exec(&["EXISTS", key]).await {
            Some(Reply::Integer(n)) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    /// `DEL key` — number of keys removed.
    pub async fn del(&self, key: &str) -> Result<i64, ReplyError> {
        match self.exec(&["DEL", key]).await {
            Some(Reply::Integer(n)) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    pub(crate) fn core(&self) -> &Arc<ClientCore> {
        &self.core
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // wake the driver; it joins the writer and exits. The stager is
        // shut here as well so pending futures resolve even if the
        // runtime never polls the driver again.
        let _ = self.core.shutdown_tx.send(true);
        self.core.stager.shutdown();
    }
}

/// Maps a raw reply into the typed-wrapper error space.
pub(crate) fn unexpected(reply: Option<Reply>) -> ReplyError {
    match reply {
        None => ReplyError::NoReply,
        Some(Reply::Error(msg)) => ReplyError::Server(msg),
        Some(other) => ReplyError::Unexpected(other.describe()),
    }
}

/// Why a connection cycle ended.
enum CycleEnd {
    Shutdown,
    Disconnected(ConnectionError),
}

/// The connection manager. Owns all per-connection state; runs as a
/// single task for the lifetime of the client.
struct Driver {
    core: Arc<ClientCore>,
    shutdown: watch::Receiver<bool>,

    members: Members,
    next_member: usize,

    /// Endpoint extracted from the latest MOVED reply, consumed by the
    /// next connection attempt.
    redirected: Option<Endpoint>,

    /// Set while connected to a redirect target rather than a configured
    /// member; cleared on the disconnection after that, resuming the
    /// member rotation.
    redirection_active: bool,

    transparent_redirects: bool,
    retry: RetryStrategy,
    tls: TlsConfig,
    handshake: Option<Box<dyn Handshake + Send>>,
    message_listener: Option<Arc<dyn MessageListener>>,

    backoff: Duration,

    /// Steady-clock instant of the last proof the backend was reachable.
    /// `RetryStrategy::WithTimeout` measures outages from here.
    last_available: Instant,
}

impl Driver {
    async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.connection_cycle().await {
                CycleEnd::Shutdown => break,
                CycleEnd::Disconnected(err) => {
                    let epoch = self.core.epoch.load(Ordering::Acquire);
                    debug!(epoch, error = %err, "connection lost");
                    self.core.listeners.notify_lost(epoch, &err);

                    // a redirect teardown is deliberate; the pending
                    // requests are exactly what must be replayed at the
                    // new endpoint
                    if !matches!(err, ConnectionError::Redirected) && self.should_purge() {
                        warn!(epoch, "retry strategy exhausted, failing pending requests");
                        self.core.stager.clear_pending();
                    }

                    let mut shutdown = self.shutdown.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(self.backoff) => {}
                        _ = shutdown.changed() => break,
                    }
                    if self.backoff < BACKOFF_CAP {
                        self.backoff += Duration::from_millis(1);
                    }
                }
            }
        }

        self.core.stager.shutdown();
    }

    /// Picks the endpoint for the next attempt: member rotation, then
    /// redirect override, then the intercept table.
    fn select_target(&mut self) -> Endpoint {
        let mut target = self.members.endpoints()[self.next_member].clone();
        self.next_member = (self.next_member + 1) % self.members.len();

        if let Some(redirect) = self.redirected.take() {
            info!(target = %redirect, "following redirect");
            target = redirect;
            self.redirection_active = true;
        } else if self.redirection_active {
            info!("redirect lapsed, resuming configured members");
            self.redirection_active = false;
        }

        intercepts::resolve(&target)
    }

    /// One full connection lifetime: connect, handshake, read until the
    /// connection dies or the client shuts down.
    async fn connection_cycle(&mut self) -> CycleEnd {
        let target = self.select_target();
        debug!(%target, "connecting");

        let stream = match stream::connect(&target, &self.tls).await {
            Ok(stream) => stream,
            Err(err) => {
                debug!(%target, error = %err, "connect failed");
                return CycleEnd::Disconnected(err.into());
            }
        };

        let handshake_pending = self.handshake.is_some();
        self.core.stager.activate(handshake_pending);
        if let Some(handshake) = self.handshake.as_mut() {
            handshake.restart();
            let argv = handshake.provide_handshake();
            self.core.stager.stage_handshake(encode_command(&argv));
        }

        let (read_half, write_half) = tokio::io::split(stream);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (dead_tx, mut dead_rx) = oneshot::channel();
        let writer = tokio::spawn(writer_loop(
            self.core.clone(),
            write_half,
            cancel_rx,
            dead_tx,
        ));

        if !handshake_pending {
            self.mark_established();
        }

        let end = self
            .read_loop(read_half, &mut dead_rx, handshake_pending)
            .await;

        let _ = cancel_tx.send(true);
        let _ = writer.await;
        end
    }

    /// A connection is up and through its handshake: bump the epoch,
    /// open the writer gate, tell the listeners. `last_available` is not
    /// advanced here; only delivered bytes count as availability.
    fn mark_established(&mut self) {
        let epoch = self.core.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.backoff = BACKOFF_START;
        info!(epoch, "connection established");

        self.core.stager.handshake_completed();
        self.core.listeners.notify_established(epoch);
    }

    async fn read_loop(
        &mut self,
        mut read_half: ReadHalf<MaybeTlsStream>,
        dead_rx: &mut oneshot::Receiver<std::io::Error>,
        mut handshake_pending: bool,
    ) -> CycleEnd {
        let mut buf = BytesMut::with_capacity(16 * 1024);
        let mut handshake_rounds: usize = 1;
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return CycleEnd::Shutdown;
                    }
                }
                err = &mut *dead_rx => {
                    let err = match err {
                        Ok(io_err) => ConnectionError::Io(io_err),
                        Err(_) => ConnectionError::Eof,
                    };
                    return CycleEnd::Disconnected(err);
                }
                res = read_half.read_buf(&mut buf) => {
                    match res {
                        Ok(0) => return CycleEnd::Disconnected(ConnectionError::Eof),
                        Ok(_) => {
                            self.backoff = BACKOFF_START;
                            self.last_available = Instant::now();
                            if let Err(err) = self.drain_replies(
                                &mut buf,
                                &mut handshake_pending,
                                &mut handshake_rounds,
                            ) {
                                return CycleEnd::Disconnected(err);
                            }
                        }
                        Err(err) => return CycleEnd::Disconnected(err.into()),
                    }
                }
            }
        }
    }

    /// Parses every complete reply buffered so far and routes each one.
    fn drain_replies(
        &mut self,
        buf: &mut BytesMut,
        handshake_pending: &mut bool,
        handshake_rounds: &mut usize,
    ) -> Result<(), ConnectionError> {
        loop {
            match parse_reply(&buf[..]) {
                Ok(Some((reply, consumed))) => {
                    buf.advance(consumed);
                    self.route_reply(reply, handshake_pending, handshake_rounds)?;
                }
                Ok(None) => return Ok(()),
                Err(err) => {
                    error!(error = %err, "protocol violation, dropping connection");
                    return Err(err.into());
                }
            }
        }
    }

    fn route_reply(
        &mut self,
        reply: Reply,
        handshake_pending: &mut bool,
        handshake_rounds: &mut usize,
    ) -> Result<(), ConnectionError> {
        // handshake replies never reach user code
        if *handshake_pending {
            let handshake = self
                .handshake
                .as_mut()
                .expect("handshake pending without a configured handshake");

            return match handshake.validate_response(&reply) {
                HandshakeStatus::Invalid => {
                    warn!(reply = %reply.describe(), "handshake rejected");
                    Err(ConnectionError::HandshakeRejected)
                }
                HandshakeStatus::ValidIncomplete => {
                    *handshake_rounds += 1;
                    if *handshake_rounds > MAX_HANDSHAKE_ROUNDS {
                        warn!(
                            rounds = *handshake_rounds,
                            "handshake did not converge, treating as rejected"
                        );
                        return Err(ConnectionError::HandshakeRejected);
                    }
                    let argv = handshake.provide_handshake();
                    self.core.stager.stage_handshake(encode_command(&argv));
                    Ok(())
                }
                HandshakeStatus::ValidComplete => {
                    *handshake_pending = false;
                    self.mark_established();
                    Ok(())
                }
            };
        }

        // MOVED: remember the target, tear down, never satisfy
        if self.transparent_redirects {
            if let Reply::Error(msg) = &reply {
                if let Some(rest) = msg.strip_prefix("MOVED ") {
                    if let Some(endpoint) = parse_moved_target(rest) {
                        info!(target = %endpoint, "MOVED redirect received");
                        self.redirected = Some(endpoint);
                        return Err(ConnectionError::Redirected);
                    }
                    warn!(reply = %msg, "malformed MOVED reply, delivering as error");
                }
            }
        }

        // subscription mode: the reply stream is pub/sub traffic
        if let Some(listener) = &self.message_listener {
            match Message::from_reply(&reply) {
                Some(message) => listener.on_message(message),
                None => warn!(reply = %reply.describe(), "unrecognized pub/sub frame"),
            }
            return Ok(());
        }

        if !self.core.stager.satisfy(reply) {
            error!("reply arrived with no request in flight");
            return Err(ConnectionError::Desynchronized);
        }
        Ok(())
    }

    /// Whether the retry strategy says to give up on the pending queue.
    fn should_purge(&self) -> bool {
        match self.retry {
            RetryStrategy::NoRetries => true,
            RetryStrategy::WithTimeout(limit) => self.last_available.elapsed() >= limit,
            RetryStrategy::InfiniteRetries => false,
        }
    }
}

/// Parses the tail of a `MOVED <slot> <host>:<port>` error. The slot is
/// ignored; only the endpoint matters.
fn parse_moved_target(rest: &str) -> Option<Endpoint> {
    let mut tokens = rest.split_whitespace();
    let _slot = tokens.next()?;
    let address = tokens.next()?;
    if tokens.next().is_some() {
        return None;
    }
    Endpoint::parse(address).ok()
}

/// Drains the stager onto one connection's write half. Ends on write
/// failure (reported through `dead`) or cancellation.
async fn writer_loop(
    core: Arc<ClientCore>,
    mut write_half: WriteHalf<MaybeTlsStream>,
    mut cancel: watch::Receiver<bool>,
    dead: oneshot::Sender<std::io::Error>,
) {
    loop {
        tokio::select! {
            _ = cancel.changed() => return,
            res = write_next(&core, &mut write_half) => {
                if let Err(err) = res {
                    let _ = dead.send(err);
                    return;
                }
            }
        }
    }
}

/// Writes exactly one staged buffer, parking until one is available.
async fn write_next(
    core: &ClientCore,
    write_half: &mut WriteHalf<MaybeTlsStream>,
) -> std::io::Result<()> {
    let bytes = loop {
        match core.stager.next_writable() {
            Some(bytes) => break bytes,
            None => core.stager.wait_writable().await,
        }
    };
    write_half.write_all(&bytes).await?;
    write_half.flush().await
}
