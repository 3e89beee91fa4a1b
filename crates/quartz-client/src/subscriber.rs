//! Publish/subscribe support.
//!
//! A client in subscription mode routes every incoming reply to a single
//! [`MessageListener`] — that is the [`BaseSubscriber`], a thin model of
//! a connection in subscription mode. [`Subscriber`] layers per-channel
//! inboxes on top: callers get a [`Subscription`] handle per channel and
//! read messages at their own pace.
//!
//! Both flavors re-issue every live subscription when the connection is
//! re-established, before any other traffic is written, so a reconnect
//! is invisible apart from the gap in message flow.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use quartz_protocol::{encode_command, Reply};
use tokio::sync::mpsc;
use tracing::debug;

use crate::client::{Client, ClientCore};
use crate::config::Options;
use crate::error::ConfigError;
use crate::listener::ConnectionListener;
use crate::sync;

/// What kind of pub/sub frame arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Confirmation of a `SUBSCRIBE`.
    Subscribe,
    /// Confirmation of an `UNSUBSCRIBE`.
    Unsubscribe,
    /// Confirmation of a `PSUBSCRIBE`.
    PatternSubscribe,
    /// Confirmation of a `PUNSUBSCRIBE`.
    PatternUnsubscribe,
    /// A message published to a channel this connection subscribes to.
    Message,
    /// A message delivered through a pattern subscription.
    PatternMessage,
}

/// One decoded pub/sub frame.
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageKind,
    /// The channel the message was published to. `None` on pattern
    /// (un)subscription confirmations.
    pub channel: Option<String>,
    /// The matching pattern, for pattern subscriptions.
    pub pattern: Option<String>,
    /// The published payload. `None` on confirmations.
    pub payload: Option<Bytes>,
}

impl Message {
    /// Decodes a reply tree as a pub/sub frame. Returns `None` when the
    /// shape doesn't match any frame the backend sends in subscription
    /// mode.
    pub fn from_reply(reply: &Reply) -> Option<Message> {
        let items = reply.as_array()?;
        let kind = text(items.first()?)?;

        match (kind.as_str(), items.len()) {
            ("message", 3) => Some(Message {
                kind: MessageKind::Message,
                channel: Some(text(&items[1])?),
                pattern: None,
                payload: Some(payload_bytes(&items[2])),
            }),
            ("pmessage", 4) => Some(Message {
                kind: MessageKind::PatternMessage,
                pattern: Some(text(&items[1])?),
                channel: Some(text(&items[2])?),
                payload: Some(payload_bytes(&items[3])),
            }),
            ("subscribe", 3) => Some(Message {
                kind: MessageKind::Subscribe,
                channel: Some(text(&items[1])?),
                pattern: None,
                payload: None,
            }),
            ("unsubscribe", 3) => Some(Message {
                kind: MessageKind::Unsubscribe,
                channel: Some(text(&items[1])?),
                pattern: None,
                payload: None,
            }),
            ("psubscribe", 3) => Some(Message {
                kind: MessageKind::PatternSubscribe,
                channel: None,
                pattern: Some(text(&items[1])?),
                payload: None,
            }),
            ("punsubscribe", 3) => Some(Message {
                kind: MessageKind::PatternUnsubscribe,
                channel: None,
                pattern: Some(text(&items[1])?),
                payload: None,
            }),
            _ => None,
        }
    }
}

fn text(reply: &Reply) -> Option<String> {
    match reply {
        Reply::Bulk(data) => String::from_utf8(data.to_vec()).ok(),
        Reply::Status(s) => Some(s.clone()),
        _ => None,
    }
}

fn payload_bytes(reply: &Reply) -> Bytes {
    match reply {
        Reply::Bulk(data) => data.clone(),
        Reply::Status(s) => Bytes::copy_from_slice(s.as_bytes()),
        _ => Bytes::new(),
    }
}

/// Receives every frame a subscription-mode connection produces.
///
/// Called on the connection manager's task; implementations must not
/// block.
pub trait MessageListener: Send + Sync {
    fn on_message(&self, message: Message);
}

/// Tracks the live subscription set and replays it after reconnects.
struct Resubscriber {
    core: Arc<ClientCore>,
    channels: Mutex<BTreeSet<String>>,
    patterns: Mutex<BTreeSet<String>>,
}

impl Resubscriber {
    fn stage_subscribe(&self, command: &str, names: &[&str]) {
        if names.is_empty() {
            return;
        }
        let mut argv: Vec<&[u8]> = Vec::with_capacity(names.len() + 1);
        argv.push(command.as_bytes());
        argv.extend(names.iter().map(|n| n.as_bytes()));
        self.core.stage_control(encode_command(&argv));
    }
}

impl ConnectionListener for Resubscriber {
    fn notify_connection_established(&self, epoch: u64) {
        let channels: Vec<String> = sync::lock(&self.channels).iter().cloned().collect();
        let patterns: Vec<String> = sync::lock(&self.patterns).iter().cloned().collect();
        debug!(
            epoch,
            channels = channels.len(),
            patterns = patterns.len(),
            "replaying subscriptions"
        );

        let channel_refs: Vec<&str> = channels.iter().map(String::as_str).collect();
        self.stage_subscribe("SUBSCRIBE", &channel_refs);
        let pattern_refs: Vec<&str> = patterns.iter().map(String::as_str).collect();
        self.stage_subscribe("PSUBSCRIBE", &pattern_refs);
    }
}

/// A connection in subscription mode with a single listener.
///
/// Models the raw protocol: every incoming frame goes to the listener
/// undispatched. Channel-level routing is [`Subscriber`]'s job.
pub struct BaseSubscriber {
    client: Client,
    resub: Arc<Resubscriber>,
}

impl BaseSubscriber {
    /// Connects a subscription-mode client routing all frames to
    /// `listener`.
    pub fn new(
        options: Options,
        listener: Arc<dyn MessageListener>,
    ) -> Result<Self, ConfigError> {
        let options = options.message_listener(listener);
        let client = Client::new(options)?;

        let resub = Arc::new(Resubscriber {
            core: client.core().clone(),
            channels: Mutex::new(BTreeSet::new()),
            patterns: Mutex::new(BTreeSet::new()),
        });
        let as_listener: Arc<dyn ConnectionListener> = resub.clone();
        client.attach_listener(Arc::downgrade(&as_listener));

        Ok(Self { client, resub })
    }

    /// Subscribes to exact channels. Control traffic bypasses
    /// backpressure — it can originate from reconnect callbacks on the
    /// connection manager's own task.
    pub fn subscribe(&self, channels: &[&str]) {
        sync::lock(&self.resub.channels)
            .extend(channels.iter().map(|c| c.to_string()));
        self.resub.stage_subscribe("SUBSCRIBE", channels);
    }

    /// Unsubscribes from exact channels.
    pub fn unsubscribe(&self, channels: &[&str]) {
        {
            let mut set = sync::lock(&self.resub.channels);
            for channel in channels {
                set.remove(*channel);
            }
        }
        self.resub.stage_subscribe("UNSUBSCRIBE", channels);
    }

    /// Subscribes to glob patterns.
    pub fn psubscribe(&self, patterns: &[&str]) {
        sync::lock(&self.resub.patterns)
            .extend(patterns.iter().map(|p| p.to_string()));
        self.resub.stage_subscribe("PSUBSCRIBE", patterns);
    }

    /// Unsubscribes from glob patterns.
    pub fn punsubscribe(&self, patterns: &[&str]) {
        {
            let mut set = sync::lock(&self.resub.patterns);
            for pattern in patterns {
                set.remove(*pattern);
            }
        }
        self.resub.stage_subscribe("PUNSUBSCRIBE", patterns);
    }

    /// The underlying client, e.g. for epoch inspection or listener
    /// attachment.
    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Routing slot: one subscription handle's inbox.
struct Slot {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
}

/// Fans messages out to subscription handles by channel or pattern.
#[derive(Default)]
struct Dispatcher {
    channels: Mutex<HashMap<String, Vec<Slot>>>,
    patterns: Mutex<HashMap<String, Vec<Slot>>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    fn route(map: &Mutex<HashMap<String, Vec<Slot>>>, name: &str, message: &Message) {
        let mut map = sync::lock(map);
        if let Some(slots) = map.get_mut(name) {
            // senders whose receiving handle is gone are dropped here;
            // the handle's Drop also removes its slot eagerly
            slots.retain(|slot| slot.tx.send(message.clone()).is_ok());
            if slots.is_empty() {
                map.remove(name);
            }
        }
    }

    fn remove(&self, pattern: bool, name: &str, id: u64) {
        let map = if pattern { &self.patterns } else { &self.channels };
        let mut map = sync::lock(map);
        if let Some(slots) = map.get_mut(name) {
            slots.retain(|slot| slot.id != id);
            if slots.is_empty() {
                map.remove(name);
            }
        }
    }
}

impl MessageListener for Dispatcher {
    fn on_message(&self, message: Message) {
        match message.kind {
            MessageKind::Message => {
                if let Some(channel) = message.channel.clone() {
                    Self::route(&self.channels, &channel, &message);
                }
            }
            MessageKind::PatternMessage => {
                if let Some(pattern) = message.pattern.clone() {
                    Self::route(&self.patterns, &pattern, &message);
                }
            }
            // confirmations carry no payload to deliver
            _ => {}
        }
    }
}

/// A subscription-mode client with per-channel inboxes.
pub struct Subscriber {
    base: BaseSubscriber,
    dispatcher: Arc<Dispatcher>,
}

impl Subscriber {
    pub fn new(options: Options) -> Result<Self, ConfigError> {
        let dispatcher = Arc::new(Dispatcher::default());
        let base = BaseSubscriber::new(options, dispatcher.clone())?;
        Ok(Self { base, dispatcher })
    }

    /// Subscribes to `channel` and returns the inbox handle. Dropping
    /// the handle stops dispatch to it.
    pub fn subscribe(&self, channel: &str) -> Subscription {
        let (slot, subscription) = self.make_subscription(false, channel);
        sync::lock(&self.dispatcher.channels)
            .entry(channel.to_string())
            .or_default()
            .push(slot);
        self.base.subscribe(&[channel]);
        subscription
    }

    /// Subscribes to a glob `pattern` and returns the inbox handle.
    pub fn psubscribe(&self, pattern: &str) -> Subscription {
        let (slot, subscription) = self.make_subscription(true, pattern);
        sync::lock(&self.dispatcher.patterns)
            .entry(pattern.to_string())
            .or_default()
            .push(slot);
        self.base.psubscribe(&[pattern]);
        subscription
    }

    fn make_subscription(&self, pattern: bool, name: &str) -> (Slot, Subscription) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.dispatcher.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Slot { id, tx };
        let subscription = Subscription {
            dispatcher: Arc::downgrade(&self.dispatcher),
            pattern,
            name: name.to_string(),
            id,
            rx,
        };
        (slot, subscription)
    }

    /// The raw subscriber underneath, e.g. for listener attachment.
    pub fn base(&self) -> &BaseSubscriber {
        &self.base
    }
}

/// One channel's (or pattern's) message inbox. Owned by the caller;
/// dropping it unregisters the inbox.
pub struct Subscription {
    dispatcher: Weak<Dispatcher>,
    pattern: bool,
    name: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    /// The channel or pattern this handle is bound to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the next message. `None` once the subscriber is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Non-blocking read.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.remove(self.pattern, &self.name, self.id);
        }
    }
}
