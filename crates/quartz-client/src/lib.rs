//! quartz-client: a pipelined async client for a Redis-compatible
//! replicated backend.
//!
//! One [`Client`] holds one long-lived TCP (optionally TLS) connection
//! to a cluster member and pipelines requests over it: requests are
//! staged in order, written in order, and their futures resolve in
//! order. When the connection dies the client fails over to the next
//! member (or wherever a `MOVED` redirect points), with a retry strategy
//! deciding the fate of requests caught in the outage.
//!
//! On top of that sit [`Subscriber`] for pub/sub and [`SharedHash`], a
//! client-side replica of a server-side versioned hash kept current
//! through revision-numbered updates and snapshot resyncs.
//!
//! # quick start
//!
//! ```no_run
//! use quartz_client::{Client, Members, Options, RetryStrategy};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(
//!     Options::new(Members::parse("node-a:7777,node-b:7777")?)
//!         .transparent_redirects(true)
//!         .retry_strategy(RetryStrategy::infinite()),
//! )?;
//!
//! let reply = client.exec(&["GET", "greeting"]).await;
//! println!("{:?}", reply);
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod error;
mod handshake;
mod hash;
mod intercepts;
mod listener;
mod shared_hash;
mod stager;
mod stream;
mod subscriber;
mod sync;

pub use client::Client;
pub use config::{BackpressureStrategy, Endpoint, Members, Options, RetryStrategy, TlsConfig};
pub use error::{ConfigError, ConnectionError, ReplyError};
pub use handshake::{AuthHandshake, Handshake, HandshakeStatus};
pub use hash::HashKey;
pub use intercepts::{add_intercept, clear_intercepts};
pub use listener::ConnectionListener;
pub use shared_hash::SharedHash;
pub use stager::ReplyFuture;
pub use subscriber::{
    BaseSubscriber, Message, MessageKind, MessageListener, Subscriber, Subscription,
};

pub use quartz_protocol::{MultiBuilder, Reply};
