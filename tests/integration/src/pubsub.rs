//! Subscriber behavior: dispatch, confirmations, automatic
//! re-subscription after reconnect.

use std::sync::Arc;

use bytes::Bytes;
use quartz_client::{
    BaseSubscriber, Message, MessageKind, MessageListener, Reply, RetryStrategy, Subscriber,
};
use tokio::sync::mpsc;

use crate::helpers::{bulk, local_options, message_frame, subscribe_confirm, MockServer};

#[tokio::test]
async fn subscription_handle_receives_channel_messages() {
    let server = MockServer::start(|_, mut conn| async move {
        let cmd = conn.next().await.unwrap();
        assert_eq!(cmd, vec!["SUBSCRIBE", "events"]);
        conn.send(&subscribe_confirm("events")).await;
        conn.send(&message_frame("events", b"hello")).await;
        // hold the connection open
        while conn.next().await.is_some() {}
    });

    let subscriber = Subscriber::new(local_options(server.port)).unwrap();
    let mut subscription = subscriber.subscribe("events");

    let message = subscription.recv().await.unwrap();
    assert_eq!(message.kind, MessageKind::Message);
    assert_eq!(message.channel.as_deref(), Some("events"));
    assert_eq!(message.payload, Some(Bytes::from_static(b"hello")));
}

#[tokio::test]
async fn pattern_subscription_receives_pmessages() {
    let server = MockServer::start(|_, mut conn| async move {
        let cmd = conn.next().await.unwrap();
        assert_eq!(cmd, vec!["PSUBSCRIBE", "user:*"]);
        conn.send(&Reply::Array(vec![
            bulk("psubscribe"),
            bulk("user:*"),
            Reply::Integer(1),
        ]))
        .await;
        conn.send(&Reply::Array(vec![
            bulk("pmessage"),
            bulk("user:*"),
            bulk("user:login"),
            bulk("alice"),
        ]))
        .await;
        while conn.next().await.is_some() {}
    });

    let subscriber = Subscriber::new(local_options(server.port)).unwrap();
    let mut subscription = subscriber.psubscribe("user:*");

    let message = subscription.recv().await.unwrap();
    assert_eq!(message.kind, MessageKind::PatternMessage);
    assert_eq!(message.pattern.as_deref(), Some("user:*"));
    assert_eq!(message.channel.as_deref(), Some("user:login"));
    assert_eq!(message.payload, Some(Bytes::from_static(b"alice")));
}

#[tokio::test]
async fn subscriptions_are_replayed_after_reconnect() {
    let server = MockServer::start(|index, mut conn| async move {
        let cmd = conn.next().await.unwrap();
        assert_eq!(cmd, vec!["SUBSCRIBE", "events"]);
        conn.send(&subscribe_confirm("events")).await;

        if index == 0 {
            // die right after confirming; the client must re-subscribe
            // on its own when the next connection comes up
            return;
        }
        conn.send(&message_frame("events", b"after-reconnect")).await;
        while conn.next().await.is_some() {}
    });

    let subscriber = Subscriber::new(
        local_options(server.port).retry_strategy(RetryStrategy::infinite()),
    )
    .unwrap();
    let mut subscription = subscriber.subscribe("events");

    let message = subscription.recv().await.unwrap();
    assert_eq!(message.payload, Some(Bytes::from_static(b"after-reconnect")));
}

/// Collects every frame the connection pushes, confirmations included.
struct Collector {
    tx: mpsc::UnboundedSender<Message>,
}

impl MessageListener for Collector {
    fn on_message(&self, message: Message) {
        let _ = self.tx.send(message);
    }
}

#[tokio::test]
async fn base_subscriber_routes_every_frame_to_the_listener() {
    let server = MockServer::start(|_, mut conn| async move {
        let cmd = conn.next().await.unwrap();
        assert_eq!(cmd, vec!["SUBSCRIBE", "alpha", "beta"]);
        conn.send(&subscribe_confirm("alpha")).await;
        conn.send(&subscribe_confirm("beta")).await;
        conn.send(&message_frame("beta", b"payload")).await;
        while conn.next().await.is_some() {}
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscriber =
        BaseSubscriber::new(local_options(server.port), Arc::new(Collector { tx })).unwrap();
    subscriber.subscribe(&["alpha", "beta"]);

    let first = rx.recv().await.unwrap();
    assert_eq!(first.kind, MessageKind::Subscribe);
    assert_eq!(first.channel.as_deref(), Some("alpha"));

    let second = rx.recv().await.unwrap();
    assert_eq!(second.kind, MessageKind::Subscribe);
    assert_eq!(second.channel.as_deref(), Some("beta"));

    let third = rx.recv().await.unwrap();
    assert_eq!(third.kind, MessageKind::Message);
    assert_eq!(third.channel.as_deref(), Some("beta"));
    assert_eq!(third.payload, Some(Bytes::from_static(b"payload")));
}

#[tokio::test]
async fn two_handles_on_one_channel_both_receive() {
    let server = MockServer::start(|_, mut conn| async move {
        // two SUBSCRIBE commands arrive (one per handle)
        let _ = conn.next().await;
        let _ = conn.next().await;
        conn.send(&subscribe_confirm("shared")).await;
        conn.send(&message_frame("shared", b"fanout")).await;
        while conn.next().await.is_some() {}
    });

    let subscriber = Subscriber::new(local_options(server.port)).unwrap();
    let mut first = subscriber.subscribe("shared");
    let mut second = subscriber.subscribe("shared");

    assert_eq!(
        first.recv().await.unwrap().payload,
        Some(Bytes::from_static(b"fanout"))
    );
    assert_eq!(
        second.recv().await.unwrap().payload,
        Some(Bytes::from_static(b"fanout"))
    );
}
