//! Shared hash end-to-end: snapshot loading, incremental revisions,
//! gap recovery, deletions, and the write path.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use quartz_client::{Client, Reply, RetryStrategy, SharedHash, Subscriber};
use tokio::sync::{broadcast, mpsc};

use crate::helpers::{bulk, local_options, message_frame, subscribe_confirm, MockServer};

/// A mock backend that understands just enough of the versioned-hash
/// protocol: scripted `VHGETALL` snapshots, `MULTI` bundles acknowledged
/// mechanically, and a publish channel for pushing update payloads to
/// whichever connection subscribed.
struct VhashRig {
    _server: MockServer,
    client: Client,
    subscriber: Subscriber,
    publish: broadcast::Sender<Bytes>,
    commands: mpsc::UnboundedReceiver<Vec<String>>,
}

impl VhashRig {
    fn start(key: &str, snapshots: Vec<Reply>) -> Self {
        let snapshots = Arc::new(Mutex::new(VecDeque::from(snapshots)));
        let (publish_tx, _) = broadcast::channel::<Bytes>(64);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let channel = format!("__vhash@{key}");

        let handler_publish = publish_tx.clone();
        let server = MockServer::start(move |_, conn| {
            let snapshots = snapshots.clone();
            let mut publish_rx = handler_publish.subscribe();
            let cmd_tx = cmd_tx.clone();
            let channel = channel.clone();

            async move {
                let crate::helpers::ServerConn { mut cmds, mut sink } = conn;
                let mut subscribed = false;

                loop {
                    tokio::select! {
                        cmd = cmds.next() => {
                            let Some(argv) = cmd else { return };
                            match argv[0].as_str() {
                                "SUBSCRIBE" => {
                                    sink.send(&subscribe_confirm(&argv[1])).await;
                                    subscribed = true;
                                }
                                "VHGETALL" => {
                                    let reply = snapshots
                                        .lock()
                                        .unwrap()
                                        .pop_front()
                                        .unwrap_or(Reply::Nil);
                                    sink.send(&reply).await;
                                }
                                "MULTI" => sink.send_ok().await,
                                "VHSET" | "VHDEL" => {
                                    sink.send(&Reply::Status("QUEUED".into())).await
                                }
                                "EXEC" => sink.send(&Reply::Array(vec![])).await,
                                other => {
                                    sink.send(&Reply::Error(format!("ERR unknown {other}")))
                                        .await
                                }
                            }
                            let _ = cmd_tx.send(argv);
                        }
                        payload = publish_rx.recv() => {
                            if subscribed {
                                if let Ok(payload) = payload {
                                    sink.send(&message_frame(&channel, &payload)).await;
                                }
                            }
                        }
                    }
                }
            }
        });

        let client = Client::new(
            local_options(server.port).retry_strategy(RetryStrategy::infinite()),
        )
        .unwrap();
        let subscriber = Subscriber::new(
            local_options(server.port).retry_strategy(RetryStrategy::infinite()),
        )
        .unwrap();

        Self {
            _server: server,
            client,
            subscriber,
            publish: publish_tx,
            commands: cmd_rx,
        }
    }

    /// Publishes an incremental update on the hash's channel.
    fn push_update(&self, revision: i64, updates: &[(&str, &str)]) {
        let mut items = vec![Reply::Integer(revision)];
        for (field, value) in updates {
            items.push(bulk(field));
            items.push(bulk(value));
        }
        let mut buf = BytesMut::new();
        Reply::Array(items).serialize(&mut buf);
        let _ = self.publish.send(buf.freeze());
    }

    /// Waits until the backend has seen a command named `name`, and
    /// returns its argv.
    async fn await_command(&mut self, name: &str) -> Vec<String> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let argv = self.commands.recv().await.expect("mock server gone");
                if argv[0] == name {
                    return argv;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {name}"))
    }
}

fn snapshot(revision: i64, fields: &[(&str, &str)]) -> Reply {
    let mut pairs = Vec::with_capacity(fields.len() * 2);
    for (field, value) in fields {
        pairs.push(bulk(field));
        pairs.push(bulk(value));
    }
    Reply::Array(vec![Reply::Integer(revision), Reply::Array(pairs)])
}

/// Polls a shared-hash condition; the update feed and resilver both run
/// on background tasks, so state changes are eventually visible.
async fn wait_for<F: FnMut() -> bool>(what: &str, cond: F) {
    crate::helpers::wait_until(what, cond).await;
}

#[tokio::test]
async fn incremental_feed_then_gap_triggers_resilver() {
    let mut rig = VhashRig::start(
        "cfg",
        vec![
            snapshot(7, &[("a", "1")]),
            snapshot(11, &[("a", "2"), ("b", "3"), ("c", "4")]),
        ],
    );

    let hash = SharedHash::new(&rig.client, &rig.subscriber, "cfg");
    rig.await_command("SUBSCRIBE").await;
    wait_for("initial snapshot", || hash.get_current_version() == 7).await;
    assert_eq!(hash.get("a"), Some("1".to_string()));

    // the next revision in sequence applies incrementally
    rig.push_update(8, &[("a", "2")]);
    wait_for("revision 8", || hash.get_current_version() == 8).await;
    assert_eq!(hash.get("a"), Some("2".to_string()));

    // revision 10 skips 9: rejected, resolved by the second snapshot
    rig.push_update(10, &[("b", "3")]);
    wait_for("resilver to 11", || hash.get_current_version() == 11).await;
    assert_eq!(hash.get("a"), Some("2".to_string()));
    assert_eq!(hash.get("b"), Some("3".to_string()));
    assert_eq!(hash.get("c"), Some("4".to_string()));
}

#[tokio::test]
async fn empty_value_in_update_deletes_the_field() {
    let mut rig = VhashRig::start("cfg", vec![snapshot(8, &[("a", "2")])]);

    let hash = SharedHash::new(&rig.client, &rig.subscriber, "cfg");
    rig.await_command("SUBSCRIBE").await;
    wait_for("initial snapshot", || hash.get_current_version() == 8).await;
    assert_eq!(hash.get("a"), Some("2".to_string()));

    rig.push_update(9, &[("a", "")]);
    wait_for("revision 9", || hash.get_current_version() == 9).await;
    assert_eq!(hash.get("a"), None);
}

#[tokio::test]
async fn rollback_revision_triggers_resilver() {
    let mut rig = VhashRig::start(
        "cfg",
        vec![snapshot(5, &[("a", "1")]), snapshot(6, &[("a", "9")])],
    );

    let hash = SharedHash::new(&rig.client, &rig.subscriber, "cfg");
    rig.await_command("SUBSCRIBE").await;
    wait_for("initial snapshot", || hash.get_current_version() == 5).await;

    // a revision at (or below) the local version is a server anomaly:
    // rejected, answered with a fresh snapshot request
    rig.push_update(5, &[("a", "stale")]);
    wait_for("resilver to 6", || hash.get_current_version() == 6).await;
    assert_eq!(hash.get("a"), Some("9".to_string()));
}

#[tokio::test]
async fn set_and_del_emit_multi_bundles() {
    let mut rig = VhashRig::start("cfg", vec![snapshot(1, &[])]);

    let hash = SharedHash::new(&rig.client, &rig.subscriber, "cfg");
    wait_for("initial snapshot", || hash.get_current_version() == 1).await;

    hash.set("mode", "active").await;
    rig.await_command("MULTI").await;
    assert_eq!(
        rig.await_command("VHSET").await,
        vec!["VHSET", "mode", "active"]
    );
    rig.await_command("EXEC").await;

    hash.del("mode").await;
    rig.await_command("MULTI").await;
    assert_eq!(rig.await_command("VHDEL").await, vec!["VHDEL", "mode"]);
    rig.await_command("EXEC").await;

    hash.set_batch([
        ("x".to_string(), "1".to_string()),
        ("y".to_string(), String::new()),
    ])
    .await;
    rig.await_command("MULTI").await;
    // one bundle carries both mutations
    assert_eq!(rig.await_command("VHSET").await, vec!["VHSET", "x", "1"]);
    assert_eq!(rig.await_command("VHDEL").await, vec!["VHDEL", "y"]);
    rig.await_command("EXEC").await;
}
