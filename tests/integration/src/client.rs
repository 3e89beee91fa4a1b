//! Core request/reply behavior: pipelining, FIFO completion, error
//! delivery, MULTI bundles, shutdown semantics.

use std::time::Duration;

use bytes::Bytes;
use quartz_client::{BackpressureStrategy, Client, MultiBuilder, Reply};

use crate::helpers::{local_options, MockServer};

#[tokio::test]
async fn get_returns_bulk_reply() {
    let server = MockServer::start(|_, mut conn| async move {
        let cmd = conn.next().await.unwrap();
        assert_eq!(cmd, vec!["GET", "foo"]);
        conn.send_raw(b"$5\r\nhello\r\n").await;
    });

    let client = Client::new(local_options(server.port)).unwrap();
    let reply = client.exec(&["GET", "foo"]).await;
    assert_eq!(reply, Some(Reply::Bulk(Bytes::from_static(b"hello"))));
}

#[tokio::test]
async fn pipelined_futures_resolve_in_stage_order() {
    let server = MockServer::start(|_, mut conn| async move {
        // read the whole pipeline before answering, so replies can't be
        // accidentally paired by timing
        for _ in 0..5 {
            let cmd = conn.next().await.unwrap();
            assert_eq!(cmd[0], "PING");
        }
        for i in 1..=5i64 {
            conn.send(&Reply::Integer(i)).await;
        }
    });

    let client = Client::new(local_options(server.port)).unwrap();
    let mut futures = Vec::new();
    for _ in 0..5 {
        futures.push(client.execute(&["PING"]).await);
    }
    for (i, future) in futures.into_iter().enumerate() {
        assert_eq!(future.await, Some(Reply::Integer(i as i64 + 1)));
    }
}

#[tokio::test]
async fn server_errors_are_delivered_as_error_replies() {
    let server = MockServer::start(|_, mut conn| async move {
        let _ = conn.next().await;
        conn.send_raw(b"-ERR unknown command\r\n").await;
    });

    let client = Client::new(local_options(server.port)).unwrap();
    let reply = client.exec(&["BOGUS"]).await;
    assert_eq!(reply, Some(Reply::Error("ERR unknown command".into())));
}

#[tokio::test]
async fn callbacks_receive_the_reply() {
    let server = MockServer::start(|_, mut conn| async move {
        let _ = conn.next().await;
        conn.send_raw(b"+PONG\r\n").await;
    });

    let client = Client::new(local_options(server.port)).unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel();
    client
        .execute_callback(&["PING"], move |reply| {
            let _ = tx.send(reply);
        })
        .await;

    assert_eq!(rx.await.unwrap(), Some(Reply::Status("PONG".into())));
}

#[tokio::test]
async fn multi_bundle_resolves_with_exec_reply() {
    let server = MockServer::start(|_, mut conn| async move {
        assert_eq!(conn.next().await.unwrap(), vec!["MULTI"]);
        conn.send_ok().await;
        assert_eq!(conn.next().await.unwrap(), vec!["SET", "a", "1"]);
        conn.send_raw(b"+QUEUED\r\n").await;
        assert_eq!(conn.next().await.unwrap(), vec!["SET", "b", "2"]);
        conn.send_raw(b"+QUEUED\r\n").await;
        assert_eq!(conn.next().await.unwrap(), vec!["EXEC"]);
        conn.send(&Reply::Array(vec![
            Reply::Status("OK".into()),
            Reply::Status("OK".into()),
        ]))
        .await;
    });

    let client = Client::new(local_options(server.port)).unwrap();
    let mut multi = MultiBuilder::new();
    multi.add(&["SET", "a", "1"]);
    multi.add(&["SET", "b", "2"]);

    let reply = client.execute_multi(multi).await.await;
    assert_eq!(
        reply,
        Some(Reply::Array(vec![
            Reply::Status("OK".into()),
            Reply::Status("OK".into()),
        ]))
    );
}

#[tokio::test]
async fn dropping_the_client_resolves_pending_with_nil() {
    let server = MockServer::start(|_, mut conn| async move {
        // swallow the command and never answer
        let _ = conn.next().await;
        let _ = conn.next().await;
    });

    let client = Client::new(local_options(server.port)).unwrap();
    let future = client.execute(&["GET", "slow"]).await;
    drop(client);

    assert_eq!(future.await, None);
    drop(server);
}

#[tokio::test]
async fn zero_backpressure_cap_blocks_every_stage() {
    let server = MockServer::start(|_, _conn| async move {});

    let client = Client::new(
        local_options(server.port).backpressure(BackpressureStrategy::blocking(0)),
    )
    .unwrap();

    let attempt = tokio::time::timeout(Duration::from_millis(100), client.execute(&["PING"]));
    assert!(
        attempt.await.is_err(),
        "staging should park forever on a zero cap"
    );
}

#[tokio::test]
async fn typed_wrappers_interpret_replies() {
    let server = MockServer::start(|_, mut conn| async move {
        loop {
            let Some(cmd) = conn.next().await else { return };
            match cmd[0].as_str() {
                "EXISTS" => conn.send(&Reply::Integer(1)).await,
                "HGET" => conn.send_bulk("blue").await,
                "HLEN" => conn.send(&Reply::Integer(2)).await,
                "HGETALL" => {
                    conn.send(&Reply::Array(vec![
                        crate::helpers::bulk("color"),
                        crate::helpers::bulk("blue"),
                        crate::helpers::bulk("size"),
                        crate::helpers::bulk("xl"),
                    ]))
                    .await
                }
                _ => conn.send(&Reply::Error("ERR unexpected".into())).await,
            }
        }
    });

    let client = Client::new(local_options(server.port)).unwrap();
    assert_eq!(client.exists("prefs").await.unwrap(), 1);

    let prefs = client.hash("prefs");
    assert_eq!(prefs.hget("color").await.unwrap(), Some("blue".into()));
    assert_eq!(prefs.hlen().await.unwrap(), 2);
    let all = prefs.hgetall().await.unwrap();
    assert_eq!(all["color"], "blue");
    assert_eq!(all["size"], "xl");
}
