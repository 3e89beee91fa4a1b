//! MOVED redirect handling.

use quartz_client::{Client, Reply, RetryStrategy};

use crate::helpers::{local_options, MockServer};

#[tokio::test]
async fn moved_redirect_is_followed_and_never_surfaced() {
    // node B answers the resent request
    let server_b = MockServer::start(|_, mut conn| async move {
        let cmd = conn.next().await.unwrap();
        assert_eq!(cmd, vec!["GET", "x"]);
        conn.send_bulk("value-from-b").await;
    });
    let b_port = server_b.port;

    // node A redirects everything to B
    let server_a = MockServer::start(move |_, mut conn| async move {
        let cmd = conn.next().await.unwrap();
        assert_eq!(cmd, vec!["GET", "x"]);
        conn.send_raw(format!("-MOVED 5 127.0.0.1:{b_port}\r\n").as_bytes())
            .await;
    });

    let client =
        Client::new(local_options(server_a.port).transparent_redirects(true)).unwrap();

    // the future resolves with B's reply; the MOVED error never reaches it
    let reply = client.exec(&["GET", "x"]).await;
    assert_eq!(
        reply,
        Some(Reply::Bulk(bytes::Bytes::from_static(b"value-from-b")))
    );
}

#[tokio::test]
async fn redirect_lapses_back_to_configured_members() {
    let server_b = MockServer::start(|_, mut conn| async move {
        let cmd = conn.next().await.unwrap();
        assert_eq!(cmd, vec!["GET", "x"]);
        conn.send_bulk("from-b").await;
        // drop the redirect target; the client must fall back to A
    });
    let b_port = server_b.port;

    let server_a = MockServer::start(move |index, mut conn| async move {
        if index == 0 {
            let _ = conn.next().await;
            conn.send_raw(format!("-MOVED 5 127.0.0.1:{b_port}\r\n").as_bytes())
                .await;
            return;
        }
        // post-redirect reconnection lands here again
        while let Some(cmd) = conn.next().await {
            assert_eq!(cmd, vec!["PING"]);
            conn.send_raw(b"+PONG\r\n").await;
        }
    });

    let client = Client::new(
        local_options(server_a.port)
            .transparent_redirects(true)
            .retry_strategy(RetryStrategy::infinite()),
    )
    .unwrap();

    assert_eq!(
        client.exec(&["GET", "x"]).await,
        Some(Reply::Bulk(bytes::Bytes::from_static(b"from-b")))
    );
    // B closed after replying; the next command must be served by A
    assert_eq!(
        client.exec(&["PING"]).await,
        Some(Reply::Status("PONG".into()))
    );
}

#[tokio::test]
async fn malformed_moved_is_delivered_as_error() {
    let server = MockServer::start(|_, mut conn| async move {
        let _ = conn.next().await;
        conn.send_raw(b"-MOVED nonsense\r\n").await;
    });

    let client =
        Client::new(local_options(server.port).transparent_redirects(true)).unwrap();
    let reply = client.exec(&["GET", "x"]).await;
    assert_eq!(reply, Some(Reply::Error("MOVED nonsense".into())));
}

#[tokio::test]
async fn redirects_disabled_delivers_moved_as_error() {
    let server = MockServer::start(|_, mut conn| async move {
        let _ = conn.next().await;
        conn.send_raw(b"-MOVED 5 other:6380\r\n").await;
    });

    let client = Client::new(local_options(server.port)).unwrap();
    let reply = client.exec(&["GET", "x"]).await;
    assert_eq!(reply, Some(Reply::Error("MOVED 5 other:6380".into())));
}
