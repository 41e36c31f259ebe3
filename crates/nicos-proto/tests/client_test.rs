//! Integration tests for `CacheClient` against a scripted TCP peer.
#![allow(clippy::unwrap_used)]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use nicos_proto::{CacheClient, CacheCodec, Error, Message, Op};
use tokio::net::TcpListener;
use tokio_util::codec::Framed;

// ── Helpers ─────────────────────────────────────────────────────────

/// Spawn a one-connection server that answers each request via `respond`.
async fn scripted_server<F>(respond: F) -> String
where
    F: Fn(&Message) -> Vec<Message> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(socket, CacheCodec::default());
        while let Some(Ok(request)) = framed.next().await {
            for reply in respond(&request) {
                framed.send(reply).await.unwrap();
            }
        }
    });
    addr
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn ask_returns_matching_reply() {
    let addr = scripted_server(|req| match req.op {
        Op::Ask => vec![
            Message::tell("nicos/other/value", "0"),
            Message::tell(req.key.clone(), "12.5"),
        ],
        _ => vec![],
    })
    .await;

    let mut client = CacheClient::connect(&addr, Duration::from_secs(2)).await.unwrap();
    let reply = client.ask("nicos/m/value", false).await.unwrap();
    assert_eq!(reply.op, Op::Tell);
    assert_eq!(reply.value, "12.5");
}

#[tokio::test]
async fn query_collects_until_end_marker() {
    let addr = scripted_server(|req| match req.op {
        Op::Wildcard => vec![
            Message::tell("nicos/m/value", "1.0"),
            Message::tell("nicos/m/status", "(200, 'idle')"),
        ],
        Op::Ask => vec![Message::tell_old(req.key.clone(), "")],
        _ => vec![],
    })
    .await;

    let mut client = CacheClient::connect(&addr, Duration::from_secs(2)).await.unwrap();
    let entries = client.query("nicos/m/", false).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].key, "nicos/m/status");
}

#[tokio::test]
async fn lock_reports_holder_on_denial() {
    let addr = scripted_server(|req| match req.op {
        Op::Lock => vec![Message::lock_reply(&req.key, "other")],
        _ => vec![],
    })
    .await;

    let mut client = CacheClient::connect(&addr, Duration::from_secs(2)).await.unwrap();
    let result = client.lock("lock/x", "me", true, None).await.unwrap();
    assert_eq!(result, Err("other".to_owned()));
}

#[tokio::test]
async fn connect_failure_is_transient() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let err = CacheClient::connect(&addr, Duration::from_secs(2))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::Connect { .. }));
    assert!(err.is_transient());
}

#[tokio::test]
async fn recv_times_out_on_silent_peer() {
    let addr = scripted_server(|_| vec![]).await;
    let mut client = CacheClient::connect(&addr, Duration::from_millis(50)).await.unwrap();
    client.send(Message::ask("nicos/x/value", false)).await.unwrap();
    assert!(matches!(client.recv().await, Err(Error::Timeout { .. })));
}
