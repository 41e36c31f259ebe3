// ── Cache server ──
//
// Serves a `CacheStore` over the line protocol. Each connection gets a
// reader task (requests in, replies to the outbox) and a writer task
// (outbox plus matching store updates out). Updates are never echoed
// back to the connection that made them.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::{SinkExt, StreamExt};
use nicos_proto::{CacheCodec, DEFAULT_LOCK_TTL, Message, Op, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use super::{CacheBackend, CacheEntry, CacheStore, CacheUpdate, now};
use crate::error::NicosError;

/// Per-connection subscriptions: `(pattern, with timestamps)`.
type Subscriptions = Arc<Mutex<Vec<(String, bool)>>>;

/// A running cache server.
pub struct CacheServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl CacheServer {
    /// Bind `addr` and start accepting clients in the background.
    pub async fn bind(addr: &str, store: CacheStore) -> Result<Self, NicosError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NicosError::comm(format!("cannot bind cache server to {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| NicosError::comm(e.to_string()))?;
        tracing::info!(%local_addr, "cache server listening");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, store, cancel.clone()));
        Ok(Self {
            local_addr,
            cancel,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and close all client connections.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait until the accept loop has exited.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "cache server task failed");
        }
    }
}

async fn accept_loop(listener: TcpListener, store: CacheStore, cancel: CancellationToken) {
    let mut next_id: u64 = 1;
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let id = next_id;
                    next_id += 1;
                    tracing::info!(client = id, %peer, "cache client connected");
                    tokio::spawn(serve_client(id, socket, store.clone(), cancel.child_token()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                }
            },
        }
    }
    tracing::debug!("cache accept loop exiting");
}

// ── Single connection ────────────────────────────────────────────────

async fn serve_client(id: u64, socket: TcpStream, store: CacheStore, cancel: CancellationToken) {
    if let Err(e) = socket.set_nodelay(true) {
        tracing::debug!(client = id, error = %e, "cannot set TCP_NODELAY");
    }
    let (mut sink, mut stream) = Framed::new(socket, CacheCodec::default()).split();
    let subscriptions: Subscriptions = Arc::default();
    let (outbox, mut replies) = mpsc::unbounded_channel::<Message>();

    let writer_cancel = cancel.clone();
    let writer_subs = Arc::clone(&subscriptions);
    let writer_store = store.clone();
    let mut updates = store.updates();
    let writer = tokio::spawn(async move {
        'outer: loop {
            let batch = tokio::select! {
                biased;
                () = writer_cancel.cancelled() => break,
                reply = replies.recv() => match reply {
                    Some(msg) => vec![msg],
                    None => break,
                },
                update = updates.recv() => match update {
                    Ok(update) => match forward_update(id, &update, &writer_subs) {
                        Some(msg) => vec![msg],
                        None => continue,
                    },
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(client = id, missed, "client fell behind on updates, resending subscribed keys");
                        // Skip the stale backlog; the snapshot is at least as new.
                        updates = updates.resubscribe();
                        resync(&writer_store, &writer_subs)
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            for msg in batch {
                if let Err(e) = sink.feed(msg).await {
                    tracing::debug!(client = id, error = %e, "write to client failed");
                    break 'outer;
                }
            }
            if let Err(e) = sink.flush().await {
                tracing::debug!(client = id, error = %e, "write to client failed");
                break;
            }
        }
        writer_cancel.cancel();
    });

    loop {
        let msg = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            msg = stream.next() => match msg {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    tracing::warn!(client = id, error = %e, "read from client failed");
                    break;
                }
                None => break,
            },
        };
        for reply in handle_request(id, msg, &store, &subscriptions) {
            if outbox.send(reply).is_err() {
                break;
            }
        }
    }

    cancel.cancel();
    let _ = writer.await;
    tracing::info!(client = id, "cache client disconnected");
}

/// The message to send for `update`, if this client subscribed to it.
fn forward_update(id: u64, update: &CacheUpdate, subscriptions: &Subscriptions) -> Option<Message> {
    if update.origin == Some(id) {
        return None;
    }
    let stamped = subscriptions
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .filter(|(pattern, _)| update.key.contains(pattern.as_str()))
        .map(|(_, stamped)| *stamped)
        .reduce(|a, b| a || b)?;

    let value = update.value.as_ref().map(Value::encode).unwrap_or_default();
    let msg = if update.expired {
        Message::tell_old(update.key.clone(), value)
    } else {
        Message::tell(update.key.clone(), value)
    };
    Some(if stamped {
        msg.stamped_at(update.time, update.ttl)
    } else {
        msg
    })
}

/// Current state of every key matching one of the client's subscriptions.
fn resync(store: &CacheStore, subscriptions: &Subscriptions) -> Vec<Message> {
    let patterns = subscriptions
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    let mut matched: BTreeMap<String, (CacheEntry, bool)> = BTreeMap::new();
    for (pattern, stamped) in patterns {
        for (key, entry) in store.query(&pattern) {
            matched
                .entry(key)
                .and_modify(|(_, s)| *s |= stamped)
                .or_insert((entry, stamped));
        }
    }
    matched
        .iter()
        .map(|(key, (entry, stamped))| entry_reply(key, entry, *stamped))
        .collect()
}

/// Reply to a single `?` or `*` hit.
fn entry_reply(key: &str, entry: &CacheEntry, stamped: bool) -> Message {
    let value = entry.value.encode();
    let msg = if entry.is_valid(now()) {
        Message::tell(key, value)
    } else {
        Message::tell_old(key, value)
    };
    if stamped {
        msg.stamped_at(entry.time, entry.ttl)
    } else {
        msg
    }
}

fn handle_request(
    id: u64,
    msg: Message,
    store: &CacheStore,
    subscriptions: &Subscriptions,
) -> Vec<Message> {
    let key = msg.key.to_lowercase();
    match msg.op {
        Op::Tell => {
            let time = msg.time.unwrap_or_else(now);
            match msg.value() {
                None => store.tell(&key, None, time, None, Some(id)),
                Some(text) => match Value::decode(text) {
                    Ok(value) => store.tell(&key, Some(value), time, msg.ttl, Some(id)),
                    Err(e) => {
                        tracing::warn!(client = id, key, error = %e, "ignoring invalid value");
                    }
                },
            }
            Vec::new()
        }
        Op::TellOld => {
            store.expire(&key, Some(id));
            Vec::new()
        }
        Op::Ask => vec![match store.entry(&key) {
            Some(entry) => entry_reply(&key, &entry, msg.stamped),
            None => Message::tell_old(key, ""),
        }],
        Op::Wildcard => store
            .query(&key)
            .iter()
            .map(|(k, entry)| entry_reply(k, entry, msg.stamped))
            .collect(),
        Op::Subscribe => {
            tracing::debug!(client = id, pattern = key, "subscribed");
            subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((key, msg.stamped));
            Vec::new()
        }
        Op::Lock => {
            let mut chars = msg.value.chars();
            let request = chars.next();
            let client = chars.as_str();
            let result = match request {
                Some('+') => store.lock(
                    &key,
                    client,
                    msg.time.unwrap_or_else(now),
                    msg.ttl.unwrap_or(DEFAULT_LOCK_TTL),
                ),
                Some('-') => store.unlock(&key, client),
                _ => {
                    tracing::warn!(client = id, key, "malformed lock request");
                    return Vec::new();
                }
            };
            vec![Message::lock_reply(key, result.err().unwrap_or_default())]
        }
        Op::Rewrite => {
            store.set_rewrite(&key, &msg.value);
            Vec::new()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn subs(patterns: &[(&str, bool)]) -> Subscriptions {
        Arc::new(Mutex::new(
            patterns.iter().map(|(p, s)| ((*p).to_owned(), *s)).collect(),
        ))
    }

    fn update(key: &str, origin: Option<u64>) -> CacheUpdate {
        CacheUpdate {
            key: key.into(),
            value: Some(Value::Float(1.5)),
            time: 1000.0,
            ttl: None,
            expired: false,
            origin,
        }
    }

    #[test]
    fn updates_are_not_echoed() {
        let subs = subs(&[("nicos/", false)]);
        assert!(forward_update(1, &update("nicos/m/value", Some(1)), &subs).is_none());
        let msg = forward_update(1, &update("nicos/m/value", Some(2)), &subs).unwrap();
        assert_eq!(msg.to_string(), "nicos/m/value=1.5");
    }

    #[test]
    fn stamped_subscription_wins() {
        let subs = subs(&[("nicos/m", false), ("value", true)]);
        let msg = forward_update(1, &update("nicos/m/value", None), &subs).unwrap();
        assert_eq!(msg.to_string(), "1000@nicos/m/value=1.5");
        assert!(forward_update(1, &update("other/x", None), &subs).is_none());
    }

    #[test]
    fn resync_sends_each_subscribed_key_once() {
        let store = CacheStore::default();
        store.tell("nicos/m/value", Some(Value::Float(2.0)), 1000.0, None, None);
        store.tell("nicos/m/unit", Some(Value::from("mm")), 1000.0, None, None);
        store.tell("other/x/value", Some(Value::Int(1)), 1000.0, None, None);
        store.expire("nicos/m/unit", None);

        let subs = subs(&[("nicos/m", false), ("value", true)]);
        let lines: Vec<String> = resync(&store, &subs).iter().map(ToString::to_string).collect();
        assert_eq!(
            lines,
            vec![
                "nicos/m/unit!'mm'",
                "1000@nicos/m/value=2.0",
                "1000@other/x/value=1",
            ]
        );
    }

    #[test]
    fn ask_unknown_key_replies_tell_old() {
        let store = CacheStore::default();
        let replies = handle_request(1, Message::ask("nicos/x/value", false), &store, &subs(&[]));
        assert_eq!(replies[0].to_string(), "nicos/x/value!");
    }

    #[test]
    fn tell_then_ask() {
        let store = CacheStore::default();
        let subs = subs(&[]);
        handle_request(1, Message::tell("Nicos/M/Value", "(1, 'a')"), &store, &subs);
        let replies = handle_request(1, Message::ask("nicos/m/value", false), &store, &subs);
        assert_eq!(replies[0].to_string(), "nicos/m/value=(1, 'a')");

        handle_request(1, Message::tell_old("nicos/m/value", ""), &store, &subs);
        let replies = handle_request(1, Message::ask("nicos/m/value", false), &store, &subs);
        assert_eq!(replies[0].op, Op::TellOld);
    }

    #[test]
    fn invalid_literals_are_ignored() {
        let store = CacheStore::default();
        handle_request(1, Message::tell("nicos/m/value", "(1,"), &store, &subs(&[]));
        assert!(store.is_empty());
    }
}
