// ── Remote cache client ──
//
// Mirrors a cache server into a local `CacheStore`. Reads are answered
// from the mirror; writes go to the mirror at once and are queued for the
// server. A background task keeps the connection alive: subscribe to the
// prefix, sync everything under it, then follow updates. On failure it
// reconnects with backoff.
//
// The queue holds only the latest write per key. After a reconnect it is
// flushed once the sync is complete, and a queued write older than the
// server's value for the same key is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use indexmap::IndexMap;
use nicos_proto::{CacheClient, CacheStream, END_MARKER, Message, Op, Value};
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

use super::{CacheBackend, CacheEntry, CacheStore, Callback, SubscriptionId, now};
use crate::error::NicosError;
use crate::retry::BackoffPolicy;

/// Connection settings for [`RemoteCache`].
#[derive(Debug, Clone)]
pub struct RemoteCacheConfig {
    /// `host:port` of the cache server.
    pub addr: String,
    pub prefix: String,
    pub connect_timeout: Duration,
    pub reconnect: BackoffPolicy,
}

impl RemoteCacheConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            prefix: super::DEFAULT_PREFIX.to_owned(),
            connect_timeout: Duration::from_secs(5),
            reconnect: BackoffPolicy::reconnect(),
        }
    }
}

/// Writes waiting for the server, at most one per key.
#[derive(Debug, Default)]
struct Outbox {
    pending: Mutex<IndexMap<String, Message>>,
    wake: Notify,
}

impl Outbox {
    fn push(&self, msg: Message) {
        let slot = match msg.op {
            Op::Rewrite => format!("~{}", msg.key),
            _ => msg.key.clone(),
        };
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.shift_remove(&slot);
            pending.insert(slot, msg);
        }
        self.wake.notify_one();
    }

    fn take(&self) -> IndexMap<String, Message> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Put back writes that could not be sent, unless superseded meanwhile.
    fn requeue(&self, unsent: impl IntoIterator<Item = (String, Message)>) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        for (slot, msg) in unsent {
            pending.entry(slot).or_insert(msg);
        }
    }

    fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// A cache backend connected to a remote server.
pub struct RemoteCache {
    config: RemoteCacheConfig,
    mirror: CacheStore,
    outbox: Arc<Outbox>,
    connected: watch::Receiver<bool>,
    rewrites: Arc<Mutex<HashMap<String, String>>>,
    cancel: CancellationToken,
}

impl RemoteCache {
    /// Start the background connection. Must be called inside a runtime.
    pub fn connect(config: RemoteCacheConfig) -> Self {
        let mirror = CacheStore::new(&config.prefix);
        let outbox = Arc::new(Outbox::default());
        let (connected_tx, connected) = watch::channel(false);
        let rewrites = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        tokio::spawn(connection_loop(
            config.clone(),
            mirror.clone(),
            Arc::clone(&outbox),
            connected_tx,
            Arc::clone(&rewrites),
            cancel.clone(),
        ));

        Self {
            config,
            mirror,
            outbox,
            connected,
            rewrites,
            cancel,
        }
    }

    /// The local mirror, e.g. to follow `updates()`.
    pub fn mirror(&self) -> &CacheStore {
        &self.mirror
    }

    /// Wait until the initial sync has completed, up to `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.connected.clone();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|up| *up)).await,
            Ok(Ok(_))
        )
    }

    /// Take or release a cache lock through a dedicated connection.
    pub async fn lock(
        &self,
        key: &str,
        client: &str,
        lock: bool,
        ttl: Option<f64>,
    ) -> Result<Result<(), String>, NicosError> {
        let mut conn = CacheClient::connect(&self.config.addr, self.config.connect_timeout).await?;
        Ok(conn.lock(key, client, lock, ttl).await?)
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Number of writes not yet sent to the server.
    pub fn pending(&self) -> usize {
        self.outbox.len()
    }

    fn send(&self, msg: Message) {
        if !self.is_connected() {
            tracing::debug!(key = %msg.key, "cache disconnected, queueing");
        }
        self.outbox.push(msg);
    }
}

impl Drop for RemoteCache {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl CacheBackend for RemoteCache {
    fn prefix(&self) -> &str {
        &self.config.prefix
    }

    fn put_key(&self, key: &str, value: Value, time: f64, ttl: Option<f64>) {
        let key = key.to_lowercase();
        self.send(Message::tell_at(time, ttl, key.clone(), value.encode()));
        self.mirror.tell(&key, Some(value), time, ttl, None);
    }

    fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.mirror.entry(key)
    }

    fn invalidate_key(&self, key: &str) {
        let key = key.to_lowercase();
        self.send(Message::tell_old(key.clone(), ""));
        self.mirror.expire(&key, None);
    }

    fn subscribe(&self, pattern: &str, callback: Callback) -> SubscriptionId {
        self.mirror.subscribe(pattern, callback)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.mirror.unsubscribe(id);
    }

    fn add_rewrite(&self, new_prefix: &str, old_prefix: &str) {
        self.rewrites
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(new_prefix.to_lowercase(), old_prefix.to_lowercase());
        self.mirror.set_rewrite(new_prefix, old_prefix);
        self.send(Message::rewrite(new_prefix.to_lowercase(), old_prefix.to_lowercase()));
    }

    fn remove_rewrite(&self, new_prefix: &str) {
        self.rewrites
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&new_prefix.to_lowercase());
        self.mirror.set_rewrite(new_prefix, "");
        self.send(Message::rewrite(new_prefix.to_lowercase(), ""));
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn query(&self, pattern: &str) -> Vec<(String, CacheEntry)> {
        self.mirror.query(pattern)
    }
}

// ── Background connection loop ───────────────────────────────────────

async fn connection_loop(
    config: RemoteCacheConfig,
    mirror: CacheStore,
    outbox: Arc<Outbox>,
    connected: watch::Sender<bool>,
    rewrites: Arc<Mutex<HashMap<String, String>>>,
    cancel: CancellationToken,
) {
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = run_connection(&config, &mirror, &outbox, &connected, &rewrites) => {
                connected.send_replace(false);
                match result {
                    Ok(()) => {
                        tracing::info!(addr = %config.addr, "cache connection closed, reconnecting");
                        failures = 0;
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        let delay = config.reconnect.delay(failures);
                        tracing::warn!(
                            addr = %config.addr,
                            error = %e,
                            failures,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "cache connection failed"
                        );
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => break,
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }
    connected.send_replace(false);
    tracing::debug!("cache connection loop exiting");
}

async fn run_connection(
    config: &RemoteCacheConfig,
    mirror: &CacheStore,
    outbox: &Outbox,
    connected: &watch::Sender<bool>,
    rewrites: &Mutex<HashMap<String, String>>,
) -> Result<(), nicos_proto::Error> {
    let mut stream: CacheStream = nicos_proto::connect(&config.addr, config.connect_timeout).await?;
    tracing::info!(addr = %config.addr, "connected to cache");

    let prefix = format!("{}/", config.prefix);
    let pending_rewrites: Vec<(String, String)> = rewrites
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|(new, old)| (new.clone(), old.clone()))
        .collect();
    for (new, old) in pending_rewrites {
        stream.send(Message::rewrite(new, old)).await?;
    }
    stream.send(Message::subscribe(prefix.clone(), true)).await?;
    stream.send(Message::wildcard(prefix, true)).await?;
    stream.send(Message::ask(END_MARKER, false)).await?;

    let mut synced = false;
    loop {
        tokio::select! {
            () = outbox.wake.notified(), if synced => flush(&mut stream, mirror, outbox).await?,
            incoming = stream.next() => match incoming {
                Some(msg) => {
                    let msg = msg?;
                    if msg.key == END_MARKER {
                        tracing::debug!("cache sync complete");
                        synced = true;
                        flush(&mut stream, mirror, outbox).await?;
                        connected.send_replace(true);
                    } else {
                        apply_incoming(mirror, &msg);
                    }
                }
                None => return Ok(()),
            },
        }
    }
}

/// Send every queued write. Writes older than what the server reported
/// for the same key are dropped; the others win over the synced value.
async fn flush(
    stream: &mut CacheStream,
    mirror: &CacheStore,
    outbox: &Outbox,
) -> Result<(), nicos_proto::Error> {
    let mut batch = outbox.take().into_iter();
    while let Some((slot, msg)) = batch.next() {
        if let (Op::Tell, Some(time)) = (msg.op, msg.time) {
            let newer = mirror.entry(&msg.key).is_some_and(|entry| entry.time > time);
            if newer {
                tracing::debug!(key = %msg.key, "server value is newer, dropping queued write");
                continue;
            }
        }
        if let Err(e) = stream.feed(msg.clone()).await {
            outbox.requeue(std::iter::once((slot, msg)).chain(batch));
            return Err(e);
        }
        restore_local(mirror, &msg);
    }
    stream.flush().await
}

/// Re-apply a queued write to the mirror after the sync replaced it.
fn restore_local(mirror: &CacheStore, msg: &Message) {
    match msg.op {
        Op::Tell => {
            if let Some(value) = msg.value().and_then(|text| Value::decode(text).ok()) {
                mirror.tell(&msg.key, Some(value), msg.time.unwrap_or_else(now), msg.ttl, None);
            }
        }
        Op::TellOld => mirror.expire(&msg.key, None),
        _ => {}
    }
}

/// Apply a server message to the mirror.
fn apply_incoming(mirror: &CacheStore, msg: &Message) {
    let time = msg.time.unwrap_or_else(now);
    match msg.op {
        Op::Tell => match msg.value() {
            None => mirror.tell(&msg.key, None, time, None, None),
            Some(text) => match Value::decode(text) {
                Ok(value) => mirror.tell(&msg.key, Some(value), time, msg.ttl, None),
                Err(e) => tracing::warn!(key = %msg.key, error = %e, "ignoring invalid value"),
            },
        },
        Op::TellOld => {
            if let Some(value) = msg.value().and_then(|text| Value::decode(text).ok()) {
                mirror.tell(&msg.key, Some(value), time, msg.ttl, None);
            }
            mirror.expire(&msg.key, None);
        }
        _ => tracing::trace!(line = %msg, "ignoring cache message"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn outbox_keeps_latest_write_per_key() {
        let outbox = Outbox::default();
        for i in 0..100 {
            outbox.push(Message::tell_at(f64::from(i), None, "nicos/m/value", i.to_string()));
        }
        outbox.push(Message::tell_old("nicos/m/status", ""));
        outbox.push(Message::rewrite("nicos/t", "nicos/t_ccr0"));
        outbox.push(Message::rewrite("nicos/t", "nicos/t_ccr1"));
        outbox.push(Message::tell_at(100.0, None, "nicos/m/value", "100"));
        assert_eq!(outbox.len(), 3);

        let lines: Vec<String> = outbox.take().values().map(ToString::to_string).collect();
        assert_eq!(
            lines,
            vec![
                "nicos/m/status!",
                "nicos/t~nicos/t_ccr1",
                "100@nicos/m/value=100",
            ]
        );
        assert_eq!(outbox.len(), 0);
    }

    #[test]
    fn requeue_does_not_override_newer_writes() {
        let outbox = Outbox::default();
        outbox.push(Message::tell("nicos/m/value", "2"));
        outbox.requeue([
            ("nicos/m/value".to_owned(), Message::tell("nicos/m/value", "1")),
            ("nicos/m/unit".to_owned(), Message::tell("nicos/m/unit", "'mm'")),
        ]);
        let lines: Vec<String> = outbox.take().values().map(ToString::to_string).collect();
        assert_eq!(lines, vec!["nicos/m/value=2", "nicos/m/unit='mm'"]);
    }

    #[test]
    fn incoming_updates_land_in_the_mirror() {
        let mirror = CacheStore::default();
        apply_incoming(&mirror, &Message::parse("100@nicos/m/value=2.5").unwrap());
        assert_eq!(mirror.get("m", "value", Value::None), Value::Float(2.5));

        apply_incoming(&mirror, &Message::parse("100@nicos/m/status!(200, 'ok')").unwrap());
        let entry = mirror.entry("nicos/m/status").unwrap();
        assert!(entry.expired);

        apply_incoming(&mirror, &Message::parse("nicos/m/value=").unwrap());
        assert!(mirror.entry("nicos/m/value").is_none());
    }
}
