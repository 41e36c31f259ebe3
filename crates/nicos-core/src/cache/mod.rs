//! Timestamped key/value cache.
//!
//! Keys have the form `prefix/device/param` (all lower case). The part up
//! to the last slash is the *category*; key rewrites and prefix callbacks
//! work on categories.
//!
//! - [`CacheStore`]: in-process store with subscriptions, rewrites and locks.
//! - [`CacheServer`]: serves a store over the line protocol.
//! - [`RemoteCache`]: connects to a server and mirrors it into a local store.
//! - [`FlatFileStore`]: keeps a store's latest values on disk across restarts.
//!
//! Devices only see the [`CacheBackend`] trait.

mod flatfile;
mod remote;
mod server;
mod store;

use std::sync::Arc;

use nicos_proto::Value;

pub use flatfile::FlatFileStore;
pub use remote::{RemoteCache, RemoteCacheConfig};
pub use server::CacheServer;
pub use store::CacheStore;

/// Key prefix used when none is configured.
pub const DEFAULT_PREFIX: &str = "nicos";

/// Seconds since the Unix epoch, with microsecond resolution.
#[allow(clippy::cast_precision_loss, clippy::as_conversions)]
pub fn now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

/// `prefix/device/param`, lower-cased.
pub fn cache_key(prefix: &str, device: &str, param: &str) -> String {
    format!("{prefix}/{device}/{param}").to_lowercase()
}

/// Split a key into category and sub-key at the last slash.
pub fn split_key(key: &str) -> (&str, &str) {
    key.rsplit_once('/').unwrap_or(("nocat", key))
}

// ── Entries and updates ──────────────────────────────────────────────

/// The current value stored under one key.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: Value,
    pub time: f64,
    pub ttl: Option<f64>,
    /// Explicitly invalidated; the value is kept but must not be trusted.
    pub expired: bool,
}

impl CacheEntry {
    /// Not invalidated and within its time-to-live.
    pub fn is_valid(&self, now: f64) -> bool {
        !self.expired && self.ttl.is_none_or(|ttl| self.time + ttl >= now)
    }

    /// Valid and at most `max_age` seconds old.
    pub fn is_fresh(&self, now: f64, max_age: f64) -> bool {
        self.is_valid(now) && now - self.time <= max_age
    }
}

/// A change notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheUpdate {
    pub key: String,
    /// `None` when the key was deleted.
    pub value: Option<Value>,
    pub time: f64,
    pub ttl: Option<f64>,
    pub expired: bool,
    /// Connection the write came from, so servers don't echo it back.
    pub origin: Option<u64>,
}

pub type Callback = Arc<dyn Fn(&CacheUpdate) + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

// ── Backend trait ────────────────────────────────────────────────────

/// What devices, the poller and the session need from a cache.
///
/// Calls never block on the network; a remote backend queues writes and
/// answers reads from its mirror.
pub trait CacheBackend: Send + Sync {
    /// Key prefix, e.g. `nicos`.
    fn prefix(&self) -> &str;

    fn put_key(&self, key: &str, value: Value, time: f64, ttl: Option<f64>);

    fn entry(&self, key: &str) -> Option<CacheEntry>;

    /// Mark the entry expired so the next access polls the hardware.
    fn invalidate_key(&self, key: &str);

    /// Invoke `callback` for every update to a key containing `pattern`.
    fn subscribe(&self, pattern: &str, callback: Callback) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);

    /// Store everything written under `old_prefix` also under `new_prefix`.
    fn add_rewrite(&self, new_prefix: &str, old_prefix: &str);

    fn remove_rewrite(&self, new_prefix: &str);

    /// `false` while a remote backend is disconnected.
    fn is_connected(&self) -> bool {
        true
    }

    /// All current entries whose key contains `pattern`.
    fn query(&self, pattern: &str) -> Vec<(String, CacheEntry)>;

    // ── Device-level helpers ─────────────────────────────────────────

    fn key(&self, device: &str, param: &str) -> String {
        cache_key(self.prefix(), device, param)
    }

    fn set(&self, device: &str, param: &str, value: Value, time: f64, ttl: Option<f64>) {
        self.put_key(&self.key(device, param), value, time, ttl);
    }

    /// Most recent value regardless of age, or `default`.
    fn get(&self, device: &str, param: &str, default: Value) -> Value {
        self.entry(&self.key(device, param))
            .map_or(default, |entry| entry.value)
    }

    /// Entry for `device/param` that is valid and within `max_age`.
    ///
    /// `None` for `max_age` only checks validity.
    fn fresh(&self, device: &str, param: &str, max_age: Option<f64>) -> Option<CacheEntry> {
        let entry = self.entry(&self.key(device, param))?;
        let now = now();
        let usable = match max_age {
            Some(age) => entry.is_fresh(now, age),
            None => entry.is_valid(now),
        };
        usable.then_some(entry)
    }

    fn invalidate(&self, device: &str, param: &str) {
        self.invalidate_key(&self.key(device, param));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_lower_case() {
        assert_eq!(cache_key("nicos", "T_ccr0", "Value"), "nicos/t_ccr0/value");
        assert_eq!(split_key("nicos/t/value"), ("nicos/t", "value"));
        assert_eq!(split_key("plain"), ("nocat", "plain"));
    }

    #[test]
    fn entry_validity() {
        let entry = CacheEntry {
            value: Value::Float(1.0),
            time: 100.0,
            ttl: Some(5.0),
            expired: false,
        };
        assert!(entry.is_valid(104.0));
        assert!(!entry.is_valid(106.0));
        assert!(entry.is_fresh(101.0, 1.0));
        assert!(!entry.is_fresh(102.0, 1.0));

        let expired = CacheEntry {
            expired: true,
            ..entry
        };
        assert!(!expired.is_valid(100.0));
    }
}
