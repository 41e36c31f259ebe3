// ── In-process cache store ──
//
// Last-write-wins per key. Entries live in a `DashMap` so a write never
// blocks readers of other keys; subscriber callbacks run after the entry
// lock is released, one `catch_unwind` per callback.

use std::collections::{BTreeSet, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use dashmap::DashMap;
use nicos_proto::Value;
use tokio::sync::broadcast;

use super::{
    Callback, CacheBackend, CacheEntry, CacheUpdate, DEFAULT_PREFIX, SubscriptionId, now,
    split_key,
};

const UPDATE_CHANNEL_SIZE: usize = 1024;

/// Shared, cheaply clonable cache store.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<Inner>,
}

struct Inner {
    prefix: String,
    entries: DashMap<String, CacheEntry>,
    rewrites: RwLock<Rewrites>,
    subscriptions: RwLock<Vec<Subscription>>,
    next_subscription: AtomicU64,
    locks: Mutex<HashMap<String, LockEntry>>,
    updates: broadcast::Sender<CacheUpdate>,
}

struct Subscription {
    id: SubscriptionId,
    pattern: String,
    callback: Callback,
}

#[derive(Default)]
struct Rewrites {
    /// old category -> categories that mirror it
    forward: HashMap<String, BTreeSet<String>>,
    /// mirroring category -> old category
    inverse: HashMap<String, String>,
}

struct LockEntry {
    holder: String,
    time: f64,
    ttl: f64,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("prefix", &self.inner.prefix)
            .field("entries", &self.inner.entries.len())
            .finish_non_exhaustive()
    }
}

impl CacheStore {
    pub fn new(prefix: &str) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_SIZE);
        Self {
            inner: Arc::new(Inner {
                prefix: prefix.to_lowercase(),
                entries: DashMap::new(),
                rewrites: RwLock::new(Rewrites::default()),
                subscriptions: RwLock::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
                locks: Mutex::new(HashMap::new()),
                updates,
            }),
        }
    }

    /// Apply an update. `None` deletes the key.
    ///
    /// Writes are mirrored to every category registered as a rewrite of
    /// the key's category. Writing the same value again without a ttl
    /// stores the new timestamp but does not notify.
    pub fn tell(
        &self,
        key: &str,
        value: Option<Value>,
        time: f64,
        ttl: Option<f64>,
        origin: Option<u64>,
    ) {
        let key = key.to_lowercase();
        for key in self.rewritten_keys(&key) {
            let update = match &value {
                None => self.inner.entries.remove(&key).map(|_| CacheUpdate {
                    key,
                    value: None,
                    time,
                    ttl: None,
                    expired: false,
                    origin,
                }),
                Some(value) => {
                    let entry = CacheEntry {
                        value: value.clone(),
                        time,
                        ttl,
                        expired: false,
                    };
                    let previous = self.inner.entries.insert(key.clone(), entry);
                    let unchanged = previous.is_some_and(|prev| {
                        prev.value == *value && prev.ttl.is_none() && !prev.expired
                    });
                    (!unchanged).then(|| CacheUpdate {
                        key,
                        value: Some(value.clone()),
                        time,
                        ttl,
                        expired: false,
                        origin,
                    })
                }
            };
            if let Some(update) = update {
                self.notify(&update);
            }
        }
    }

    /// Mark a key (and its rewrites) expired, keeping the old value.
    pub fn expire(&self, key: &str, origin: Option<u64>) {
        let key = key.to_lowercase();
        for key in self.rewritten_keys(&key) {
            let update = self.inner.entries.get_mut(&key).and_then(|mut entry| {
                if entry.expired {
                    return None;
                }
                entry.expired = true;
                Some(CacheUpdate {
                    key: key.clone(),
                    value: Some(entry.value.clone()),
                    time: entry.time,
                    ttl: entry.ttl,
                    expired: true,
                    origin,
                })
            });
            if let Some(update) = update {
                self.notify(&update);
            }
        }
    }

    /// Register `new_prefix` as a mirror of `old_prefix`, replacing any
    /// previous target of `new_prefix`. An empty `old_prefix` only removes.
    pub fn set_rewrite(&self, new_prefix: &str, old_prefix: &str) {
        let new_prefix = new_prefix.to_lowercase();
        let old_prefix = old_prefix.to_lowercase();
        let mut rewrites = self
            .inner
            .rewrites
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = rewrites.inverse.remove(&new_prefix) {
            if let Some(targets) = rewrites.forward.get_mut(&current) {
                targets.remove(&new_prefix);
                if targets.is_empty() {
                    rewrites.forward.remove(&current);
                }
            }
        }
        if !old_prefix.is_empty() {
            rewrites
                .forward
                .entry(old_prefix.clone())
                .or_default()
                .insert(new_prefix.clone());
            rewrites.inverse.insert(new_prefix, old_prefix);
        }
    }

    /// Try to take the lock `key` for `client`. On denial returns the holder.
    pub fn lock(&self, key: &str, client: &str, time: f64, ttl: f64) -> Result<(), String> {
        let mut locks = self.inner.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = locks.get(key) {
            if entry.holder != client && entry.time + entry.ttl >= now() {
                tracing::debug!(key, holder = %entry.holder, "lock request denied");
                return Err(entry.holder.clone());
            }
        }
        locks.insert(
            key.to_owned(),
            LockEntry {
                holder: client.to_owned(),
                time,
                ttl,
            },
        );
        Ok(())
    }

    /// Release `key` if held by `client` (or not held at all).
    pub fn unlock(&self, key: &str, client: &str) -> Result<(), String> {
        let mut locks = self.inner.locks.lock().unwrap_or_else(PoisonError::into_inner);
        match locks.get(key) {
            Some(entry) if entry.holder != client => Err(entry.holder.clone()),
            _ => {
                locks.remove(key);
                Ok(())
            }
        }
    }

    /// Insert an entry read back from disk, without notifying anyone.
    pub(crate) fn restore(&self, key: &str, entry: CacheEntry) {
        self.inner.entries.insert(key.to_lowercase(), entry);
    }

    /// Receiver for every update, for async consumers such as the server.
    pub fn updates(&self) -> broadcast::Receiver<CacheUpdate> {
        self.inner.updates.subscribe()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    // ── Private helpers ──────────────────────────────────────────────

    /// The key itself plus its mirrors under rewritten categories.
    fn rewritten_keys(&self, key: &str) -> Vec<String> {
        let (category, sub) = split_key(key);
        let rewrites = self
            .inner
            .rewrites
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut keys = vec![key.to_owned()];
        if let Some(targets) = rewrites.forward.get(category) {
            keys.extend(targets.iter().map(|cat| format!("{cat}/{sub}")));
        }
        keys
    }

    fn notify(&self, update: &CacheUpdate) {
        let callbacks: Vec<Callback> = self
            .inner
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|sub| update.key.contains(&sub.pattern))
            .map(|sub| Arc::clone(&sub.callback))
            .collect();

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(update))).is_err() {
                tracing::error!(key = %update.key, "cache subscriber panicked");
            }
        }
        // No receivers is fine.
        let _ = self.inner.updates.send(update.clone());
    }
}

impl CacheBackend for CacheStore {
    fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    fn put_key(&self, key: &str, value: Value, time: f64, ttl: Option<f64>) {
        self.tell(key, Some(value), time, ttl, None);
    }

    fn entry(&self, key: &str) -> Option<CacheEntry> {
        let key = key.to_lowercase();
        let (category, sub) = split_key(&key);
        let redirected = self
            .inner
            .rewrites
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .inverse
            .get(category)
            .map(|old| format!("{old}/{sub}"));
        if let Some(old_key) = redirected {
            if let Some(entry) = self.inner.entries.get(&old_key) {
                return Some(entry.clone());
            }
        }
        self.inner.entries.get(&key).map(|entry| entry.clone())
    }

    fn invalidate_key(&self, key: &str) {
        self.expire(key, None);
    }

    fn subscribe(&self, pattern: &str, callback: Callback) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.inner
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                id,
                pattern: pattern.to_lowercase(),
                callback,
            });
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.inner
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|sub| sub.id != id);
    }

    fn add_rewrite(&self, new_prefix: &str, old_prefix: &str) {
        self.set_rewrite(new_prefix, old_prefix);
    }

    fn remove_rewrite(&self, new_prefix: &str) {
        self.set_rewrite(new_prefix, "");
    }

    fn query(&self, pattern: &str) -> Vec<(String, CacheEntry)> {
        let pattern = pattern.to_lowercase();
        let mut out: Vec<_> = self
            .inner
            .entries
            .iter()
            .filter(|item| item.key().contains(&pattern))
            .map(|item| (item.key().clone(), item.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use pretty_assertions::assert_eq;

    use super::*;

    fn counter(store: &CacheStore, pattern: &str) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        store.subscribe(
            pattern,
            Arc::new(move |_: &CacheUpdate| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        count
    }

    #[test]
    fn get_returns_default_for_unknown_keys() {
        let store = CacheStore::default();
        assert_eq!(store.get("newdev", "value", Value::None), Value::None);
        assert_eq!(store.get("newdev", "value", Value::Int(3)), Value::Int(3));
    }

    #[test]
    fn get_ignores_age() {
        let store = CacheStore::default();
        store.set("m", "value", Value::Float(1.5), 0.0, Some(1.0));
        assert_eq!(store.get("M", "Value", Value::None), Value::Float(1.5));
        assert!(store.fresh("m", "value", None).is_none());
    }

    #[test]
    fn repeated_value_without_ttl_does_not_notify() {
        let store = CacheStore::default();
        let count = counter(&store, "nicos/m/");
        store.set("m", "value", Value::Int(1), now(), None);
        store.set("m", "value", Value::Int(1), now(), None);
        store.set("m", "value", Value::Int(2), now(), None);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_subscriber_is_isolated() {
        let store = CacheStore::default();
        store.subscribe("nicos/", Arc::new(|_: &CacheUpdate| panic!("bad subscriber")));
        let count = counter(&store, "nicos/");
        store.set("m", "value", Value::Int(1), now(), None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("m", "value", Value::None), Value::Int(1));
    }

    #[test]
    fn invalidate_keeps_value_but_expires() {
        let store = CacheStore::default();
        store.set("m", "value", Value::Int(1), now(), None);
        let count = counter(&store, "nicos/m/value");
        store.invalidate("m", "value");
        store.invalidate("m", "value");
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(store.fresh("m", "value", Some(1e9)).is_none());
        assert_eq!(store.get("m", "value", Value::None), Value::Int(1));
    }

    #[test]
    fn rewrites_mirror_writes() {
        let store = CacheStore::default();
        store.set("t_ccr0", "value", Value::Float(10.0), now(), None);
        store.add_rewrite("nicos/t", "nicos/t_ccr0");
        // Older entries are found through the redirect.
        assert_eq!(store.get("t", "value", Value::None), Value::Float(10.0));

        let count = counter(&store, "nicos/t/");
        store.set("t_ccr0", "value", Value::Float(12.0), now(), None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.query("nicos/t/value")[0].1.value,
            Value::Float(12.0)
        );

        store.remove_rewrite("nicos/t");
        store.set("t_ccr0", "value", Value::Float(13.0), now(), None);
        assert_eq!(store.get("t", "value", Value::None), Value::Float(12.0));
    }

    #[test]
    fn deletion_notifies_with_none() {
        let store = CacheStore::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        store.subscribe(
            "x",
            Arc::new(move |u: &CacheUpdate| s.lock().unwrap().push(u.value.clone())),
        );
        store.tell("nicos/x/value", Some(Value::Int(1)), now(), None, None);
        store.tell("nicos/x/value", None, now(), None, None);
        assert_eq!(*seen.lock().unwrap(), vec![Some(Value::Int(1)), None]);
        assert!(store.is_empty());
    }

    #[test]
    fn locks_are_exclusive_until_expiry() {
        let store = CacheStore::default();
        assert!(store.lock("master", "a", now(), 1800.0).is_ok());
        assert_eq!(store.lock("master", "b", now(), 1800.0), Err("a".into()));
        assert_eq!(store.unlock("master", "b"), Err("a".into()));
        assert!(store.lock("master", "a", now(), 1800.0).is_ok());
        assert!(store.unlock("master", "a").is_ok());
        assert!(store.lock("master", "b", now(), 1800.0).is_ok());

        // An expired lock can be taken over.
        assert!(store.lock("other", "a", 0.0, 1.0).is_ok());
        assert!(store.lock("other", "b", now(), 1.0).is_ok());
    }
}
