//! Periodic polling of device values and status.
//!
//! Every polled device gets its own task, so a hung hardware transaction
//! stalls only that device. A worker sleeps until the next poll is due
//! (`pollinterval`) or the cached value is about to expire (`maxage`),
//! whichever comes first. Cache updates wake it early: when the device or
//! one of its attached devices gets a new target or goes busy, the worker
//! switches to a short interval until the device is idle again.
//!
//! Failed polls are retried forever with [`BackoffPolicy`] delays.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use nicos_proto::Value;
use serde::Serialize;
use strum::Display;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheBackend, CacheUpdate, SubscriptionId};
use crate::device::Device;
use crate::retry::BackoffPolicy;
use crate::status::{DeviceStatus, Status};

/// Poll this long before a cached value would expire.
pub const POLL_MIN_VALID_TIME: f64 = 0.15;
/// Poll interval while the device (or an attached one) is busy.
pub const POLL_BUSY_INTERVAL: f64 = 0.5;
/// Minimum time between two polls of one device.
pub const POLL_MIN_WAIT: f64 = 0.1;
/// Upper bound on a wait when the device is not polled periodically.
const IDLE_WAIT: f64 = 3600.0;

// ── Observable state ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PollState {
    /// Waiting for the next poll.
    Idle,
    Polling,
    /// Waiting after a failed poll.
    Backoff,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollStatus {
    pub state: PollState,
    /// Completed polls, successful or not.
    pub polls: u64,
    /// Consecutive failed polls.
    pub failures: u32,
    pub last_error: Option<String>,
}

impl Default for PollStatus {
    fn default() -> Self {
        Self {
            state: PollState::Idle,
            polls: 0,
            failures: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Devices never polled (case-insensitive).
    pub blacklist: Vec<String>,
    /// Bound on one poll (hook, status and value together).
    pub poll_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            blacklist: Vec::new(),
            poll_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::poller(),
        }
    }
}

// ── Wake-up events ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    /// The device got a new target.
    Target,
    /// The device went busy.
    Busy,
    /// The device is no longer busy.
    Normal,
    AttachedValue,
    AttachedTarget,
    AttachedBusy,
    AttachedNormal,
    /// `pollinterval` or `maxage` changed.
    Param,
}

/// Which change of a watched key turns into which event.
#[derive(Clone, Copy)]
enum Watch {
    Value(Event),
    Status { busy: Event, normal: Event },
    Any(Event),
}

/// Subscribe to the keys that should wake the worker of `dev`.
fn watch_device(
    cache: &Arc<dyn CacheBackend>,
    dev: &Device,
    events: &mpsc::UnboundedSender<Event>,
) -> Vec<SubscriptionId> {
    let mut keys = vec![
        (dev.name().to_owned(), "target", Watch::Value(Event::Target)),
        (
            dev.name().to_owned(),
            "status",
            Watch::Status {
                busy: Event::Busy,
                normal: Event::Normal,
            },
        ),
        (dev.name().to_owned(), "maxage", Watch::Any(Event::Param)),
        (dev.name().to_owned(), "pollinterval", Watch::Any(Event::Param)),
    ];
    for adev in dev.attached_devices() {
        let name = adev.name().to_owned();
        keys.push((name.clone(), "value", Watch::Value(Event::AttachedValue)));
        keys.push((name.clone(), "target", Watch::Value(Event::AttachedTarget)));
        keys.push((
            name,
            "status",
            Watch::Status {
                busy: Event::AttachedBusy,
                normal: Event::AttachedNormal,
            },
        ));
    }

    keys.into_iter()
        .map(|(device, param, watch)| {
            let key = cache.key(&device, param);
            let events = events.clone();
            let last: Mutex<Option<Value>> = Mutex::new(None);
            let callback_key = key.clone();
            cache.subscribe(
                &key,
                Arc::new(move |update: &CacheUpdate| {
                    if update.key != callback_key {
                        return;
                    }
                    let Some(value) = update.value.clone() else {
                        return;
                    };
                    let mut last = last.lock().unwrap_or_else(PoisonError::into_inner);
                    let event = match watch {
                        Watch::Any(event) => Some(event),
                        Watch::Value(event) => {
                            (last.as_ref() != Some(&value) && !value.is_none()).then_some(event)
                        }
                        Watch::Status { busy, normal } => {
                            let code = DeviceStatus::from_value(&value).map(|s| s.status);
                            let old = last.as_ref().and_then(DeviceStatus::from_value).map(|s| s.status);
                            match code {
                                Some(code) if Some(code) != old => {
                                    Some(if code == Status::Busy { busy } else { normal })
                                }
                                _ => None,
                            }
                        }
                    };
                    *last = Some(value);
                    if let Some(event) = event {
                        let _ = events.send(event);
                    }
                }),
            )
        })
        .collect()
}

// ── Worker ───────────────────────────────────────────────────────────

/// Poll timing of one worker, in seconds.
#[derive(Debug, Clone, Copy)]
struct Timing {
    /// `None`: poll only when woken.
    interval: Option<f64>,
    /// Age limit passed to `Device::poll`.
    maxage: Option<f64>,
}

impl Timing {
    fn regular(dev: &Device) -> Self {
        let interval = dev.pollinterval();
        Self {
            interval,
            maxage: interval.map(|i| (i - POLL_MIN_VALID_TIME).max(0.0)),
        }
    }

    fn busy() -> Self {
        Self {
            interval: Some(POLL_BUSY_INTERVAL),
            maxage: Some(POLL_BUSY_INTERVAL / 2.0),
        }
    }
}

struct Worker {
    device: Arc<Device>,
    events: mpsc::UnboundedReceiver<Event>,
    status: watch::Sender<PollStatus>,
    config: Arc<PollerConfig>,
    cancel: CancellationToken,
}

impl Worker {
    /// How long to wait before the next poll.
    fn max_wait(&self, timing: Timing, last_poll: Option<Instant>) -> Duration {
        let Some(last) = last_poll else {
            return Duration::ZERO;
        };
        let elapsed = last.elapsed().as_secs_f64();
        let next_poll = timing.interval.unwrap_or(IDLE_WAIT);
        let times_out = self
            .device
            .maxage()
            .map_or(f64::INFINITY, |age| age - POLL_MIN_VALID_TIME);
        let wait = next_poll.min(times_out) - elapsed;
        if wait > 0.0 {
            Duration::from_secs_f64(wait)
        } else {
            Duration::ZERO
        }
    }

    /// Sleep unless cancelled; `false` means quit.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(duration) => true,
        }
    }

    async fn run(mut self) {
        let name = self.device.name().to_owned();
        tracing::info!(device = %name, "starting polling loop");
        let mut timing = Timing::regular(&self.device);
        let mut last_poll: Option<Instant> = None;
        let mut n: u64 = 0;
        // Without a cache subscription the sender side is gone at once.
        let mut events_open = true;

        loop {
            let wait = self.max_wait(timing, last_poll);
            if !wait.is_zero() {
                let event = tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => break,
                    event = self.events.recv(), if events_open => {
                        if event.is_none() {
                            tracing::debug!(device = %name, "no more cache events, polling on timer only");
                            events_open = false;
                            continue;
                        }
                        event
                    }
                    () = tokio::time::sleep(wait) => None,
                };
                if let Some(event) = event {
                    tracing::trace!(device = %name, ?event, "woken by cache event");
                    match event {
                        Event::AttachedBusy => timing = Timing::busy(),
                        Event::AttachedNormal => {}
                        Event::Target | Event::Busy | Event::AttachedTarget | Event::AttachedValue => {
                            timing = Timing::busy();
                            continue;
                        }
                        Event::Normal => continue,
                        Event::Param => {
                            timing = Timing::regular(&self.device);
                            continue;
                        }
                    }
                }
            }

            if let Some(last) = last_poll {
                let since = last.elapsed().as_secs_f64();
                if since < POLL_MIN_WAIT {
                    tracing::trace!(device = %name, "rate-limiting poll");
                    if !self.sleep(Duration::from_secs_f64(POLL_MIN_WAIT - since)).await {
                        break;
                    }
                }
            }

            if self.device.pollinterval().is_some() {
                n += 1;
                if !self.poll_once(n, &mut timing).await {
                    break;
                }
            }
            last_poll = Some(Instant::now());
        }
        tracing::info!(device = %name, "polling loop stopped");
    }

    /// One poll plus its bookkeeping; `false` means quit.
    async fn poll_once(&self, n: u64, timing: &mut Timing) -> bool {
        let name = self.device.name();
        self.status.send_modify(|s| s.state = PollState::Polling);
        let outcome = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return false,
            outcome = tokio::time::timeout(self.config.poll_timeout, self.device.poll(n, timing.maxage)) => outcome,
        };

        let error = match outcome {
            Ok((status, Ok(value))) => {
                tracing::debug!(device = %name, status = %status.status, %value, "polled");
                if !status.is_busy() {
                    *timing = Timing::regular(&self.device);
                }
                None
            }
            Ok((_, Err(e))) => Some(e.to_string()),
            Err(_) => Some(format!(
                "poll did not finish within {:.1}s",
                self.config.poll_timeout.as_secs_f64()
            )),
        };

        let Some(error) = error else {
            let recovered = self.status.borrow().failures > 0;
            self.status.send_modify(|s| {
                s.state = PollState::Idle;
                s.polls += 1;
                s.failures = 0;
                s.last_error = None;
            });
            if recovered || n == 1 {
                tracing::info!(device = %name, "polled successfully");
            }
            return true;
        };

        let mut failures = 0;
        self.status.send_modify(|s| {
            s.state = PollState::Backoff;
            s.polls += 1;
            s.failures = s.failures.saturating_add(1);
            s.last_error = Some(error.clone());
            failures = s.failures;
        });
        let delay = self.config.backoff.delay(failures);
        if failures <= 5 || failures % 10 == 0 {
            tracing::warn!(device = %name, %error, failures, retry_in = ?delay, "poll failed");
        } else {
            tracing::debug!(device = %name, %error, failures, retry_in = ?delay, "poll failed");
        }
        let keep_going = self.sleep(delay).await;
        self.status.send_modify(|s| s.state = PollState::Idle);
        keep_going
    }
}

// ── Poller ───────────────────────────────────────────────────────────

/// Runs one polling task per device until [`Poller::quit`].
pub struct Poller {
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    states: Vec<(String, watch::Receiver<PollStatus>)>,
    cache: Option<Arc<dyn CacheBackend>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("devices", &self.states.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Poller {
    /// Start polling `devices`. Aliases and blacklisted devices are skipped.
    pub fn start(
        devices: impl IntoIterator<Item = Arc<Device>>,
        cache: Option<Arc<dyn CacheBackend>>,
        config: PollerConfig,
    ) -> Self {
        let config = Arc::new(config);
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        let mut states = Vec::new();
        let mut subscriptions = Vec::new();

        for device in devices {
            if device.is_alias() {
                tracing::info!(device = %device.name(), "alias, not polling");
                continue;
            }
            if config
                .blacklist
                .iter()
                .any(|b| b.eq_ignore_ascii_case(device.name()))
            {
                tracing::info!(device = %device.name(), "blacklisted, not polling");
                continue;
            }

            let (event_tx, event_rx) = mpsc::unbounded_channel();
            if let Some(cache) = &cache {
                subscriptions.extend(watch_device(cache, &device, &event_tx));
            }
            let (status_tx, status_rx) = watch::channel(PollStatus::default());
            states.push((device.name().to_owned(), status_rx));

            let worker = Worker {
                device,
                events: event_rx,
                status: status_tx,
                config: Arc::clone(&config),
                cancel: cancel.child_token(),
            };
            tasks.push(tokio::spawn(worker.run()));
        }
        tracing::info!(devices = states.len(), "poller started");

        Self {
            cancel,
            tasks: Mutex::new(tasks),
            states,
            cache,
            subscriptions: Mutex::new(subscriptions),
        }
    }

    /// Names of the polled devices.
    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.states.iter().map(|(name, _)| name.as_str())
    }

    pub fn state(&self, device: &str) -> Option<PollStatus> {
        self.watch(device).map(|rx| rx.borrow().clone())
    }

    /// Current state of every polled device.
    pub fn states(&self) -> Vec<(String, PollStatus)> {
        self.states
            .iter()
            .map(|(name, rx)| (name.clone(), rx.borrow().clone()))
            .collect()
    }

    /// Receiver for state changes of one device.
    pub fn watch(&self, device: &str) -> Option<watch::Receiver<PollStatus>> {
        self.states
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(device))
            .map(|(_, rx)| rx.clone())
    }

    fn unsubscribe_all(&self) {
        let ids = std::mem::take(
            &mut *self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if let Some(cache) = &self.cache {
            for id in ids {
                cache.unsubscribe(id);
            }
        }
    }

    /// Stop all workers and wait for them to finish.
    pub async fn quit(&self) {
        self.cancel.cancel();
        self.unsubscribe_all();
        let handles: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("poller stopped");
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.unsubscribe_all();
    }
}
