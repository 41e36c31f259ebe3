//! The device abstraction.
//!
//! A [`Device`] wraps a [`Driver`] with everything that is the same for all
//! hardware: parameter storage, the cache staleness rule, target
//! validation against limits, session modes and I/O timeouts. Aliases are
//! devices too; every operation on an alias is forwarded to its current
//! target.

mod class;
mod driver;
mod format;

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use indexmap::IndexMap;
use nicos_proto::Value;
use serde::Serialize;
use strum::{Display, EnumString};
use tokio::sync::watch;

pub use class::{AttachSpec, Capabilities, DeviceClass, DeviceClassBuilder, DeviceKind, DeviceRegistry, DriverFactory};
pub use driver::{Driver, Movement};
pub use format::format_value;

use crate::cache::{CacheBackend, now};
use crate::devices::alias::AliasSlot;
use crate::error::NicosError;
use crate::params::{ParamStore, ParamType, limits_of};
use crate::status::{DeviceStatus, Status};

/// Bound on a single hardware transaction.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Status polling period of the default `wait`.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Session mode, shared by all devices of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Full control of the hardware.
    Master,
    /// Read-only: no moves and no parameter changes.
    Slave,
    /// No hardware access; moves only update a simulated value.
    Simulation,
    /// Like master, for service work.
    Maintenance,
}

pub(crate) enum Body {
    Driver(Box<dyn Driver>),
    Alias(AliasSlot),
}

/// A configured device instance.
pub struct Device {
    pub(crate) name: String,
    pub(crate) class: Arc<DeviceClass>,
    pub(crate) params: ParamStore,
    pub(crate) attached: IndexMap<String, Vec<Arc<Device>>>,
    pub(crate) cache: Option<Arc<dyn CacheBackend>>,
    pub(crate) mode: watch::Receiver<Mode>,
    pub(crate) sim_value: Mutex<Option<Value>>,
    pub(crate) io_timeout: Duration,
    pub(crate) body: Body,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("class", &self.class.name)
            .finish_non_exhaustive()
    }
}

impl Device {
    pub fn builder(name: impl Into<String>, class: Arc<DeviceClass>) -> DeviceBuilder {
        DeviceBuilder {
            name: name.into(),
            class,
            config: IndexMap::new(),
            attached: IndexMap::new(),
            cache: None,
            mode: None,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self) -> &Arc<DeviceClass> {
        &self.class
    }

    pub fn mode(&self) -> Mode {
        *self.mode.borrow()
    }

    pub fn cache(&self) -> Option<&Arc<dyn CacheBackend>> {
        self.cache.as_ref()
    }

    pub fn is_alias(&self) -> bool {
        matches!(self.body, Body::Alias(_))
    }

    /// Moveable, looking through aliases.
    pub fn is_moveable(&self) -> bool {
        match self.alias_target() {
            Ok(Some(target)) => target.is_moveable(),
            Ok(None) => self.class.caps.moveable,
            Err(_) => false,
        }
    }

    // ── Attached devices ─────────────────────────────────────────────

    /// The single device attached under `role`.
    pub fn attached(&self, role: &str) -> Result<&Arc<Device>, NicosError> {
        self.attached_opt(role).ok_or_else(|| {
            NicosError::config(format!("{}: no device attached as '{role}'", self.name))
        })
    }

    pub fn attached_opt(&self, role: &str) -> Option<&Arc<Device>> {
        self.attached.get(role).and_then(|devs| devs.first())
    }

    pub fn attached_all(&self, role: &str) -> &[Arc<Device>] {
        self.attached.get(role).map_or(&[], Vec::as_slice)
    }

    /// Every attached device, in role order.
    pub fn attached_devices(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.attached.values().flatten()
    }

    // ── Parameters (synchronous) ─────────────────────────────────────

    /// Stored parameter value. Parameters an alias does not declare
    /// itself are looked up on its target.
    pub fn get(&self, name: &str) -> Option<Value> {
        if !self.class.schema.contains(name) {
            if let Ok(Some(target)) = self.alias_target() {
                return target.get(name);
            }
        }
        self.params.get(name)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|v| v.as_f64())
    }

    pub fn get_str(&self, name: &str) -> String {
        self.get(name)
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default()
    }

    pub fn unit(&self) -> String {
        self.get_str("unit")
    }

    /// `None` means cached values never expire.
    pub fn maxage(&self) -> Option<f64> {
        self.get_f64("maxage")
    }

    /// `None` means the device is not polled.
    pub fn pollinterval(&self) -> Option<f64> {
        self.get_f64("pollinterval")
    }

    pub fn precision(&self) -> f64 {
        self.get_f64("precision").unwrap_or(0.0)
    }

    pub fn params(&self) -> Vec<(String, Value)> {
        self.params.snapshot()
    }

    /// Render a value with the device's `fmtstr`.
    pub fn format(&self, value: &Value) -> String {
        let fmtstr = self.get_str("fmtstr");
        if fmtstr.is_empty() {
            value.encode()
        } else {
            format_value(&fmtstr, value)
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Driver initialisation, then publish all parameters.
    pub async fn init(&self) -> Result<(), NicosError> {
        if let Body::Driver(driver) = &self.body {
            if self.mode() != Mode::Simulation {
                driver.init(self).await?;
            }
        }
        for (param, value) in self.params.snapshot() {
            self.publish(&param, value, None);
        }
        tracing::debug!(device = %self.name, class = %self.class.name, "device initialised");
        Ok(())
    }

    pub async fn shutdown(&self) {
        if let Body::Driver(driver) = &self.body {
            driver.shutdown(self).await;
        }
        tracing::debug!(device = %self.name, "device shut down");
    }

    // ── Reading ──────────────────────────────────────────────────────

    /// Current value.
    ///
    /// A cached value is used iff it is valid and at most `maxage` seconds
    /// old (`None`: the device's `maxage` parameter). `Some(0.0)` always
    /// reads the hardware. Fresh values are written back to the cache.
    pub async fn read(&self, maxage: Option<f64>) -> Result<Value, NicosError> {
        if let Some(target) = self.alias_target()? {
            return Box::pin(target.read(maxage)).await;
        }
        if self.mode() == Mode::Simulation {
            return Ok(self.simulated_value());
        }
        if let Some(value) = self.cached("value", maxage) {
            return Ok(value);
        }
        let driver = self.driver()?;
        let value = self.bounded("read", driver.read(self, maxage)).await?;
        self.publish("value", value.clone(), self.maxage());
        Ok(value)
    }

    /// Current status; driver errors become an `Error` status.
    pub async fn status(&self, maxage: Option<f64>) -> Result<DeviceStatus, NicosError> {
        if let Some(target) = self.alias_target()? {
            return Box::pin(target.status(maxage)).await;
        }
        if self.mode() == Mode::Simulation {
            return Ok(DeviceStatus::ok("simulated"));
        }
        if let Some(status) = self
            .cached("status", maxage)
            .and_then(|v| DeviceStatus::from_value(&v))
        {
            return Ok(status);
        }
        let driver = self.driver()?;
        let status = match self.bounded("status", driver.status(self, maxage)).await {
            Ok(status) => status,
            Err(e) => {
                tracing::debug!(device = %self.name, error = %e, "status read failed");
                DeviceStatus::error(e.to_string())
            }
        };
        self.publish("status", status.to_value(), self.maxage());
        Ok(status)
    }

    /// One poll cycle: driver hook, then status and value.
    pub async fn poll(&self, n: u64, maxage: Option<f64>) -> (DeviceStatus, Result<Value, NicosError>) {
        if let Ok(driver) = self.driver() {
            if let Err(e) = self.bounded("poll", driver.poll(self, n)).await {
                tracing::debug!(device = %self.name, error = %e, "poll hook failed");
            }
        }
        let status = match self.status(maxage).await {
            Ok(status) => status,
            Err(e) => DeviceStatus::error(e.to_string()),
        };
        (status, self.read(maxage).await)
    }

    // ── Moving ───────────────────────────────────────────────────────

    /// Validate `target` and start moving there.
    ///
    /// Every check (mode, type, limits, driver veto) happens before the
    /// hardware is touched.
    pub async fn start(&self, target: impl Into<Value>) -> Result<(), NicosError> {
        let target = target.into();
        if let Some(alias_target) = self.alias_target()? {
            return Box::pin(alias_target.start(target)).await;
        }
        let movement = self.movement()?;
        self.require_write_mode("move")?;

        let fixed = self.get_str("fixed");
        if !fixed.is_empty() {
            tracing::warn!(device = %self.name, reason = %fixed, "device is fixed, not moving");
            return Ok(());
        }

        let target = self.check_target(target).await?;

        self.update_param("target", target.clone());
        if self.mode() == Mode::Simulation {
            *self.sim_value.lock().unwrap_or_else(PoisonError::into_inner) = Some(target);
            return Ok(());
        }
        self.invalidate("value");
        self.invalidate("status");
        tracing::debug!(device = %self.name, target = %target, "starting");
        movement.start(self, &target).await
    }

    /// Run every check `start` does, without moving. Returns the target
    /// converted to the device's value type.
    pub async fn check_target(&self, target: Value) -> Result<Value, NicosError> {
        if let Ok(Some(alias_target)) = self.alias_target() {
            return Box::pin(alias_target.check_target(target)).await;
        }
        let movement = self.movement()?;
        let target = movement
            .value_type(self)
            .validate(target)
            .map_err(|m| NicosError::invalid(&self.name, m))?;
        if matches!(target, Value::Float(f) if !f.is_finite()) {
            return Err(NicosError::invalid(
                &self.name,
                format!("{target} is not a valid target"),
            ));
        }
        self.check_limits(&target)?;
        movement.is_allowed(self, &target).await.map_err(|m| {
            NicosError::limit(
                &self.name,
                format!("moving to {} is not allowed: {m}", self.format(&target)),
            )
        })?;
        Ok(target)
    }

    /// Wait for the current movement to finish and return the final value.
    ///
    /// With a `timeout` parameter, expiry runs the driver's timeout action
    /// and fails with a timeout error. An `Error` status fails the wait.
    pub async fn wait(&self) -> Result<Value, NicosError> {
        if let Some(target) = self.alias_target()? {
            return Box::pin(target.wait()).await;
        }
        if self.mode() == Mode::Simulation {
            return Ok(self.simulated_value());
        }
        let Ok(movement) = self.movement() else {
            return self.read(None).await;
        };
        match self.get_f64("timeout") {
            Some(secs) if self.class.caps.timeout => {
                let limit = Duration::from_secs_f64(secs.max(0.0));
                match tokio::time::timeout(limit, movement.wait(self)).await {
                    Ok(result) => result?,
                    Err(_) => {
                        tracing::warn!(device = %self.name, timeout = secs, "wait timed out");
                        if let Err(e) = movement.timeout_action(self).await {
                            tracing::error!(device = %self.name, error = %e, "timeout action failed");
                        }
                        return Err(NicosError::Timeout {
                            device: self.name.clone(),
                            seconds: secs,
                        });
                    }
                }
            }
            _ => movement.wait(self).await?,
        }
        self.read(Some(0.0)).await
    }

    /// Poll the status until the device is no longer busy.
    pub async fn wait_idle(&self) -> Result<(), NicosError> {
        loop {
            let status = self.status(Some(0.0)).await?;
            match status.status {
                Status::Busy => tokio::time::sleep(WAIT_POLL_INTERVAL).await,
                Status::Error => {
                    return Err(NicosError::Move {
                        device: self.name.clone(),
                        message: status.message,
                    });
                }
                _ => return Ok(()),
            }
        }
    }

    /// Move and wait.
    pub async fn maw(&self, target: impl Into<Value>) -> Result<Value, NicosError> {
        self.start(target).await?;
        self.wait().await
    }

    /// Stop any movement. A no-op for devices that cannot move.
    pub async fn stop(&self) -> Result<(), NicosError> {
        if let Some(target) = self.alias_target()? {
            return Box::pin(target.stop()).await;
        }
        let Ok(movement) = self.movement() else {
            return Ok(());
        };
        if self.mode() == Mode::Slave {
            return Err(self.mode_error("stop"));
        }
        if self.mode() == Mode::Simulation {
            return Ok(());
        }
        let result = self.bounded("stop", movement.stop(self)).await;
        self.invalidate("value");
        self.invalidate("status");
        result
    }

    /// Refuse moves until `release`.
    pub fn fix(&self, reason: &str) -> Result<(), NicosError> {
        self.fixed_param()?;
        let reason = if reason.is_empty() { "fixed" } else { reason };
        self.update_param("fixed", Value::from(reason));
        tracing::info!(device = %self.name, reason, "device fixed");
        Ok(())
    }

    pub fn release(&self) -> Result<(), NicosError> {
        self.fixed_param()?;
        self.update_param("fixed", Value::from(""));
        tracing::info!(device = %self.name, "device released");
        Ok(())
    }

    /// Reset the hardware and return the fresh status.
    pub async fn reset(&self) -> Result<DeviceStatus, NicosError> {
        if let Some(target) = self.alias_target()? {
            return Box::pin(target.reset()).await;
        }
        self.require_write_mode("reset")?;
        if self.mode() != Mode::Simulation {
            let driver = self.driver()?;
            self.bounded("reset", driver.reset(self)).await?;
        }
        self.invalidate("status");
        self.status(Some(0.0)).await
    }

    // ── Parameters (asynchronous) ────────────────────────────────────

    /// Parameter value; volatile parameters are read from the hardware.
    pub async fn param(&self, name: &str) -> Result<Value, NicosError> {
        let Some(info) = self.class.schema.get(name) else {
            return match self.alias_target()? {
                Some(target) => Box::pin(target.param(name)).await,
                None => Err(self.no_such_param(name)),
            };
        };
        if info.volatile && self.mode() != Mode::Simulation {
            let driver = self.driver()?;
            if let Some(value) = self.bounded("read_param", driver.read_param(self, name)).await? {
                self.update_param(name, value.clone());
                return Ok(value);
            }
        }
        self.params
            .get(name)
            .ok_or_else(|| self.no_such_param(name))
    }

    /// Change a settable parameter.
    pub async fn set_param(&self, name: &str, value: impl Into<Value>) -> Result<(), NicosError> {
        let value = value.into();
        let Some(info) = self.class.schema.get(name) else {
            return match self.alias_target()? {
                Some(target) => Box::pin(target.set_param(name, value)).await,
                None => Err(self.no_such_param(name)),
            };
        };
        if !info.settable {
            return Err(NicosError::config(format!(
                "{}: parameter {name} is not settable",
                self.name
            )));
        }
        self.require_write_mode("change parameters")?;
        let value = info
            .ty
            .validate(value)
            .map_err(|m| NicosError::invalid(&self.name, format!("parameter {name}: {m}")))?;
        if name.eq_ignore_ascii_case("userlimits") {
            self.check_userlimits(&value)?;
        }
        if self.mode() != Mode::Simulation {
            if let Body::Driver(driver) = &self.body {
                self.bounded("write_param", driver.write_param(self, name, &value))
                    .await?;
            }
        }
        tracing::info!(device = %self.name, param = name, value = %value, "parameter changed");
        self.update_param(name, value);
        Ok(())
    }

    /// Store a parameter without checks and publish it to the cache.
    pub fn update_param(&self, name: &str, value: Value) {
        self.params.set(name, value.clone());
        self.publish(name, value, None);
    }

    // ── Private helpers ──────────────────────────────────────────────

    /// The current alias target; `None` for ordinary devices.
    pub(crate) fn alias_target(&self) -> Result<Option<Arc<Device>>, NicosError> {
        match &self.body {
            Body::Driver(_) => Ok(None),
            Body::Alias(slot) => slot.load().map(Some).ok_or_else(|| {
                NicosError::config(format!("alias {} does not point to any device", self.name))
            }),
        }
    }

    fn driver(&self) -> Result<&dyn Driver, NicosError> {
        match &self.body {
            Body::Driver(driver) => Ok(driver.as_ref()),
            Body::Alias(_) => Err(NicosError::usage(format!("{} is an alias", self.name))),
        }
    }

    fn movement(&self) -> Result<&dyn Movement, NicosError> {
        self.driver()?
            .movement()
            .ok_or_else(|| NicosError::usage(format!("{} is not moveable", self.name)))
    }

    fn fixed_param(&self) -> Result<(), NicosError> {
        if self.class.schema.contains("fixed") {
            Ok(())
        } else {
            Err(NicosError::usage(format!("{} is not moveable", self.name)))
        }
    }

    fn require_write_mode(&self, action: &str) -> Result<(), NicosError> {
        if self.mode() == Mode::Slave {
            Err(self.mode_error(action))
        } else {
            Ok(())
        }
    }

    fn mode_error(&self, action: &str) -> NicosError {
        NicosError::Mode {
            device: self.name.clone(),
            message: format!("cannot {action} in slave mode"),
        }
    }

    fn no_such_param(&self, name: &str) -> NicosError {
        NicosError::NotFound {
            kind: "parameter",
            name: format!("{}.{name}", self.name),
        }
    }

    fn check_limits(&self, target: &Value) -> Result<(), NicosError> {
        if !self.class.caps.limits {
            return Ok(());
        }
        let Some(pos) = target.as_f64() else {
            return Ok(());
        };
        for (param, kind) in [("abslimits", "absolute"), ("userlimits", "user")] {
            let Some((lo, hi)) = self.get(param).as_ref().and_then(limits_of) else {
                continue;
            };
            if (lo..=hi).contains(&pos) {
                continue;
            }
            let reason = if pos < lo {
                format!("below {kind} minimum {}", self.format(&Value::Float(lo)))
            } else if pos > hi {
                format!("above {kind} maximum {}", self.format(&Value::Float(hi)))
            } else {
                format!("not within {kind} limits")
            };
            return Err(NicosError::limit(
                &self.name,
                format!("moving to {} is not allowed: {reason}", self.format(target)),
            ));
        }
        Ok(())
    }

    pub(crate) fn check_userlimits(&self, userlimits: &Value) -> Result<(), NicosError> {
        let abs = self.params.get("abslimits");
        match (abs.as_ref().and_then(limits_of), limits_of(userlimits)) {
            (Some((alo, ahi)), Some((ulo, uhi))) if ulo < alo || uhi > ahi => {
                Err(NicosError::config(format!(
                    "{}: user limits ({ulo}, {uhi}) are outside the absolute limits ({alo}, {ahi})",
                    self.name
                )))
            }
            _ => Ok(()),
        }
    }

    /// A cached value satisfying the staleness rule, if the cache is usable.
    fn cached(&self, param: &str, maxage: Option<f64>) -> Option<Value> {
        let cache = self.cache.as_ref()?;
        if !cache.is_connected() {
            return None;
        }
        let limit = maxage.or_else(|| self.maxage());
        if limit.is_some_and(|age| age <= 0.0) {
            return None;
        }
        cache.fresh(&self.name, param, limit).map(|entry| entry.value)
    }

    fn publish(&self, param: &str, value: Value, ttl: Option<f64>) {
        if self.mode() == Mode::Simulation {
            return;
        }
        if let Some(cache) = &self.cache {
            cache.set(&self.name, param, value, now(), ttl);
        }
    }

    fn invalidate(&self, param: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate(&self.name, param);
        }
    }

    fn simulated_value(&self) -> Value {
        if let Some(value) = self
            .sim_value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return value;
        }
        self.cache
            .as_ref()
            .and_then(|c| c.entry(&c.key(&self.name, "value")))
            .map_or_else(
                || {
                    self.movement()
                        .map_or(ParamType::Float, |m| m.value_type(self))
                        .default_value()
                },
                |entry| entry.value,
            )
    }

    async fn bounded<T>(
        &self,
        action: &str,
        fut: impl Future<Output = Result<T, NicosError>>,
    ) -> Result<T, NicosError> {
        tokio::time::timeout(self.io_timeout, fut).await.map_err(|_| {
            NicosError::comm(format!(
                "{}: no response to {action} within {:.1}s",
                self.name,
                self.io_timeout.as_secs_f64()
            ))
        })?
    }
}

// ── Builder ──────────────────────────────────────────────────────────

/// Creates a device from its class and configuration.
pub struct DeviceBuilder {
    name: String,
    class: Arc<DeviceClass>,
    config: IndexMap<String, Value>,
    attached: IndexMap<String, Vec<Arc<Device>>>,
    cache: Option<Arc<dyn CacheBackend>>,
    mode: Option<watch::Receiver<Mode>>,
    io_timeout: Duration,
}

impl DeviceBuilder {
    pub fn param(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.config.insert(name.to_lowercase(), value.into());
        self
    }

    pub fn params(mut self, params: impl IntoIterator<Item = (String, Value)>) -> Self {
        self.config
            .extend(params.into_iter().map(|(k, v)| (k.to_lowercase(), v)));
        self
    }

    pub fn attach(mut self, role: &str, device: Arc<Device>) -> Self {
        self.attached
            .entry(role.to_lowercase())
            .or_default()
            .push(device);
        self
    }

    pub fn attach_all(mut self, role: &str, devices: Vec<Arc<Device>>) -> Self {
        self.attached
            .entry(role.to_lowercase())
            .or_default()
            .extend(devices);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn mode(mut self, mode: watch::Receiver<Mode>) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Validate the configuration and create the (uninitialised) device.
    pub fn build(self) -> Result<Arc<Device>, NicosError> {
        let Self {
            name,
            class,
            config,
            attached,
            cache,
            mode,
            io_timeout,
        } = self;
        let mode = mode.unwrap_or_else(|| watch::channel(Mode::Master).1);
        let cfg_error = |msg: String| NicosError::config(format!("{name}: {msg}"));

        if let Some(key) = config.keys().find(|k| !class.schema.contains(k)) {
            return Err(cfg_error(format!(
                "'{key}' is not a parameter of class {}",
                class.name
            )));
        }
        if let Some(role) = attached.keys().find(|r| class.attachment(r).is_none()) {
            return Err(cfg_error(format!(
                "'{role}' is not an attachment of class {}",
                class.name
            )));
        }
        for spec in &class.attachments {
            let count = attached.get(&spec.role).map_or(0, Vec::len);
            if count == 0 && !spec.optional {
                return Err(cfg_error(format!("attached device '{}' missing", spec.role)));
            }
            if count > 1 && !spec.multiple {
                return Err(cfg_error(format!(
                    "only one device can be attached as '{}'",
                    spec.role
                )));
            }
        }

        let params = ParamStore::default();
        let use_cached = *mode.borrow() == Mode::Master;
        for (pname, info) in class.schema.iter() {
            let cached = cache
                .as_ref()
                .filter(|_| use_cached && info.settable)
                .and_then(|c| c.entry(&c.key(&name, pname)))
                .and_then(|entry| info.ty.validate(entry.value).ok())
                .filter(|v| !v.is_none());
            let value = if let Some(value) = config.get(pname) {
                info.ty
                    .validate(value.clone())
                    .map_err(|m| cfg_error(format!("invalid value for parameter {pname}: {m}")))?
            } else if let Some(value) = cached {
                value
            } else if info.mandatory {
                return Err(cfg_error(format!("missing mandatory parameter '{pname}'")));
            } else if pname == "userlimits" {
                params.get("abslimits").unwrap_or_else(|| info.default_value())
            } else {
                info.default_value()
            };
            params.set(pname, value);
        }

        let body = match &class.kind {
            DeviceKind::Driver(factory) => Body::Driver(factory()),
            DeviceKind::Alias => Body::Alias(AliasSlot::default()),
        };
        let device = Device {
            name,
            class,
            params,
            attached,
            cache,
            mode,
            sim_value: Mutex::new(None),
            io_timeout,
            body,
        };
        if let Some(userlimits) = device.params.get("userlimits") {
            device.check_userlimits(&userlimits)?;
        }
        Ok(Arc::new(device))
    }
}
