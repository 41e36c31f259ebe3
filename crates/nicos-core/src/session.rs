//! The session: builds the device graph from setups and owns its lifecycle.
//!
//! A [`Session`] is an explicit context object. It knows every setup of the
//! instrument (the catalog), loads a selection of them, creates the
//! configured devices (attached devices first) and applies the alias
//! preferences of the loaded setups. Consumers such as the poller or the
//! CLI look devices up through it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use nicos_proto::Value;
use serde::Serialize;
use tokio::sync::watch;

use crate::cache::{CacheBackend, now};
use crate::device::{DEFAULT_IO_TIMEOUT, Device, DeviceRegistry, Mode};
use crate::error::NicosError;
use crate::setup::{DeviceConfig, SetupGroup, SetupInfo, toml_to_value};

/// Cache "device" under which session-wide keys are stored.
const SESSION_KEY: &str = "session";

/// Outcome of [`Session::load_setup`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadReport {
    /// Setups loaded by this call, includes first.
    pub loaded: Vec<String>,
    pub created: Vec<String>,
    /// Devices that failed to create, with the reason.
    pub failed: Vec<(String, String)>,
    /// `(alias, target)` pairs set by this call.
    pub aliases: Vec<(String, String)>,
    pub startupcode: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct SessionState {
    loaded: Vec<String>,
    explicit: Vec<String>,
    excluded: HashSet<String>,
    /// Lower-cased name -> device, in creation order.
    devices: IndexMap<String, Arc<Device>>,
    /// Lower-cased name -> (configured name, config).
    configured: IndexMap<String, (String, DeviceConfig)>,
    /// Alias -> candidate targets, highest priority first.
    alias_config: IndexMap<String, Vec<(String, i64)>>,
    sysconfig: IndexMap<String, toml::Value>,
    startupcode: Vec<String>,
}

pub struct Session {
    catalog: IndexMap<String, SetupInfo>,
    registry: DeviceRegistry,
    cache: Option<Arc<dyn CacheBackend>>,
    mode: watch::Sender<Mode>,
    io_timeout: Duration,
    state: Mutex<SessionState>,
    /// Serialises loading, creation and unloading.
    creation: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("mode", &*self.mode.borrow())
            .field("setups", &self.catalog.len())
            .field("loaded", &self.state().loaded)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(registry: DeviceRegistry, setups: impl IntoIterator<Item = SetupInfo>) -> Self {
        Self {
            catalog: setups.into_iter().map(|s| (s.name.clone(), s)).collect(),
            registry,
            cache: None,
            mode: watch::Sender::new(Mode::Master),
            io_timeout: DEFAULT_IO_TIMEOUT,
            state: Mutex::new(SessionState::default()),
            creation: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_mode(self, mode: Mode) -> Self {
        self.mode.send_replace(mode);
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn cache(&self) -> Option<&Arc<dyn CacheBackend>> {
        self.cache.as_ref()
    }

    pub fn mode(&self) -> Mode {
        *self.mode.borrow()
    }

    /// Every setup known to the session.
    pub fn setups(&self) -> impl Iterator<Item = &SetupInfo> {
        self.catalog.values()
    }

    pub fn setup(&self, name: &str) -> Option<&SetupInfo> {
        self.catalog.get(name)
    }

    pub fn loaded_setups(&self) -> Vec<String> {
        self.state().loaded.clone()
    }

    /// Setups requested by name, as opposed to pulled in as includes.
    pub fn explicit_setups(&self) -> Vec<String> {
        self.state().explicit.clone()
    }

    pub fn sysconfig(&self, key: &str) -> Option<toml::Value> {
        self.state().sysconfig.get(key).cloned()
    }

    pub fn startupcode(&self) -> Vec<String> {
        self.state().startupcode.clone()
    }

    /// Names of all devices configured by the loaded setups.
    pub fn configured_devices(&self) -> Vec<String> {
        self.state()
            .configured
            .values()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Created devices, in creation order.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.state().devices.values().cloned().collect()
    }

    /// Case-insensitive lookup of a created device.
    pub fn get_device(&self, name: &str) -> Result<Arc<Device>, NicosError> {
        self.state()
            .devices
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| NicosError::device_not_found(name))
    }

    /// Switch the session mode; every device sees the change immediately.
    pub fn set_mode(&self, mode: Mode) {
        let old = self.mode.send_replace(mode);
        if old == mode {
            return;
        }
        tracing::info!(from = %old, to = %mode, "session mode changed");
        if mode == Mode::Master {
            self.publish_setups();
        }
    }

    // ── Loading ──────────────────────────────────────────────────────

    /// Load setups (and their includes) and create their devices.
    ///
    /// Fails without changing anything if a setup is unknown, excluded or
    /// not loadable. Device creation failures are collected in the report
    /// instead.
    pub async fn load_setup(&self, names: &[&str]) -> Result<LoadReport, NicosError> {
        let _creation = self.creation.lock().await;

        if let Some(missing) = names.iter().find(|n| !self.catalog.contains_key(**n)) {
            let known: Vec<&str> = self.catalog.keys().map(String::as_str).collect();
            return Err(NicosError::config(format!(
                "setup {missing} does not exist (known setups: {})",
                known.join(", ")
            )));
        }

        let mut report = LoadReport::default();
        let prev_aliases = {
            let mut next = self.state().clone();
            let prev_aliases = next.alias_config.clone();
            for name in names {
                tracing::info!(setup = %name, description = %self.catalog[*name].description, "loading setup");
                self.inner_load(name, &mut next, &mut report)?;
            }
            for targets in next.alias_config.values_mut() {
                targets.sort_by_key(|(_, prio)| std::cmp::Reverse(*prio));
            }
            for name in names {
                if !self.catalog[*name].is_dynamic() && !next.explicit.iter().any(|e| e == name) {
                    next.explicit.push((*name).to_owned());
                }
            }
            *self.state() = next;
            prev_aliases
        };

        let existing: HashSet<String> = self.state().devices.keys().cloned().collect();
        let mut pending: Vec<(String, String)> = self
            .state()
            .configured
            .iter()
            .map(|(key, (name, _))| (key.clone(), name.clone()))
            .collect();
        pending.sort();
        for (key, name) in pending {
            if self.state().devices.contains_key(&key) {
                continue;
            }
            if let Err(e) = self.create_locked(&name, &mut Vec::new()).await {
                tracing::error!(device = %name, error = %e, "device failed to create");
                report.failed.push((name, e.to_string()));
            }
        }
        report.created = self
            .state()
            .devices
            .iter()
            .filter(|(key, _)| !existing.contains(*key))
            .map(|(_, dev)| dev.name().to_owned())
            .collect();
        if !report.failed.is_empty() {
            let names: Vec<&str> = report.failed.iter().map(|(n, _)| n.as_str()).collect();
            tracing::error!(devices = %names.join(", "), "some devices could not be created");
        }

        report.aliases = self.apply_alias_config(&prev_aliases);

        if self.mode() == Mode::Master {
            self.publish_setups();
        }
        tracing::info!(setups = %names.join(", "), "setups loaded");
        Ok(report)
    }

    fn inner_load(
        &self,
        name: &str,
        next: &mut SessionState,
        report: &mut LoadReport,
    ) -> Result<(), NicosError> {
        if next.loaded.iter().any(|l| l == name) {
            return Ok(());
        }
        let info = self
            .catalog
            .get(name)
            .ok_or_else(|| NicosError::config(format!("included setup {name} does not exist")))?;
        if next.excluded.contains(name) {
            return Err(NicosError::config(format!(
                "cannot load setup {name}, it is excluded by one of the current setups"
            )));
        }
        match info.group {
            SetupGroup::Special => {
                return Err(NicosError::config(format!("cannot load special setup {name}")));
            }
            SetupGroup::Configdata => {
                return Err(NicosError::config(format!("cannot load data-only setup {name}")));
            }
            _ => {}
        }
        if let Some(loaded) = info.excludes.iter().find(|e| next.loaded.contains(*e)) {
            return Err(NicosError::config(format!(
                "cannot load setup {name} when setup {loaded} is already loaded"
            )));
        }

        next.loaded.push(name.to_owned());
        next.excluded.extend(info.excludes.iter().cloned());
        for include in &info.includes {
            tracing::debug!(setup = %include, parent = %name, "loading included setup");
            self.inner_load(include, next, report)?;
        }

        for (devname, config) in &info.devices {
            next.configured
                .insert(devname.to_lowercase(), (devname.clone(), config.clone()));
        }
        for (key, value) in &info.sysconfig {
            next.sysconfig.insert(key.clone(), value.clone());
        }
        if !info.startupcode.trim().is_empty() {
            next.startupcode.push(info.startupcode.clone());
            report.startupcode.push(info.startupcode.clone());
        }
        for (alias, targets) in &info.alias_config {
            let entry = next.alias_config.entry(alias.clone()).or_default();
            entry.extend(targets.iter().map(|(t, p)| (t.clone(), *p)));
        }
        report.loaded.push(name.to_owned());
        Ok(())
    }

    /// Point each configured alias at its highest-priority existing target.
    fn apply_alias_config(&self, prev: &IndexMap<String, Vec<(String, i64)>>) -> Vec<(String, String)> {
        let alias_config = self.state().alias_config.clone();
        let mut applied = Vec::new();
        for (alias, targets) in &alias_config {
            let Ok(device) = self.get_device(alias) else {
                tracing::warn!(alias = %alias, "alias device does not exist, cannot set its target");
                continue;
            };
            if prev.get(alias) == Some(targets) {
                tracing::debug!(alias = %alias, "alias selections unchanged");
                continue;
            }
            let Some(target) = targets.iter().find_map(|(t, _)| self.get_device(t).ok()) else {
                tracing::warn!(alias = %alias, "none of the desired alias targets exist");
                continue;
            };
            if device
                .alias_name()
                .is_some_and(|current| current.eq_ignore_ascii_case(target.name()))
            {
                continue;
            }
            match device.set_alias(Some(Arc::clone(&target))) {
                Ok(()) => applied.push((device.name().to_owned(), target.name().to_owned())),
                Err(e) => tracing::error!(alias = %alias, error = %e, "could not set alias"),
            }
        }
        applied
    }

    fn publish_setups(&self) {
        let Some(cache) = &self.cache else {
            return;
        };
        let (loaded, explicit) = {
            let state = self.state();
            (state.loaded.clone(), state.explicit.clone())
        };
        let list = |names: Vec<String>| Value::List(names.into_iter().map(Value::Str).collect());
        cache.set(SESSION_KEY, "mastersetup", list(loaded), now(), None);
        cache.set(SESSION_KEY, "mastersetupexplicit", list(explicit), now(), None);
    }

    // ── Devices ──────────────────────────────────────────────────────

    /// Create (and initialise) a configured device and everything it
    /// depends on. Returns the existing instance if already created.
    pub async fn create_device(&self, name: &str) -> Result<Arc<Device>, NicosError> {
        let _creation = self.creation.lock().await;
        self.create_locked(name, &mut Vec::new()).await
    }

    fn create_locked<'a>(
        &'a self,
        name: &'a str,
        stack: &'a mut Vec<String>,
    ) -> BoxFuture<'a, Result<Arc<Device>, NicosError>> {
        async move {
            let key = name.to_lowercase();
            if let Some(device) = self.state().devices.get(&key) {
                return Ok(Arc::clone(device));
            }
            if stack.contains(&key) {
                stack.push(key);
                return Err(NicosError::config(format!(
                    "circular device reference: {}",
                    stack.join(" -> ")
                )));
            }
            let (devname, config) = self.state().configured.get(&key).cloned().ok_or_else(|| {
                NicosError::config(format!("device {name} is not configured in any loaded setup"))
            })?;
            let class = self.registry.get(&config.class).ok_or_else(|| {
                NicosError::config(format!("{devname}: unknown device class {}", config.class))
            })?;

            tracing::debug!(device = %devname, class = %class.name, "creating device");
            stack.push(key.clone());
            let mut builder = Device::builder(devname.clone(), Arc::clone(&class))
                .mode(self.mode.subscribe())
                .io_timeout(self.io_timeout);
            if let Some(cache) = &self.cache {
                builder = builder.cache(Arc::clone(cache));
            }
            let mut alias_target = None;
            for (pname, value) in &config.params {
                if class.attachment(pname).is_some() {
                    let mut attached = Vec::new();
                    for child in config.device_refs(pname) {
                        attached.push(self.create_locked(&child, stack).await?);
                    }
                    builder = builder.attach_all(pname, attached);
                } else if class.is_alias() && pname == "alias" {
                    if let Some(target) = value.as_str().filter(|t| !t.is_empty()) {
                        alias_target = Some(self.create_locked(target, stack).await?);
                    }
                } else {
                    builder = builder.param(pname, toml_to_value(value));
                }
            }
            stack.pop();

            let device = builder.build()?;
            device.init().await?;
            if let Some(target) = alias_target {
                device.set_alias(Some(target))?;
            }
            self.state().devices.insert(key, Arc::clone(&device));
            tracing::info!(device = %devname, class = %class.name, lowlevel = config.is_lowlevel(), "device created");
            Ok(device)
        }
        .boxed()
    }

    /// Point `alias` at `target`.
    pub fn set_alias(&self, alias: &str, target: &str) -> Result<(), NicosError> {
        let alias = self.get_device(alias)?;
        let target = self.get_device(target)?;
        alias.set_alias(Some(target))
    }

    /// Devices that attach `device` or point an alias at it.
    fn users_of(devices: &IndexMap<String, Arc<Device>>, device: &Arc<Device>) -> Vec<String> {
        devices
            .values()
            .filter(|other| !Arc::ptr_eq(other, device))
            .filter(|other| {
                other.attached_devices().any(|a| Arc::ptr_eq(a, device))
                    || matches!(other.alias_target(), Ok(Some(t)) if Arc::ptr_eq(&t, device))
            })
            .map(|other| other.name().to_owned())
            .collect()
    }

    /// Shut down and forget one device. Refused while others use it.
    pub async fn destroy_device(&self, name: &str) -> Result<(), NicosError> {
        let _creation = self.creation.lock().await;
        let device = {
            let mut state = self.state();
            let key = name.to_lowercase();
            let device = state
                .devices
                .get(&key)
                .cloned()
                .ok_or_else(|| NicosError::device_not_found(name))?;
            let users = Self::users_of(&state.devices, &device);
            if !users.is_empty() {
                return Err(NicosError::usage(format!(
                    "{} is still used by {}",
                    device.name(),
                    users.join(", ")
                )));
            }
            state.devices.shift_remove(&key);
            device
        };
        device.shutdown().await;
        tracing::info!(device = %device.name(), "device destroyed");
        Ok(())
    }

    /// Shut down all devices (users before the devices they use) and
    /// forget every loaded setup.
    pub async fn unload_setup(&self) -> Result<(), NicosError> {
        let _creation = self.creation.lock().await;
        let mut remaining = self.state().devices.clone();
        let mut deadlocked = Vec::new();

        while !remaining.is_empty() {
            let ready: Vec<String> = remaining
                .iter()
                .filter(|(_, dev)| Self::users_of(&remaining, dev).is_empty())
                .map(|(key, _)| key.clone())
                .collect();
            if ready.is_empty() {
                deadlocked = remaining.values().map(|d| d.name().to_owned()).collect();
                tracing::error!(devices = %deadlocked.join(", "), "dependency deadlock, forcing shutdown");
                for device in remaining.values() {
                    device.shutdown().await;
                }
                break;
            }
            for key in ready {
                if let Some(device) = remaining.shift_remove(&key) {
                    device.shutdown().await;
                }
            }
        }

        *self.state() = SessionState::default();
        tracing::info!("setups unloaded");
        if deadlocked.is_empty() {
            Ok(())
        } else {
            Err(NicosError::config(format!(
                "dependency deadlock while unloading: {}",
                deadlocked.join(", ")
            )))
        }
    }

    pub async fn shutdown(&self) -> Result<(), NicosError> {
        self.unload_setup().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cache::CacheStore;
    use crate::status::Status;

    fn setup(name: &str, toml: &str) -> SetupInfo {
        SetupInfo::from_toml(name, toml).unwrap()
    }

    fn catalog() -> Vec<SetupInfo> {
        vec![
            setup(
                "base",
                r#"
group = "lowlevel"

[devices.T]
class = "DeviceAlias"
"#,
            ),
            setup(
                "ccr",
                r#"
description = "CCR cryostat"
includes = ["base"]
excludes = ["oven"]
startupcode = "print('ccr')"

[devices.T_ccr0]
class = "VirtualTemperature"
abslimits = [0, 300]

[devices.T_stick]
class = "VirtualTemperature"
abslimits = [0, 500]

[alias_config.T]
T_ccr0 = 200
T_stick = 100
"#,
            ),
            setup(
                "oven",
                r#"
[devices.T_oven]
class = "VirtualTemperature"
abslimits = [300, 1500]
"#,
            ),
            setup(
                "axes",
                r#"
[devices.m1]
class = "VirtualMotor"
unit = "deg"
abslimits = [-10, 10]

[devices.ax]
class = "Axis"
unit = "deg"
abslimits = [-5, 5]
motor = "m1"

[devices.bad]
class = "NoSuchClass"
"#,
            ),
            setup(
                "loop",
                r#"
[devices.c1]
class = "VirtualCoder"
unit = "mm"
motor = "c2"

[devices.c2]
class = "VirtualCoder"
unit = "mm"
motor = "c1"
"#,
            ),
            setup("cache", "group = \"special\""),
        ]
    }

    fn session() -> (Session, Arc<CacheStore>) {
        let cache = Arc::new(CacheStore::default());
        let session = Session::new(DeviceRegistry::with_builtins(), catalog())
            .with_cache(Arc::clone(&cache) as Arc<dyn CacheBackend>);
        (session, cache)
    }

    #[tokio::test]
    async fn loads_includes_and_applies_aliases() {
        let (session, cache) = session();
        let report = session.load_setup(&["ccr"]).await.unwrap();

        assert_eq!(report.loaded, vec!["base", "ccr"]);
        assert_eq!(session.loaded_setups(), vec!["ccr", "base"]);
        assert!(report.failed.is_empty(), "{:?}", report.failed);
        assert_eq!(report.aliases, vec![("T".to_owned(), "T_ccr0".to_owned())]);
        assert_eq!(report.startupcode, vec!["print('ccr')"]);
        assert_eq!(session.explicit_setups(), vec!["ccr"]);

        let t = session.get_device("t").unwrap();
        assert_eq!(t.alias_name().as_deref(), Some("T_ccr0"));
        assert_eq!(
            cache.get(SESSION_KEY, "mastersetupexplicit", Value::None),
            Value::List(vec![Value::from("ccr")])
        );
    }

    #[tokio::test]
    async fn excluded_and_special_setups_are_refused() {
        let (session, _) = session();
        session.load_setup(&["ccr"]).await.unwrap();

        let err = session.load_setup(&["oven"]).await.unwrap_err();
        assert!(err.to_string().contains("excluded"), "{err}");
        let err = session.load_setup(&["cache"]).await.unwrap_err();
        assert!(err.to_string().contains("special"), "{err}");
        let err = session.load_setup(&["nope"]).await.unwrap_err();
        assert!(matches!(err, NicosError::Configuration { .. }));
        assert_eq!(session.loaded_setups(), vec!["ccr", "base"]);
    }

    #[tokio::test]
    async fn creation_failures_are_collected() {
        let (session, _) = session();
        let report = session.load_setup(&["axes"]).await.unwrap();

        assert_eq!(report.created, vec!["m1", "ax"]);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].1.contains("unknown device class"));
        let ax = session.get_device("AX").unwrap();
        assert!(Arc::ptr_eq(ax.attached("motor").unwrap(), &session.get_device("m1").unwrap()));
    }

    #[tokio::test]
    async fn circular_attachments_are_configuration_errors() {
        let (session, _) = session();
        let report = session.load_setup(&["loop"]).await.unwrap();
        assert_eq!(report.failed.len(), 2);
        let err = session.create_device("c1").await.unwrap_err();
        assert!(matches!(err, NicosError::Configuration { .. }));
        assert!(err.to_string().contains("c1 -> c2 -> c1"), "{err}");
    }

    #[tokio::test]
    async fn destroy_and_unload_respect_dependencies() {
        let (session, _) = session();
        session.load_setup(&["axes"]).await.unwrap();

        let err = session.destroy_device("m1").await.unwrap_err();
        assert!(err.to_string().contains("still used by ax"), "{err}");

        session.unload_setup().await.unwrap();
        assert!(session.devices().is_empty());
        assert!(session.loaded_setups().is_empty());
        assert!(session.get_device("m1").is_err());
    }

    #[tokio::test]
    async fn slave_mode_reaches_devices() {
        let (session, _) = session();
        session.load_setup(&["ccr"]).await.unwrap();
        let t = session.get_device("T").unwrap();

        session.set_mode(Mode::Slave);
        assert!(matches!(t.start(100.0).await.unwrap_err(), NicosError::Mode { .. }));
        session.set_mode(Mode::Master);
        t.start(0.0).await.unwrap();
        assert_ne!(t.status(Some(0.0)).await.unwrap().status, Status::Error);
    }
}
