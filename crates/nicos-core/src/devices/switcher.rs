// ── Switchers ──
//
// Devices mapping symbolic names onto raw positions of other devices.
// Readback is mapped back within a precision; a readback matching no entry
// yields the `fallback` value, or a position error without one. It is
// never rounded to the nearest entry.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use nicos_proto::Value;

use crate::cache::{CacheBackend, SubscriptionId};
use crate::device::{Device, DeviceClass, Driver, Movement};
use crate::error::NicosError;
use crate::params::{ParamInfo, ParamType};
use crate::status::{DeviceStatus, Status, multi_status};

// ── Mapping ──────────────────────────────────────────────────────────

/// Symbolic name to raw position table, in configuration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mapping {
    entries: Vec<(Value, Value)>,
}

impl Mapping {
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_dict().map(|entries| Self {
            entries: entries.to_vec(),
        })
    }

    pub fn names(&self) -> Vec<Value> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn contains(&self, name: &Value) -> bool {
        self.raw(name).is_some()
    }

    /// Raw position of `name`.
    pub fn raw(&self, name: &Value) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(n, _)| n.loosely_equals(name))
            .map(|(_, raw)| raw)
    }

    /// First name whose raw position matches `pos`.
    ///
    /// `precisions` holds one value for all elements or one per element;
    /// a precision of zero (or none given) requires equality.
    pub fn lookup(&self, pos: &Value, precisions: &[f64]) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(_, raw)| within_precision(pos, raw, precisions))
            .map(|(name, _)| name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn raw_values(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(_, raw)| raw)
    }
}

fn close(pos: f64, raw: f64, precision: f64) -> bool {
    let diff = (pos - raw).abs();
    if precision > 0.0 {
        diff <= precision
    } else {
        diff <= f64::EPSILON * raw.abs().max(1.0)
    }
}

fn precision_at(precisions: &[f64], index: usize) -> f64 {
    match precisions {
        [single] => *single,
        many => many.get(index).copied().unwrap_or(0.0),
    }
}

fn within_precision(pos: &Value, raw: &Value, precisions: &[f64]) -> bool {
    if let (Some(p), Some(r)) = (pos.as_f64(), raw.as_f64()) {
        return close(p, r, precision_at(precisions, 0));
    }
    match (pos.as_seq(), raw.as_seq()) {
        (Some(ps), Some(rs)) => {
            ps.len() == rs.len()
                && ps.iter().zip(rs).enumerate().all(|(i, (p, r))| {
                    match (p.as_f64(), r.as_f64()) {
                        (Some(p), Some(r)) => close(p, r, precision_at(precisions, i)),
                        _ => p.loosely_equals(r),
                    }
                })
        }
        _ => pos.loosely_equals(raw),
    }
}

/// The mapping to use for a given upstream value.
///
/// `mappings` is a dict of upstream value to mapping dict.
pub fn compute_mapping(mappings: &Value, upstream: &Value) -> Option<Mapping> {
    mappings
        .as_dict()?
        .iter()
        .find(|(key, _)| key.loosely_equals(upstream))
        .and_then(|(_, mapping)| Mapping::from_value(mapping))
}

// ── Shared mapped-readback logic ─────────────────────────────────────

fn mapping_param(dev: &Device) -> Mapping {
    dev.get("mapping")
        .as_ref()
        .and_then(Mapping::from_value)
        .unwrap_or_default()
}

fn fallback(dev: &Device) -> Option<Value> {
    dev.get("fallback").filter(|v| !v.is_none())
}

/// Map a raw readback to a name, the fallback, or a position error.
fn map_read(
    dev: &Device,
    mapping: &Mapping,
    raw: &Value,
    precisions: &[f64],
    source: &str,
) -> Result<Value, NicosError> {
    if let Some(name) = mapping.lookup(raw, precisions) {
        return Ok(name.clone());
    }
    fallback(dev).ok_or_else(|| {
        NicosError::position(dev.name(), format!("unknown position of {source}: {raw}"))
    })
}

/// Status of a switcher given the status of what it reads and its mapped
/// readback.
fn mapped_status(
    dev: &Device,
    underlying: DeviceStatus,
    mapping: &Mapping,
    mapped: Result<Value, NicosError>,
    source: &str,
) -> Result<DeviceStatus, NicosError> {
    if underlying.status != Status::Ok {
        return Ok(underlying);
    }
    match mapped {
        Ok(name) if mapping.contains(&name) => Ok(DeviceStatus::ok("")),
        Ok(_) if fallback(dev).is_some() => Ok(DeviceStatus::new(
            Status::Unknown,
            format!("unconfigured position of {source}, using fallback"),
        )),
        Ok(_) => Ok(DeviceStatus::new(
            Status::NotReached,
            format!("unconfigured position of {source} or still moving"),
        )),
        Err(NicosError::Position { message, .. }) => {
            Ok(DeviceStatus::new(Status::NotReached, message))
        }
        Err(e) => Err(e),
    }
}

fn blocking(dev: &Device) -> bool {
    dev.get("blockingmove")
        .and_then(|v| v.as_bool())
        .unwrap_or(true)
}

fn mapping_params(
    builder: crate::device::DeviceClassBuilder,
    fallback_type: ParamType,
) -> crate::device::DeviceClassBuilder {
    builder
        .default("unit", "")
        .default("fmtstr", "%s")
        .param(
            "fallback",
            ParamInfo::new("Readback value if no mapping entry matches", ParamType::none_or(fallback_type))
                .internal(),
        )
}

fn blockingmove_param() -> ParamInfo {
    ParamInfo::new("Whether a move waits for the devices to arrive", ParamType::Bool)
        .default(true)
        .settable()
}

// ── Switcher ─────────────────────────────────────────────────────────

pub fn switcher_class() -> Arc<DeviceClass> {
    mapping_params(DeviceClass::builder("Switcher"), ParamType::Str)
        .description("Maps names onto discrete positions of one moveable")
        .moveable()
        .attach("moveable", "The continuous device which is controlled")
        .param(
            "mapping",
            ParamInfo::new("Name to position mapping", ParamType::dict_of(ParamType::Any, ParamType::Any))
                .mandatory(),
        )
        .param(
            "precision",
            ParamInfo::new("Precision for comparison", ParamType::Float)
                .mandatory()
                .settable(),
        )
        .param("blockingmove", blockingmove_param())
        .driver(|| Switcher)
        .build()
}

#[derive(Debug, Default)]
pub struct Switcher;

impl Switcher {
    async fn mapped(dev: &Device, maxage: Option<f64>) -> Result<Value, NicosError> {
        let moveable = dev.attached("moveable")?;
        let raw = moveable.read(maxage).await?;
        map_read(dev, &mapping_param(dev), &raw, &[dev.precision()], moveable.name())
    }

    fn raw_target(dev: &Device, target: &Value) -> Result<Value, NicosError> {
        mapping_param(dev)
            .raw(target)
            .cloned()
            .ok_or_else(|| NicosError::invalid(dev.name(), format!("{target} is not a mapped position")))
    }
}

#[async_trait]
impl Driver for Switcher {
    async fn read(&self, dev: &Device, maxage: Option<f64>) -> Result<Value, NicosError> {
        Self::mapped(dev, maxage).await
    }

    async fn status(&self, dev: &Device, maxage: Option<f64>) -> Result<DeviceStatus, NicosError> {
        let moveable = dev.attached("moveable")?;
        let underlying = moveable.status(maxage).await?;
        let mapped = Self::mapped(dev, maxage).await;
        mapped_status(dev, underlying, &mapping_param(dev), mapped, moveable.name())
    }

    fn movement(&self) -> Option<&dyn Movement> {
        Some(self)
    }
}

#[async_trait]
impl Movement for Switcher {
    async fn start(&self, dev: &Device, target: &Value) -> Result<(), NicosError> {
        if Self::mapped(dev, Some(0.0))
            .await
            .is_ok_and(|current| current.loosely_equals(target))
        {
            tracing::debug!(device = %dev.name(), target = %target, "already at target, not moving");
            return Ok(());
        }
        let moveable = dev.attached("moveable")?;
        moveable.start(Self::raw_target(dev, target)?).await?;
        if blocking(dev) {
            moveable.wait().await?;
        }
        Ok(())
    }

    async fn stop(&self, dev: &Device) -> Result<(), NicosError> {
        dev.attached("moveable")?.stop().await
    }

    async fn is_allowed(&self, dev: &Device, target: &Value) -> Result<(), String> {
        let raw = Self::raw_target(dev, target).map_err(|e| e.to_string())?;
        let moveable = dev.attached("moveable").map_err(|e| e.to_string())?;
        moveable
            .check_target(raw)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn value_type(&self, dev: &Device) -> ParamType {
        ParamType::OneOf(mapping_param(dev).names())
    }
}

// ── ReadonlySwitcher ─────────────────────────────────────────────────

pub fn readonly_switcher_class() -> Arc<DeviceClass> {
    mapping_params(DeviceClass::builder("ReadonlySwitcher"), ParamType::Str)
        .description("Maps positions of one readable onto names")
        .attach("readable", "The continuous device which is read")
        .param(
            "mapping",
            ParamInfo::new("Name to position mapping", ParamType::dict_of(ParamType::Any, ParamType::Any))
                .mandatory(),
        )
        .param(
            "precision",
            ParamInfo::new("Precision for comparison", ParamType::Float).settable(),
        )
        .driver(|| ReadonlySwitcher)
        .build()
}

#[derive(Debug, Default)]
pub struct ReadonlySwitcher;

impl ReadonlySwitcher {
    async fn mapped(dev: &Device, maxage: Option<f64>) -> Result<Value, NicosError> {
        let readable = dev.attached("readable")?;
        let raw = readable.read(maxage).await?;
        map_read(dev, &mapping_param(dev), &raw, &[dev.precision()], readable.name())
    }
}

#[async_trait]
impl Driver for ReadonlySwitcher {
    async fn read(&self, dev: &Device, maxage: Option<f64>) -> Result<Value, NicosError> {
        Self::mapped(dev, maxage).await
    }

    async fn status(&self, dev: &Device, maxage: Option<f64>) -> Result<DeviceStatus, NicosError> {
        let readable = dev.attached("readable")?;
        let underlying = readable.status(maxage).await?;
        let mapped = Self::mapped(dev, maxage).await;
        mapped_status(dev, underlying, &mapping_param(dev), mapped, readable.name())
    }
}

// ── MultiSwitcher ────────────────────────────────────────────────────

pub fn multi_switcher_class() -> Arc<DeviceClass> {
    mapping_params(DeviceClass::builder("MultiSwitcher"), ParamType::Any)
        .description("Maps names onto positions of several devices")
        .moveable()
        .attach_many("moveables", "The devices which are controlled", false)
        .attach_many("readables", "Devices used for readback only", true)
        .param(
            "mapping",
            ParamInfo::new(
                "Mapping of names to one value per attached device",
                ParamType::dict_of(ParamType::Any, ParamType::list_of(ParamType::Any)),
            )
            .mandatory(),
        )
        .param(
            "precision",
            ParamInfo::new(
                "Allowed deviations (one, or one per device), or None for equality",
                ParamType::none_or(ParamType::list_of(ParamType::FloatRange(0.0, 360.0))),
            )
            .mandatory()
            .settable(),
        )
        .param("blockingmove", blockingmove_param())
        .driver(|| MultiSwitcher)
        .build()
}

#[derive(Debug, Default)]
pub struct MultiSwitcher;

impl MultiSwitcher {
    /// Moveables first, then readback-only devices.
    fn devices(dev: &Device) -> Vec<&Arc<Device>> {
        dev.attached_all("moveables")
            .iter()
            .chain(dev.attached_all("readables"))
            .collect()
    }

    fn precisions(dev: &Device) -> Vec<f64> {
        dev.get("precision")
            .and_then(|v| {
                v.as_seq()
                    .map(|items| items.iter().filter_map(Value::as_f64).collect())
            })
            .unwrap_or_default()
    }

    fn source(dev: &Device) -> String {
        Self::devices(dev)
            .iter()
            .map(|d| d.name())
            .collect::<Vec<_>>()
            .join(", ")
    }

    async fn mapped(dev: &Device, maxage: Option<f64>) -> Result<Value, NicosError> {
        let mut raw = Vec::new();
        for device in Self::devices(dev) {
            raw.push(device.read(maxage).await?);
        }
        map_read(
            dev,
            &mapping_param(dev),
            &Value::Tuple(raw),
            &Self::precisions(dev),
            &Self::source(dev),
        )
    }

    fn raw_targets(dev: &Device, target: &Value) -> Result<Vec<Value>, NicosError> {
        let moveables = dev.attached_all("moveables");
        let raw = mapping_param(dev)
            .raw(target)
            .and_then(Value::as_seq)
            .map(<[Value]>::to_vec)
            .ok_or_else(|| NicosError::invalid(dev.name(), format!("{target} is not a mapped position")))?;
        if raw.len() < moveables.len() {
            return Err(NicosError::invalid(
                dev.name(),
                format!("a move needs {} positions", moveables.len()),
            ));
        }
        Ok(raw)
    }
}

#[async_trait]
impl Driver for MultiSwitcher {
    async fn init(&self, dev: &Device) -> Result<(), NicosError> {
        let count = Self::devices(dev).len();
        let mapping = mapping_param(dev);
        if mapping
            .raw_values()
            .any(|raw| raw.as_seq().is_none_or(|items| items.len() != count))
        {
            return Err(NicosError::config(format!(
                "{}: every mapping entry needs one value per attached device ({count})",
                dev.name()
            )));
        }
        let precisions = Self::precisions(dev);
        if !precisions.is_empty() && precisions.len() != 1 && precisions.len() != count {
            return Err(NicosError::config(format!(
                "{}: the precision list must have one element or one per device ({count})",
                dev.name()
            )));
        }
        Ok(())
    }

    async fn read(&self, dev: &Device, maxage: Option<f64>) -> Result<Value, NicosError> {
        Self::mapped(dev, maxage).await
    }

    async fn status(&self, dev: &Device, maxage: Option<f64>) -> Result<DeviceStatus, NicosError> {
        let mut statuses = Vec::new();
        for device in Self::devices(dev) {
            statuses.push((device.name(), device.status(maxage).await?));
        }
        let underlying = multi_status(statuses.iter().map(|(name, st)| (*name, st)));
        let mapped = Self::mapped(dev, maxage).await;
        mapped_status(dev, underlying, &mapping_param(dev), mapped, &Self::source(dev))
    }

    fn movement(&self) -> Option<&dyn Movement> {
        Some(self)
    }
}

#[async_trait]
impl Movement for MultiSwitcher {
    async fn start(&self, dev: &Device, target: &Value) -> Result<(), NicosError> {
        if Self::mapped(dev, Some(0.0))
            .await
            .is_ok_and(|current| current.loosely_equals(target))
        {
            tracing::debug!(device = %dev.name(), target = %target, "already at target, not moving");
            return Ok(());
        }
        let raw = Self::raw_targets(dev, target)?;
        for (device, position) in dev.attached_all("moveables").iter().zip(raw) {
            tracing::debug!(device = %dev.name(), moving = %device.name(), to = %position, "starting");
            device.start(position).await?;
        }
        if blocking(dev) {
            for device in Self::devices(dev) {
                device.wait().await?;
            }
        }
        Ok(())
    }

    async fn stop(&self, dev: &Device) -> Result<(), NicosError> {
        let mut result = Ok(());
        for device in dev.attached_all("moveables") {
            if let Err(e) = device.stop().await {
                tracing::warn!(device = %dev.name(), stopping = %device.name(), error = %e, "stop failed");
                result = Err(e);
            }
        }
        result
    }

    /// Every moveable must accept its position before any of them starts.
    async fn is_allowed(&self, dev: &Device, target: &Value) -> Result<(), String> {
        let raw = Self::raw_targets(dev, target).map_err(|e| e.to_string())?;
        for (device, position) in dev.attached_all("moveables").iter().zip(raw) {
            device
                .check_target(position.clone())
                .await
                .map_err(|e| format!("target value {position} not accepted by device {}: {e}", device.name()))?;
        }
        Ok(())
    }

    fn value_type(&self, dev: &Device) -> ParamType {
        ParamType::OneOf(mapping_param(dev).names())
    }
}

// ── SelectorSwitcher ─────────────────────────────────────────────────

pub fn selector_switcher_class() -> Arc<DeviceClass> {
    mapping_params(DeviceClass::builder("SelectorSwitcher"), ParamType::Str)
        .description("Switcher whose mapping depends on the value of a selector device")
        .moveable()
        .attach("moveable", "The continuous device which is controlled")
        .attach("selector", "Device whose value selects the mapping")
        .param(
            "mappings",
            ParamInfo::new(
                "Selector value to mapping dict",
                ParamType::dict_of(
                    ParamType::Any,
                    ParamType::dict_of(ParamType::Any, ParamType::Any),
                ),
            )
            .mandatory(),
        )
        .param(
            "precision",
            ParamInfo::new("Precision for comparison", ParamType::Float).settable(),
        )
        .param("blockingmove", blockingmove_param())
        .driver(SelectorSwitcher::default)
        .build()
}

#[derive(Debug, Default)]
pub struct SelectorSwitcher {
    subscription: Mutex<Option<(Weak<dyn CacheBackend>, SubscriptionId)>>,
}

impl SelectorSwitcher {
    /// Mapping for the selector's current value.
    async fn mapping(dev: &Device, maxage: Option<f64>) -> Result<Mapping, NicosError> {
        let selector = dev.attached("selector")?;
        let upstream = selector.read(maxage).await?;
        let mappings = dev.get("mappings").unwrap_or_default();
        compute_mapping(&mappings, &upstream).ok_or_else(|| {
            NicosError::position(
                dev.name(),
                format!("no mapping for {} = {upstream}", selector.name()),
            )
        })
    }

    async fn mapped(dev: &Device, mapping: &Mapping, maxage: Option<f64>) -> Result<Value, NicosError> {
        let moveable = dev.attached("moveable")?;
        let raw = moveable.read(maxage).await?;
        map_read(dev, mapping, &raw, &[dev.precision()], moveable.name())
    }

    fn all_names(dev: &Device) -> Vec<Value> {
        let mut names: Vec<Value> = Vec::new();
        let mappings = dev.get("mappings").unwrap_or_default();
        for (_, mapping) in mappings.as_dict().unwrap_or_default() {
            for name in Mapping::from_value(mapping).unwrap_or_default().names() {
                if !names.iter().any(|n| n.loosely_equals(&name)) {
                    names.push(name);
                }
            }
        }
        names
    }
}

#[async_trait]
impl Driver for SelectorSwitcher {
    /// Invalidate our cached value whenever the selector changes.
    async fn init(&self, dev: &Device) -> Result<(), NicosError> {
        let Some(cache) = dev.cache() else {
            return Ok(());
        };
        let selector = dev.attached("selector")?;
        let weak = Arc::downgrade(cache);
        let own = dev.name().to_owned();
        let id = cache.subscribe(
            &cache.key(selector.name(), "value"),
            Arc::new({
                let weak = weak.clone();
                move |_update: &crate::cache::CacheUpdate| {
                    if let Some(cache) = weak.upgrade() {
                        cache.invalidate(&own, "value");
                        cache.invalidate(&own, "status");
                    }
                }
            }),
        );
        *self.subscription.lock().unwrap_or_else(PoisonError::into_inner) = Some((weak, id));
        Ok(())
    }

    async fn read(&self, dev: &Device, maxage: Option<f64>) -> Result<Value, NicosError> {
        let mapping = Self::mapping(dev, maxage).await?;
        Self::mapped(dev, &mapping, maxage).await
    }

    async fn status(&self, dev: &Device, maxage: Option<f64>) -> Result<DeviceStatus, NicosError> {
        let moveable = dev.attached("moveable")?;
        let underlying = moveable.status(maxage).await?;
        let mapping = match Self::mapping(dev, maxage).await {
            Ok(mapping) => mapping,
            Err(NicosError::Position { message, .. }) => {
                return Ok(DeviceStatus::new(Status::NotReached, message));
            }
            Err(e) => return Err(e),
        };
        let mapped = Self::mapped(dev, &mapping, maxage).await;
        mapped_status(dev, underlying, &mapping, mapped, moveable.name())
    }

    async fn shutdown(&self, _dev: &Device) {
        if let Some((weak, id)) = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            if let Some(cache) = weak.upgrade() {
                cache.unsubscribe(id);
            }
        }
    }

    fn movement(&self) -> Option<&dyn Movement> {
        Some(self)
    }
}

#[async_trait]
impl Movement for SelectorSwitcher {
    async fn start(&self, dev: &Device, target: &Value) -> Result<(), NicosError> {
        let mapping = Self::mapping(dev, Some(0.0)).await?;
        if Self::mapped(dev, &mapping, Some(0.0))
            .await
            .is_ok_and(|current| current.loosely_equals(target))
        {
            tracing::debug!(device = %dev.name(), target = %target, "already at target, not moving");
            return Ok(());
        }
        let raw = mapping.raw(target).cloned().ok_or_else(|| {
            NicosError::invalid(dev.name(), format!("{target} is not mapped for the current selection"))
        })?;
        let moveable = dev.attached("moveable")?;
        moveable.start(raw).await?;
        if blocking(dev) {
            moveable.wait().await?;
        }
        Ok(())
    }

    async fn stop(&self, dev: &Device) -> Result<(), NicosError> {
        dev.attached("moveable")?.stop().await
    }

    /// The name must be mapped for the current selection, and the moveable
    /// must accept the position it maps to.
    async fn is_allowed(&self, dev: &Device, target: &Value) -> Result<(), String> {
        let mapping = Self::mapping(dev, None).await.map_err(|e| e.to_string())?;
        let raw = mapping
            .raw(target)
            .cloned()
            .ok_or_else(|| format!("{target} is not mapped for the current selection"))?;
        let moveable = dev.attached("moveable").map_err(|e| e.to_string())?;
        moveable
            .check_target(raw)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn value_type(&self, dev: &Device) -> ParamType {
        ParamType::OneOf(Self::all_names(dev))
    }
}
