// ── Manual devices ──
//
// Moveables without hardware: the value is whatever was last requested.
// Useful for positions an operator sets by hand.

use std::sync::Arc;

use async_trait::async_trait;
use nicos_proto::Value;

use crate::device::{Device, DeviceClass, Driver, Movement};
use crate::error::NicosError;
use crate::params::{ParamInfo, ParamType};

/// Last target, or `fallback` when nothing was moved yet.
fn current(dev: &Device, fallback: Value) -> Value {
    dev.get("target").filter(|v| !v.is_none()).unwrap_or(fallback)
}

// ── ManualMove ───────────────────────────────────────────────────────

pub fn move_class() -> Arc<DeviceClass> {
    DeviceClass::builder("ManualMove")
        .description("Continuous position set by hand")
        .moveable()
        .limits()
        .param(
            "default",
            ParamInfo::new("Value before the first move", ParamType::Float).internal(),
        )
        .driver(|| ManualMove)
        .build()
}

#[derive(Debug, Default)]
pub struct ManualMove;

#[async_trait]
impl Driver for ManualMove {
    async fn read(&self, dev: &Device, _maxage: Option<f64>) -> Result<Value, NicosError> {
        Ok(current(dev, dev.get("default").unwrap_or(Value::Float(0.0))))
    }

    fn movement(&self) -> Option<&dyn Movement> {
        Some(self)
    }
}

#[async_trait]
impl Movement for ManualMove {
    async fn start(&self, _dev: &Device, _target: &Value) -> Result<(), NicosError> {
        Ok(())
    }
}

// ── ManualSwitch ─────────────────────────────────────────────────────

pub fn switch_class() -> Arc<DeviceClass> {
    DeviceClass::builder("ManualSwitch")
        .description("Discrete state set by hand")
        .moveable()
        .default("unit", "")
        .default("fmtstr", "%s")
        .param(
            "states",
            ParamInfo::new("List of allowed states", ParamType::list_of(ParamType::Any)).mandatory(),
        )
        .driver(|| ManualSwitch)
        .build()
}

#[derive(Debug, Default)]
pub struct ManualSwitch;

impl ManualSwitch {
    fn states(dev: &Device) -> Vec<Value> {
        dev.get("states")
            .and_then(|v| v.as_seq().map(<[Value]>::to_vec))
            .unwrap_or_default()
    }
}

#[async_trait]
impl Driver for ManualSwitch {
    async fn init(&self, dev: &Device) -> Result<(), NicosError> {
        if Self::states(dev).is_empty() {
            return Err(NicosError::config(format!(
                "{}: the states list must not be empty",
                dev.name()
            )));
        }
        Ok(())
    }

    async fn read(&self, dev: &Device, _maxage: Option<f64>) -> Result<Value, NicosError> {
        let first = Self::states(dev).into_iter().next().unwrap_or_default();
        Ok(current(dev, first))
    }

    fn movement(&self) -> Option<&dyn Movement> {
        Some(self)
    }
}

#[async_trait]
impl Movement for ManualSwitch {
    async fn start(&self, _dev: &Device, _target: &Value) -> Result<(), NicosError> {
        Ok(())
    }

    fn value_type(&self, dev: &Device) -> ParamType {
        ParamType::OneOf(Self::states(dev))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_move_reports_last_target() {
        let dev = Device::builder("slit", move_class())
            .param("unit", "mm")
            .param("abslimits", Value::decode("(0, 10)").unwrap())
            .param("default", 2.5)
            .build()
            .unwrap();
        assert_eq!(dev.read(Some(0.0)).await.unwrap(), Value::Float(2.5));
        dev.start(4_i64).await.unwrap();
        assert_eq!(dev.read(Some(0.0)).await.unwrap(), Value::Float(4.0));
        assert!(matches!(
            dev.start(11.0).await.unwrap_err(),
            NicosError::Limit { .. }
        ));
    }

    #[tokio::test]
    async fn manual_switch_accepts_only_its_states() {
        let dev = Device::builder("shutter", switch_class())
            .param("states", Value::decode("['closed', 'open']").unwrap())
            .build()
            .unwrap();
        dev.init().await.unwrap();
        assert_eq!(dev.read(Some(0.0)).await.unwrap(), Value::from("closed"));
        dev.maw("open").await.unwrap();
        assert_eq!(dev.read(Some(0.0)).await.unwrap(), Value::from("open"));
        assert!(matches!(
            dev.start("ajar").await.unwrap_err(),
            NicosError::InvalidValue { .. }
        ));
        assert_eq!(dev.format(&Value::from("open")), "open");
    }
}
