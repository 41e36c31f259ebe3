// ── Virtual temperature controller ──
//
// Approaches the setpoint exponentially with time constant `10 / speed`.
// The device counts as settled (status OK) once the value is within
// `tolerance` of the setpoint, even though the approach continues.

use std::sync::Arc;

use async_trait::async_trait;
use nicos_proto::Value;

use super::virtual_motor::{Motion, Profile};
use crate::device::{Device, DeviceClass, Driver, Movement};
use crate::error::NicosError;
use crate::params::{ParamInfo, ParamType};
use crate::status::DeviceStatus;

pub fn class() -> Arc<DeviceClass> {
    DeviceClass::builder("VirtualTemperature")
        .description("Simulated temperature regulation")
        .moveable()
        .limits()
        .timeout()
        .precision()
        .default("unit", "K")
        .param(
            "speed",
            ParamInfo::new("Regulation speed (0: instant)", ParamType::FloatRange(0.0, 1e6))
                .unit("1/s")
                .settable(),
        )
        .param(
            "curvalue",
            ParamInfo::new("Current value", ParamType::Float)
                .unit("main")
                .default(10.0)
                .settable(),
        )
        .param(
            "tolerance",
            ParamInfo::new("Tolerance for wait()", ParamType::Float)
                .unit("main")
                .default(1.0)
                .settable()
                .category("general"),
        )
        .param(
            "setpoint",
            ParamInfo::new("Last setpoint", ParamType::Float)
                .unit("main")
                .settable()
                .category("general"),
        )
        .driver(VirtualTemperature::default)
        .build()
}

#[derive(Debug, Default)]
pub struct VirtualTemperature {
    motion: Motion,
}

impl VirtualTemperature {
    fn settled(&self, dev: &Device) -> bool {
        let setpoint = dev.get_f64("setpoint").unwrap_or_else(|| self.motion.target());
        let tolerance = dev.get_f64("tolerance").unwrap_or(1.0);
        (self.motion.value() - setpoint).abs() < tolerance
    }
}

#[async_trait]
impl Driver for VirtualTemperature {
    async fn init(&self, dev: &Device) -> Result<(), NicosError> {
        self.motion.set_position(dev.get_f64("curvalue").unwrap_or(10.0));
        Ok(())
    }

    async fn read(&self, dev: &Device, _maxage: Option<f64>) -> Result<Value, NicosError> {
        let value = self.motion.value();
        if !self.motion.is_busy() {
            dev.update_param("curvalue", Value::Float(value));
        }
        Ok(Value::Float(value))
    }

    async fn status(&self, dev: &Device, _maxage: Option<f64>) -> Result<DeviceStatus, NicosError> {
        Ok(match (self.motion.is_busy(), self.settled(dev)) {
            (true, false) => DeviceStatus::busy(format!(
                "regulating to {}",
                dev.format(&Value::Float(self.motion.target()))
            )),
            (true, true) => DeviceStatus::ok("stable"),
            (false, _) => DeviceStatus::ok("idle"),
        })
    }

    async fn shutdown(&self, _dev: &Device) {
        self.motion.halt();
    }

    fn movement(&self) -> Option<&dyn Movement> {
        Some(self)
    }
}

#[async_trait]
impl Movement for VirtualTemperature {
    async fn start(&self, dev: &Device, target: &Value) -> Result<(), NicosError> {
        let target = target
            .as_f64()
            .ok_or_else(|| NicosError::invalid(dev.name(), format!("{target} is not a number")))?;
        dev.update_param("setpoint", Value::Float(target));
        let speed = dev.get_f64("speed").unwrap_or(0.0);
        self.motion.start(target, Profile::Exponential(speed));
        Ok(())
    }

    async fn stop(&self, dev: &Device) -> Result<(), NicosError> {
        self.motion.halt();
        dev.update_param("setpoint", Value::Float(self.motion.value()));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::status::Status;

    fn temperature() -> Arc<Device> {
        Device::builder("T_ccr0", class())
            .param("abslimits", Value::decode("(0, 300)").unwrap())
            .param("speed", 10.0)
            .param("curvalue", 295.0)
            .build()
            .unwrap()
    }

    #[test]
    fn unit_defaults_to_kelvin() {
        let t = temperature();
        assert_eq!(t.unit(), "K");
        assert_eq!(t.get_f64("tolerance"), Some(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_within_tolerance() {
        let t = temperature();
        t.init().await.unwrap();
        t.start(250.0).await.unwrap();
        assert!(t.status(Some(0.0)).await.unwrap().is_busy());
        assert_eq!(t.get_f64("setpoint"), Some(250.0));

        let value = t.wait().await.unwrap().as_f64().unwrap();
        assert!((value - 250.0).abs() < 1.0, "settled at {value}");
        assert_eq!(t.status(Some(0.0)).await.unwrap().status, Status::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_moves_the_setpoint() {
        let t = temperature();
        t.init().await.unwrap();
        t.start(100.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(550)).await;
        t.stop().await.unwrap();
        let value = t.read(Some(0.0)).await.unwrap();
        assert_eq!(t.get("setpoint"), Some(value));
        assert_eq!(t.status(Some(0.0)).await.unwrap().status, Status::Ok);
    }
}
