// ── Axis ──
//
// A motor with an optional coder for readback. Moves run on a background
// positioning task that re-starts the motor up to `maxtries` times until
// the readback is within `precision` of the target. A failed positioning
// leaves an error state that the status reports until `reset`.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use nicos_proto::Value;
use tokio::task::JoinHandle;

use crate::device::{Device, DeviceClass, Driver, Movement};
use crate::error::NicosError;
use crate::params::{ParamInfo, ParamType};
use crate::status::DeviceStatus;

pub fn class() -> Arc<DeviceClass> {
    DeviceClass::builder("Axis")
        .description("Motor with optional coder and positioning retries")
        .moveable()
        .limits()
        .timeout()
        .precision()
        .attach("motor", "Motor to move")
        .attach_optional("coder", "Coder for the readback (default: the motor)")
        .param(
            "offset",
            ParamInfo::new("Offset between axis and motor coordinates", ParamType::Float)
                .unit("main")
                .settable()
                .category("offsets"),
        )
        .param(
            "maxtries",
            ParamInfo::new("Number of positioning attempts", ParamType::Int).default(3_i64),
        )
        .driver(Axis::default)
        .build()
}

/// Whether `pos` counts as being at `target`.
fn reached(target: f64, pos: f64, precision: f64) -> bool {
    let diff = (pos - target).abs();
    if precision > 0.0 {
        diff < precision
    } else {
        diff <= f64::EPSILON * target.abs().max(1.0)
    }
}

#[derive(Debug, Default)]
pub struct Axis {
    positioning: Mutex<Option<JoinHandle<()>>>,
    error: Arc<Mutex<Option<String>>>,
}

impl Axis {
    fn readback(dev: &Device) -> Result<&Arc<Device>, NicosError> {
        match dev.attached_opt("coder") {
            Some(coder) => Ok(coder),
            None => dev.attached("motor"),
        }
    }

    async fn position(dev: &Device, maxage: Option<f64>) -> Result<f64, NicosError> {
        let raw = Self::readback(dev)?.read(maxage).await?;
        let pos = raw
            .as_f64()
            .ok_or_else(|| NicosError::invalid(dev.name(), format!("readback {raw} is not a number")))?;
        Ok(pos - dev.get_f64("offset").unwrap_or(0.0))
    }

    fn is_positioning(&self) -> bool {
        self.positioning
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn abort_positioning(&self) {
        if let Some(task) = self
            .positioning
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    fn error(&self) -> Option<String> {
        self.error.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_error(&self, error: Option<String>) {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }
}

impl Drop for Axis {
    fn drop(&mut self) {
        if let Some(task) = self
            .positioning
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

/// What the positioning task needs, detached from the axis device.
struct Positioning {
    axis: String,
    motor: Arc<Device>,
    readback: Arc<Device>,
    target: f64,
    offset: f64,
    precision: f64,
    maxtries: u32,
}

impl Positioning {
    async fn run(self) -> Result<(), String> {
        let motor_target = self.target + self.offset;
        let mut tries = self.maxtries;
        self.motor
            .start(motor_target)
            .await
            .map_err(|e| format!("error starting motor: {e}"))?;
        loop {
            if let Err(e) = self.motor.wait().await {
                tracing::debug!(axis = %self.axis, error = %e, "motor failed, trying reset");
                let status = self
                    .motor
                    .reset()
                    .await
                    .map_err(|e| format!("motor reset failed: {e}"))?;
                if status.status == crate::status::Status::Error {
                    return Err(format!("motor in error state: {}", status.message));
                }
            }
            let pos = self
                .readback
                .read(Some(0.0))
                .await
                .map_err(|e| format!("error reading position: {e}"))?
                .as_f64()
                .unwrap_or(f64::NAN)
                - self.offset;
            if reached(self.target, pos, self.precision) {
                tracing::debug!(axis = %self.axis, target = self.target, "target reached");
                return Ok(());
            }
            let diff = (pos - self.target).abs();
            if tries == 0 {
                return Err(format!(
                    "target not reached after {} tries: difference {diff:.4}, precision {:.4}",
                    self.maxtries, self.precision
                ));
            }
            if tries == 1 {
                tracing::warn!(axis = %self.axis, diff, "target not reached, last try");
            } else {
                tracing::debug!(axis = %self.axis, diff, "target not reached, retrying");
            }
            tries -= 1;
            self.motor
                .start(motor_target)
                .await
                .map_err(|e| format!("error restarting motor: {e}"))?;
        }
    }
}

#[async_trait]
impl Driver for Axis {
    async fn init(&self, dev: &Device) -> Result<(), NicosError> {
        let motor = dev.attached("motor")?;
        if motor.unit() != dev.unit() {
            return Err(NicosError::config(format!(
                "{}: different units for motor ({}) and axis ({})",
                dev.name(),
                motor.unit(),
                dev.unit()
            )));
        }
        if let Some(coder) = dev.attached_opt("coder") {
            if coder.unit() != dev.unit() {
                return Err(NicosError::config(format!(
                    "{}: different units for coder ({}) and axis ({})",
                    dev.name(),
                    coder.unit(),
                    dev.unit()
                )));
            }
        }
        Ok(())
    }

    async fn read(&self, dev: &Device, maxage: Option<f64>) -> Result<Value, NicosError> {
        Self::position(dev, maxage).await.map(Value::Float)
    }

    async fn status(&self, dev: &Device, maxage: Option<f64>) -> Result<DeviceStatus, NicosError> {
        if self.is_positioning() {
            return Ok(DeviceStatus::busy("moving"));
        }
        if let Some(error) = self.error() {
            return Ok(DeviceStatus::error(error));
        }
        dev.attached("motor")?.status(maxage).await
    }

    async fn poll(&self, dev: &Device, n: u64) -> Result<(), NicosError> {
        for child in dev.attached_devices() {
            let (_, value) = child.poll(n, None).await;
            value?;
        }
        Ok(())
    }

    async fn write_param(&self, dev: &Device, name: &str, _value: &Value) -> Result<(), NicosError> {
        if name == "offset" && self.is_positioning() {
            return Err(NicosError::usage(format!(
                "{} is moving, stop it before changing the offset",
                dev.name()
            )));
        }
        Ok(())
    }

    async fn reset(&self, dev: &Device) -> Result<(), NicosError> {
        dev.attached("motor")?.reset().await?;
        if let Some(coder) = dev.attached_opt("coder") {
            coder.reset().await?;
        }
        if !self.is_positioning() {
            self.set_error(None);
        }
        Ok(())
    }

    async fn shutdown(&self, _dev: &Device) {
        self.abort_positioning();
    }

    fn movement(&self) -> Option<&dyn Movement> {
        Some(self)
    }
}

#[async_trait]
impl Movement for Axis {
    async fn start(&self, dev: &Device, target: &Value) -> Result<(), NicosError> {
        let target = target
            .as_f64()
            .ok_or_else(|| NicosError::invalid(dev.name(), format!("{target} is not a number")))?;
        let precision = dev.precision();
        if reached(target, Self::position(dev, Some(0.0)).await?, precision) {
            tracing::debug!(device = %dev.name(), target, "already at target within precision");
            return Ok(());
        }

        let motor = Arc::clone(dev.attached("motor")?);
        if self.is_positioning() {
            tracing::debug!(device = %dev.name(), "stopping the running move first");
            self.abort_positioning();
            motor.stop().await?;
        }
        self.set_error(None);

        let job = Positioning {
            axis: dev.name().to_owned(),
            readback: Arc::clone(Self::readback(dev)?),
            motor,
            target,
            offset: dev.get_f64("offset").unwrap_or(0.0),
            precision,
            maxtries: dev
                .get("maxtries")
                .and_then(|v| v.as_i64())
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(3),
        };
        let error = Arc::clone(&self.error);
        let handle = tokio::spawn(async move {
            let axis = job.axis.clone();
            if let Err(message) = job.run().await {
                tracing::error!(axis = %axis, error = %message, "positioning failed");
                *error.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
            }
        });
        *self.positioning.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    async fn stop(&self, dev: &Device) -> Result<(), NicosError> {
        self.abort_positioning();
        dev.attached("motor")?.stop().await
    }

    async fn is_allowed(&self, dev: &Device, target: &Value) -> Result<(), String> {
        let offset = dev.get_f64("offset").unwrap_or(0.0);
        let motor_target = target.as_f64().unwrap_or(f64::NAN) + offset;
        let motor = dev.attached("motor").map_err(|e| e.to_string())?;
        motor
            .check_target(Value::Float(motor_target))
            .await
            .map(|_| ())
            .map_err(|e| format!("motor cannot move there: {e}"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::devices::virtual_motor;
    use crate::status::Status;

    fn motor(limits: &str) -> Arc<Device> {
        Device::builder("m", virtual_motor::motor_class())
            .param("unit", "deg")
            .param("abslimits", Value::decode(limits).unwrap())
            .param("speed", 10.0)
            .build()
            .unwrap()
    }

    fn axis(motor: &Arc<Device>, offset: f64) -> Arc<Device> {
        Device::builder("ax", class())
            .param("unit", "deg")
            .param("abslimits", Value::decode("(-50, 50)").unwrap())
            .param("precision", 0.01)
            .param("offset", offset)
            .attach("motor", Arc::clone(motor))
            .build()
            .unwrap()
    }

    #[test]
    fn precision_check() {
        assert!(reached(1.0, 1.005, 0.01));
        assert!(!reached(1.0, 1.02, 0.01));
        assert!(reached(1.0, 1.0, 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn moves_the_motor_with_offset() {
        let m = motor("(-100, 100)");
        let ax = axis(&m, 1.0);
        m.init().await.unwrap();
        ax.init().await.unwrap();

        assert_eq!(ax.maw(5.0).await.unwrap(), Value::Float(5.0));
        assert_eq!(m.read(Some(0.0)).await.unwrap(), Value::Float(6.0));
        assert_eq!(ax.status(Some(0.0)).await.unwrap().status, Status::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn motor_limits_are_checked_up_front() {
        let m = motor("(-10, 10)");
        let ax = axis(&m, 0.0);
        m.init().await.unwrap();
        ax.init().await.unwrap();

        let err = ax.start(20.0).await.unwrap_err();
        assert!(matches!(err, NicosError::Limit { .. }), "{err}");
        assert_eq!(m.get("target"), Some(Value::None));
    }

    #[tokio::test]
    async fn unit_mismatch_is_a_configuration_error() {
        let m = motor("(-100, 100)");
        let ax = Device::builder("ax", class())
            .param("unit", "mm")
            .param("abslimits", Value::decode("(-50, 50)").unwrap())
            .attach("motor", m)
            .build()
            .unwrap();
        assert!(matches!(
            ax.init().await.unwrap_err(),
            NicosError::Configuration { .. }
        ));
    }
}
