// ── Driver traits ──
//
// A `Driver` supplies the hardware side of a device; the framework
// wrapper (`Device`) handles caching, validation, limits, modes and
// timeouts around it. Moveable drivers additionally expose a `Movement`.

use async_trait::async_trait;
use nicos_proto::Value;

use super::Device;
use crate::error::NicosError;
use crate::params::ParamType;
use crate::status::DeviceStatus;

/// Hardware access for a readable device.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Called once after creation, with all parameters initialised.
    async fn init(&self, _dev: &Device) -> Result<(), NicosError> {
        Ok(())
    }

    /// Read the current value from the hardware.
    ///
    /// `maxage` is the caller's age limit, to pass on to attached devices.
    async fn read(&self, dev: &Device, maxage: Option<f64>) -> Result<Value, NicosError>;

    async fn status(&self, _dev: &Device, _maxage: Option<f64>) -> Result<DeviceStatus, NicosError> {
        Ok(DeviceStatus::ok(""))
    }

    /// Extra work done by the poller before status and value are read.
    async fn poll(&self, _dev: &Device, _n: u64) -> Result<(), NicosError> {
        Ok(())
    }

    /// Hardware value of a volatile parameter; `None` keeps the stored one.
    async fn read_param(&self, _dev: &Device, _name: &str) -> Result<Option<Value>, NicosError> {
        Ok(None)
    }

    /// Push a parameter change to the hardware before it is stored.
    async fn write_param(&self, _dev: &Device, _name: &str, _value: &Value) -> Result<(), NicosError> {
        Ok(())
    }

    async fn reset(&self, _dev: &Device) -> Result<(), NicosError> {
        Ok(())
    }

    async fn shutdown(&self, _dev: &Device) {}

    /// The moveable side of this driver, if any.
    fn movement(&self) -> Option<&dyn Movement> {
        None
    }
}

/// Hardware access for a moveable device.
#[async_trait]
pub trait Movement: Send + Sync {
    /// Start moving to an already validated target.
    async fn start(&self, dev: &Device, target: &Value) -> Result<(), NicosError>;

    async fn stop(&self, _dev: &Device) -> Result<(), NicosError> {
        Ok(())
    }

    /// Wait for the movement to finish. The default polls the status.
    async fn wait(&self, dev: &Device) -> Result<(), NicosError> {
        dev.wait_idle().await
    }

    /// Recovery after `wait` exceeded the device timeout.
    async fn timeout_action(&self, dev: &Device) -> Result<(), NicosError> {
        self.stop(dev).await
    }

    /// Device-specific target check, on top of the limit parameters.
    async fn is_allowed(&self, _dev: &Device, _target: &Value) -> Result<(), String> {
        Ok(())
    }

    /// Type targets are validated against.
    fn value_type(&self, _dev: &Device) -> ParamType {
        ParamType::Float
    }
}
