// ── Virtual motor and coder ──
//
// `Motion` is the simulated mechanics shared by the virtual moveables: a
// position advanced by a tokio task in fixed steps until the target is
// reached. Stopping aborts the task and leaves the position where it is.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use nicos_proto::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::device::{Device, DeviceClass, Driver, Movement};
use crate::error::NicosError;
use crate::params::{ParamInfo, ParamType};
use crate::status::DeviceStatus;

/// Period of the motion task.
const MOTION_STEP: Duration = Duration::from_millis(100);

/// An exponential approach snaps to its end once closer than this.
const SETTLE_THRESHOLD: f64 = 1e-3;

// ── Motion ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Profile {
    /// Constant speed in units per second.
    Linear(f64),
    /// `end + (start - end) * exp(-speed / 10 * t)`.
    Exponential(f64),
}

impl Profile {
    fn speed(self) -> f64 {
        match self {
            Self::Linear(speed) | Self::Exponential(speed) => speed,
        }
    }

    /// Position after `elapsed` seconds, and whether the end is reached.
    fn step(self, start: f64, end: f64, elapsed: f64) -> (f64, bool) {
        match self {
            Self::Linear(speed) => {
                let sign = if end > start { 1.0 } else { -1.0 };
                let value = start + sign * speed * elapsed;
                if (sign > 0.0 && value >= end) || (sign < 0.0 && value <= end) {
                    (end, true)
                } else {
                    (value, false)
                }
            }
            Self::Exponential(speed) => {
                let gamma = speed / 10.0;
                let value = end + (start - end) * (-gamma * elapsed).exp();
                if (value - end).abs() < SETTLE_THRESHOLD {
                    (end, true)
                } else {
                    (value, false)
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct MotionState {
    value: f64,
    target: f64,
    busy: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Motion {
    state: Arc<Mutex<MotionState>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Motion {
    fn state(&self) -> std::sync::MutexGuard<'_, MotionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn value(&self) -> f64 {
        self.state().value
    }

    pub(crate) fn target(&self) -> f64 {
        self.state().target
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.state().busy
    }

    /// Halt and jump to `value`.
    pub(crate) fn set_position(&self, value: f64) {
        self.halt();
        let mut state = self.state();
        state.value = value;
        state.target = value;
    }

    /// Move to `target`. A speed of zero arrives immediately.
    pub(crate) fn start(&self, target: f64, profile: Profile) {
        self.halt();
        let start = {
            let mut state = self.state();
            state.target = target;
            if profile.speed() <= 0.0 {
                state.value = target;
                return;
            }
            state.busy = true;
            state.value
        };

        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            let began = Instant::now();
            loop {
                tokio::time::sleep(MOTION_STEP).await;
                let (value, done) = profile.step(start, target, began.elapsed().as_secs_f64());
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                state.value = value;
                if done {
                    state.busy = false;
                    break;
                }
            }
        });
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Stop where we are.
    pub(crate) fn halt(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        self.state().busy = false;
    }
}

impl Drop for Motion {
    fn drop(&mut self) {
        if let Some(task) = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

// ── VirtualMotor ─────────────────────────────────────────────────────

pub fn motor_class() -> Arc<DeviceClass> {
    DeviceClass::builder("VirtualMotor")
        .description("Simulated motor moving at a finite speed")
        .moveable()
        .limits()
        .timeout()
        .precision()
        .param(
            "speed",
            ParamInfo::new("Virtual speed of the device (0: instant)", ParamType::FloatRange(0.0, 1e6))
                .unit("main/s")
                .settable(),
        )
        .param(
            "ramp",
            ParamInfo::new("Virtual speed per minute", ParamType::FloatRange(0.0, 6e7))
                .unit("main/min")
                .settable()
                .volatile(),
        )
        .param(
            "curvalue",
            ParamInfo::new("Current value", ParamType::Float)
                .unit("main")
                .settable(),
        )
        .driver(VirtualMotor::default)
        .build()
}

#[derive(Debug, Default)]
pub struct VirtualMotor {
    motion: Motion,
}

impl VirtualMotor {
    fn profile(dev: &Device) -> Profile {
        Profile::Linear(dev.get_f64("speed").unwrap_or(0.0))
    }
}

#[async_trait]
impl Driver for VirtualMotor {
    async fn init(&self, dev: &Device) -> Result<(), NicosError> {
        self.motion.set_position(dev.get_f64("curvalue").unwrap_or(0.0));
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
        Ok(if self.motion.is_busy() {
            DeviceStatus::busy(format!(
                "virtual moving to {}",
                dev.format(&Value::Float(self.motion.target()))
            ))
        } else {
            DeviceStatus::ok("idle")
        })
    }

    async fn read_param(&self, dev: &Device, name: &str) -> Result<Option<Value>, NicosError> {
        Ok(match name {
            "ramp" => Some(Value::Float(dev.get_f64("speed").unwrap_or(0.0) * 60.0)),
            _ => None,
        })
    }

    async fn write_param(&self, dev: &Device, name: &str, value: &Value) -> Result<(), NicosError> {
        match name {
            "ramp" => {
                let per_minute = value.as_f64().unwrap_or(0.0);
                dev.update_param("speed", Value::Float(per_minute / 60.0));
            }
            "curvalue" => self.motion.set_position(value.as_f64().unwrap_or(0.0)),
            _ => {}
        }
        Ok(())
    }

    async fn shutdown(&self, _dev: &Device) {
        self.motion.halt();
    }

    fn movement(&self) -> Option<&dyn Movement> {
        Some(self)
    }
}

#[async_trait]
impl Movement for VirtualMotor {
    async fn start(&self, dev: &Device, target: &Value) -> Result<(), NicosError> {
        let target = target
            .as_f64()
            .ok_or_else(|| NicosError::invalid(dev.name(), format!("{target} is not a number")))?;
        self.motion.start(target, Self::profile(dev));
        Ok(())
    }

    async fn stop(&self, _dev: &Device) -> Result<(), NicosError> {
        self.motion.halt();
        Ok(())
    }
}

// ── VirtualCoder ─────────────────────────────────────────────────────

pub fn coder_class() -> Arc<DeviceClass> {
    DeviceClass::builder("VirtualCoder")
        .description("Coder returning the value of a motor")
        .attach("motor", "Motor to read out")
        .driver(|| VirtualCoder)
        .build()
}

#[derive(Debug, Default)]
pub struct VirtualCoder;

#[async_trait]
impl Driver for VirtualCoder {
    async fn read(&self, dev: &Device, maxage: Option<f64>) -> Result<Value, NicosError> {
        dev.attached("motor")?.read(maxage).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::status::Status;

    fn motor(speed: f64) -> Arc<Device> {
        Device::builder("m", motor_class())
            .param("unit", "mm")
            .param("abslimits", Value::decode("(-100, 100)").unwrap())
            .param("speed", speed)
            .build()
            .unwrap()
    }

    #[test]
    fn linear_profile_clamps_at_end() {
        let profile = Profile::Linear(2.0);
        assert_eq!(profile.step(0.0, 10.0, 1.0), (2.0, false));
        assert_eq!(profile.step(0.0, 10.0, 6.0), (10.0, true));
        assert_eq!(profile.step(10.0, 0.0, 1.0), (8.0, false));
    }

    #[test]
    fn exponential_profile_approaches_end() {
        let profile = Profile::Exponential(10.0);
        let (value, done) = profile.step(300.0, 250.0, 1.0);
        assert!(!done);
        assert!((value - (250.0 + 50.0 * (-1.0f64).exp())).abs() < 1e-9);
        assert_eq!(profile.step(300.0, 250.0, 100.0), (250.0, true));
    }

    #[tokio::test]
    async fn zero_speed_moves_instantly() {
        let m = motor(0.0);
        m.init().await.unwrap();
        m.start(12.5).await.unwrap();
        assert_eq!(m.status(Some(0.0)).await.unwrap().status, Status::Ok);
        assert_eq!(m.read(Some(0.0)).await.unwrap(), Value::Float(12.5));
    }

    #[tokio::test(start_paused = true)]
    async fn finite_speed_moves_over_time() {
        let m = motor(5.0);
        m.init().await.unwrap();
        m.start(10.0).await.unwrap();
        assert!(m.status(Some(0.0)).await.unwrap().is_busy());

        tokio::time::sleep(Duration::from_millis(1050)).await;
        let mid = m.read(Some(0.0)).await.unwrap().as_f64().unwrap();
        assert!(mid > 0.0 && mid < 10.0, "mid-move value {mid}");

        assert_eq!(m.wait().await.unwrap(), Value::Float(10.0));
        assert_eq!(m.status(Some(0.0)).await.unwrap().status, Status::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_between_positions() {
        let m = motor(1.0);
        m.init().await.unwrap();
        m.start(50.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2050)).await;
        m.stop().await.unwrap();

        let stopped = m.read(Some(0.0)).await.unwrap().as_f64().unwrap();
        assert!(stopped > 0.0 && stopped < 50.0);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(m.read(Some(0.0)).await.unwrap(), Value::Float(stopped));
        assert_eq!(m.status(Some(0.0)).await.unwrap().status, Status::Ok);
    }

    #[tokio::test]
    async fn ramp_is_derived_from_speed() {
        let m = motor(2.0);
        assert_eq!(m.param("ramp").await.unwrap(), Value::Float(120.0));
        m.set_param("ramp", 30.0).await.unwrap();
        assert_eq!(m.get_f64("speed"), Some(0.5));
    }

    #[tokio::test]
    async fn coder_reads_its_motor() {
        let m = motor(0.0);
        m.init().await.unwrap();
        m.start(-3.0).await.unwrap();
        let coder = Device::builder("c", coder_class())
            .param("unit", "mm")
            .attach("motor", Arc::clone(&m))
            .build()
            .unwrap();
        assert_eq!(coder.read(Some(0.0)).await.unwrap(), Value::Float(-3.0));
    }
}
