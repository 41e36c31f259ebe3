//! Behaviour of devices, switchers and aliases against counting mock hardware.
#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nicos_core::cache::{CacheBackend, CacheStore};
use nicos_core::device::{Device, DeviceClass, Driver, Movement};
use nicos_core::devices::{alias, switcher, virtual_motor, virtual_temperature};
use nicos_core::{DeviceStatus, NicosError, Status};
use nicos_proto::Value;

// ── Mock hardware ───────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Hardware {
    position: Mutex<f64>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl Hardware {
    fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn jump(&self, position: f64) {
        *self.position.lock().unwrap() = position;
    }
}

/// A moveable that counts every hardware access.
struct MockMotor(Arc<Hardware>);

#[async_trait]
impl Driver for MockMotor {
    async fn read(&self, _dev: &Device, _maxage: Option<f64>) -> Result<Value, NicosError> {
        self.0.reads.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Float(*self.0.position.lock().unwrap()))
    }

    fn movement(&self) -> Option<&dyn Movement> {
        Some(self)
    }
}

#[async_trait]
impl Movement for MockMotor {
    async fn start(&self, _dev: &Device, target: &Value) -> Result<(), NicosError> {
        self.0.writes.fetch_add(1, Ordering::SeqCst);
        self.0.jump(target.as_f64().unwrap());
        Ok(())
    }
}

/// A readable returning 1, 2, 3, ... on successive hardware reads.
struct Sequence(Arc<Hardware>);

#[async_trait]
impl Driver for Sequence {
    async fn read(&self, _dev: &Device, _maxage: Option<f64>) -> Result<Value, NicosError> {
        let n = self.0.reads.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Value::Int(i64::try_from(n).unwrap()))
    }
}

/// A moveable that accepts every start and then never finishes.
///
/// `stalled` reports an error status; otherwise it stays busy until stopped.
struct Jammed {
    stalled: bool,
    stops: Arc<AtomicU64>,
}

#[async_trait]
impl Driver for Jammed {
    async fn read(&self, _dev: &Device, _maxage: Option<f64>) -> Result<Value, NicosError> {
        Ok(Value::Float(0.0))
    }

    async fn status(&self, _dev: &Device, _maxage: Option<f64>) -> Result<DeviceStatus, NicosError> {
        Ok(if self.stalled {
            DeviceStatus::error("motor stalled")
        } else if self.stops.load(Ordering::SeqCst) > 0 {
            DeviceStatus::ok("stopped")
        } else {
            DeviceStatus::busy("moving")
        })
    }

    fn movement(&self) -> Option<&dyn Movement> {
        Some(self)
    }
}

#[async_trait]
impl Movement for Jammed {
    async fn start(&self, _dev: &Device, _target: &Value) -> Result<(), NicosError> {
        Ok(())
    }

    async fn stop(&self, _dev: &Device) -> Result<(), NicosError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn jammed(stalled: bool, stops: &Arc<AtomicU64>, timeout: f64) -> Arc<Device> {
    let stops = Arc::clone(stops);
    let class = DeviceClass::builder("Jammed")
        .moveable()
        .timeout()
        .driver(move || Jammed {
            stalled,
            stops: Arc::clone(&stops),
        })
        .build();
    Device::builder("j", class)
        .param("unit", "mm")
        .param("timeout", timeout)
        .build()
        .unwrap()
}

fn motor_class(hw: &Arc<Hardware>) -> Arc<DeviceClass> {
    let driver_hw = Arc::clone(hw);
    DeviceClass::builder("MockMotor")
        .moveable()
        .limits()
        .precision()
        .driver(move || MockMotor(Arc::clone(&driver_hw)))
        .build()
}

fn motor(name: &str, hw: &Arc<Hardware>, limits: &str) -> Arc<Device> {
    Device::builder(name, motor_class(hw))
        .param("unit", "mm")
        .param("abslimits", Value::decode(limits).unwrap())
        .build()
        .unwrap()
}

// ── Staleness ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_read_uses_cache_only_within_maxage() {
    let hw = Arc::new(Hardware::default());
    let cache = Arc::new(CacheStore::default());
    let driver_hw = Arc::clone(&hw);
    let class = DeviceClass::builder("Sequence")
        .driver(move || Sequence(Arc::clone(&driver_hw)))
        .build();
    let dev = Device::builder("seq", class)
        .param("unit", "counts")
        .cache(Arc::clone(&cache) as Arc<dyn CacheBackend>)
        .build()
        .unwrap();
    dev.init().await.unwrap();

    for expected in 1..=3_i64 {
        assert_eq!(dev.read(Some(0.0)).await.unwrap(), Value::Int(expected));
    }
    assert_eq!(hw.reads(), 3);

    for _ in 0..3 {
        assert_eq!(dev.read(Some(1e9)).await.unwrap(), Value::Int(3));
    }
    assert_eq!(hw.reads(), 3);
    assert_eq!(cache.get("seq", "value", Value::None), Value::Int(3));

    cache.invalidate("seq", "value");
    assert_eq!(dev.read(Some(1e9)).await.unwrap(), Value::Int(4));
    assert_eq!(hw.reads(), 4);
}

#[tokio::test]
async fn test_missing_cache_entry_reads_hardware() {
    let hw = Arc::new(Hardware::default());
    let cache = Arc::new(CacheStore::default());
    assert_eq!(cache.get("m", "value", Value::None), Value::None);

    let dev = Device::builder("m", motor_class(&hw))
        .param("unit", "mm")
        .param("abslimits", Value::decode("(0, 10)").unwrap())
        .cache(cache as Arc<dyn CacheBackend>)
        .build()
        .unwrap();
    hw.jump(2.0);
    assert_eq!(dev.read(None).await.unwrap(), Value::Float(2.0));
    assert_eq!(hw.reads(), 1);
}

// ── Limits ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_limit_violations_never_reach_hardware() {
    let hw = Arc::new(Hardware::default());
    let m = motor("m", &hw, "(0, 10)");
    m.init().await.unwrap();

    for target in [-0.5, 10.5, 1e9] {
        let err = m.start(target).await.unwrap_err();
        assert!(matches!(err, NicosError::Limit { .. }), "{err}");
    }
    assert!(matches!(
        m.start("far").await.unwrap_err(),
        NicosError::InvalidValue { .. }
    ));
    assert_eq!(hw.writes(), 0);

    m.set_param("userlimits", Value::decode("(0, 5)").unwrap())
        .await
        .unwrap();
    assert!(matches!(m.start(7.0).await.unwrap_err(), NicosError::Limit { .. }));
    assert_eq!(hw.writes(), 0);
    assert_eq!(m.get("target"), Some(Value::None));

    m.start(4.0).await.unwrap();
    assert_eq!(hw.writes(), 1);
}

#[tokio::test]
async fn test_non_finite_targets_never_reach_hardware() {
    let hw = Arc::new(Hardware::default());
    let m = motor("m", &hw, "(0, 10)");
    m.init().await.unwrap();

    for target in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
        let err = m.start(target).await.unwrap_err();
        assert!(matches!(err, NicosError::InvalidValue { .. }), "{err}");
        assert!(m.check_target(Value::Float(target)).await.is_err());
    }
    assert_eq!(hw.writes(), 0);
    assert_eq!(m.get("target"), Some(Value::None));
}

#[tokio::test]
async fn test_userlimits_outside_abslimits_are_refused() {
    let hw = Arc::new(Hardware::default());
    let m = motor("m", &hw, "(0, 10)");
    let err = m
        .set_param("userlimits", Value::decode("(-1, 5)").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, NicosError::Configuration { .. }), "{err}");
}

// ── Switchers ───────────────────────────────────────────────────────

fn switcher(m: &Arc<Device>, fallback: Option<&str>) -> Arc<Device> {
    let mut builder = Device::builder("sw", switcher::switcher_class())
        .param("mapping", Value::decode("{'in': 1.0, 'out': 5.0}").unwrap())
        .param("precision", 0.1)
        .attach("moveable", Arc::clone(m));
    if let Some(fallback) = fallback {
        builder = builder.param("fallback", fallback);
    }
    builder.build().unwrap()
}

#[tokio::test]
async fn test_switcher_repeated_start_is_a_noop() {
    let hw = Arc::new(Hardware::default());
    let m = motor("m", &hw, "(0, 10)");
    let sw = switcher(&m, None);
    m.init().await.unwrap();
    sw.init().await.unwrap();

    sw.start("out").await.unwrap();
    assert_eq!(sw.read(Some(0.0)).await.unwrap(), Value::from("out"));
    assert_eq!(hw.writes(), 1);

    for _ in 0..3 {
        sw.start("out").await.unwrap();
    }
    assert_eq!(hw.writes(), 1);

    // Within precision still counts as being there.
    hw.jump(5.05);
    sw.start("out").await.unwrap();
    assert_eq!(hw.writes(), 1);
    assert_eq!(sw.read(Some(0.0)).await.unwrap(), Value::from("out"));

    sw.start("in").await.unwrap();
    assert_eq!(hw.writes(), 2);
    assert!(matches!(
        sw.start("half").await.unwrap_err(),
        NicosError::InvalidValue { .. }
    ));
}

#[tokio::test]
async fn test_switcher_unknown_position_is_never_a_nearest_match() {
    let hw = Arc::new(Hardware::default());
    let m = motor("m", &hw, "(0, 10)");
    m.init().await.unwrap();
    hw.jump(4.8);

    let strict = switcher(&m, None);
    assert!(matches!(
        strict.read(Some(0.0)).await.unwrap_err(),
        NicosError::Position { .. }
    ));
    assert_eq!(strict.status(Some(0.0)).await.unwrap().status, Status::NotReached);

    let lenient = switcher(&m, Some("unknown"));
    assert_eq!(lenient.read(Some(0.0)).await.unwrap(), Value::from("unknown"));
    assert_eq!(lenient.status(Some(0.0)).await.unwrap().status, Status::Unknown);
}

// ── Aliases ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_alias_forwards_to_current_target() {
    let (hw1, hw2) = (Arc::new(Hardware::default()), Arc::new(Hardware::default()));
    let m1 = motor("m1", &hw1, "(0, 10)");
    let m2 = motor("m2", &hw2, "(0, 10)");
    let a = Device::builder("mot", alias::class()).build().unwrap();

    a.set_alias(Some(Arc::clone(&m1))).unwrap();
    a.start(3.0).await.unwrap();
    assert_eq!(a.read(Some(0.0)).await.unwrap(), m1.read(Some(0.0)).await.unwrap());
    assert_eq!((hw1.writes(), hw2.writes()), (1, 0));

    a.set_alias(Some(Arc::clone(&m2))).unwrap();
    a.start(7.0).await.unwrap();
    assert_eq!(a.read(Some(0.0)).await.unwrap(), Value::Float(7.0));
    assert_eq!(m1.read(Some(0.0)).await.unwrap(), Value::Float(3.0));
    assert_eq!((hw1.writes(), hw2.writes()), (1, 1));
    assert_eq!(a.unit(), "mm");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_alias_switch_is_atomic_for_readers() {
    let (hw1, hw2) = (Arc::new(Hardware::default()), Arc::new(Hardware::default()));
    hw1.jump(1.0);
    hw2.jump(2.0);
    let m1 = motor("m1", &hw1, "(0, 10)");
    let m2 = motor("m2", &hw2, "(0, 10)");
    let a = Device::builder("mot", alias::class()).build().unwrap();
    a.set_alias(Some(Arc::clone(&m1))).unwrap();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let a = Arc::clone(&a);
            tokio::spawn(async move {
                for _ in 0..500 {
                    let value = a.read(Some(0.0)).await.unwrap().as_f64().unwrap();
                    assert!(
                        (value - 1.0).abs() < f64::EPSILON || (value - 2.0).abs() < f64::EPSILON,
                        "read {value}"
                    );
                }
            })
        })
        .collect();
    for i in 0..500 {
        let target = if i % 2 == 0 { &m2 } else { &m1 };
        a.set_alias(Some(Arc::clone(target))).unwrap();
        tokio::task::yield_now().await;
    }
    for reader in readers {
        reader.await.unwrap();
    }
}

// ── Scenario: T aliasing T_ccr0 ─────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_temperature_alias_scenario() {
    let t_ccr0 = Device::builder("T_ccr0", virtual_temperature::class())
        .param("abslimits", Value::decode("(0, 300)").unwrap())
        .param("precision", 1.0)
        .param("speed", 10.0)
        .param("curvalue", 295.0)
        .build()
        .unwrap();
    t_ccr0.init().await.unwrap();
    let t = Device::builder("T", alias::class()).build().unwrap();
    t.set_alias(Some(Arc::clone(&t_ccr0))).unwrap();

    let err = t.start(350.0).await.unwrap_err();
    assert!(matches!(err, NicosError::Limit { .. }), "{err}");
    assert_eq!(t_ccr0.get("target"), Some(Value::None));
    assert!(!t.status(Some(0.0)).await.unwrap().is_busy());

    t.start(250.0).await.unwrap();
    let waited = tokio::time::timeout(Duration::from_secs(60), t.wait())
        .await
        .unwrap()
        .unwrap();
    let value = t.read(Some(0.0)).await.unwrap().as_f64().unwrap();
    assert!((value - 250.0).abs() <= t_ccr0.precision(), "T = {value}, wait returned {waited}");
    assert_eq!(t.status(Some(0.0)).await.unwrap().status, Status::Ok);
}

// ── Waiting and stopping ────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_error_status_fails_wait_even_with_timeout() {
    let stops = Arc::new(AtomicU64::new(0));
    let j = jammed(true, &stops, 60.0);
    j.init().await.unwrap();
    j.start(1.0).await.unwrap();

    let err = j.wait().await.unwrap_err();
    assert!(
        matches!(&err, NicosError::Move { message, .. } if message.contains("stalled")),
        "{err}"
    );
    assert_eq!(stops.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_wait_timeout_runs_timeout_action() {
    let stops = Arc::new(AtomicU64::new(0));
    let j = jammed(false, &stops, 2.0);
    j.init().await.unwrap();
    j.start(1.0).await.unwrap();

    let began = tokio::time::Instant::now();
    let err = j.wait().await.unwrap_err();
    assert!(matches!(err, NicosError::Timeout { .. }), "{err}");
    assert!(began.elapsed() >= Duration::from_secs(2));
    assert_eq!(stops.load(Ordering::SeqCst), 1);
    assert!(!j.status(Some(0.0)).await.unwrap().is_busy());
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_move_leaves_device_idle_midway() {
    let m = Device::builder("m", virtual_motor::motor_class())
        .param("unit", "mm")
        .param("abslimits", Value::decode("(-100, 100)").unwrap())
        .param("speed", 2.0)
        .build()
        .unwrap();
    m.init().await.unwrap();
    m.start(40.0).await.unwrap();
    assert!(m.status(Some(0.0)).await.unwrap().is_busy());

    tokio::time::sleep(Duration::from_millis(3050)).await;
    m.stop().await.unwrap();
    assert_eq!(m.status(Some(0.0)).await.unwrap().status, Status::Ok);

    let stopped = m.wait().await.unwrap().as_f64().unwrap();
    assert!(stopped > 0.0 && stopped < 40.0, "stopped at {stopped}");
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(m.read(Some(0.0)).await.unwrap(), Value::Float(stopped));
}

#[tokio::test(start_paused = true)]
async fn test_virtual_motor_timeout_stops_the_move() {
    let m = Device::builder("m", virtual_motor::motor_class())
        .param("unit", "mm")
        .param("abslimits", Value::decode("(-100, 100)").unwrap())
        .param("speed", 1.0)
        .param("timeout", 1.5)
        .build()
        .unwrap();
    m.init().await.unwrap();
    m.start(50.0).await.unwrap();

    let err = m.wait().await.unwrap_err();
    assert!(matches!(err, NicosError::Timeout { .. }), "{err}");
    assert_eq!(m.status(Some(0.0)).await.unwrap().status, Status::Ok);
    let value = m.read(Some(0.0)).await.unwrap().as_f64().unwrap();
    assert!(value < 50.0, "motor kept moving to {value}");
}
