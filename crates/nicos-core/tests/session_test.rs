//! Setups loaded from disk into a session, polled into a shared cache.
#![allow(clippy::unwrap_used)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use nicos_core::cache::{CacheBackend, CacheStore};
use nicos_core::{DeviceRegistry, NicosError, PollState, Poller, PollerConfig, Session, SetupInfo};
use nicos_proto::Value;
use pretty_assertions::assert_eq;

// ── Helpers ─────────────────────────────────────────────────────────

const SETUPS: &[(&str, &str)] = &[
    (
        "system",
        r#"
group = "lowlevel"

[sysconfig]
instrument = "demo"

[devices.T]
class = "DeviceAlias"
devclass = "Moveable"
"#,
    ),
    (
        "ccr",
        r#"
description = "closed cycle cryostat"
includes = ["system"]

[devices.T_ccr0]
class = "VirtualTemperature"
abslimits = [0, 300]
pollinterval = 0.3
curvalue = 295.0

[alias_config.T]
T_ccr0 = 200
"#,
    ),
    (
        "stick",
        r#"
description = "high temperature stick"
includes = ["system"]

[devices.T_stick]
class = "VirtualTemperature"
abslimits = [0, 500]
pollinterval = 0.3

[alias_config.T]
T_stick = 300
"#,
    ),
    (
        "motors",
        r#"
[devices.m1]
class = "VirtualMotor"
unit = "mm"
abslimits = [-10, 10]
pollinterval = 0.3

[devices.sw]
class = "Switcher"
moveable = "m1"
mapping = { in = 0.0, out = 5.0 }
precision = 0.01
"#,
    ),
];

/// Write the setups to `dir`, then read them back the way a service does.
fn catalog(dir: &Path) -> Vec<SetupInfo> {
    for (name, text) in SETUPS {
        std::fs::write(dir.join(format!("{name}.toml")), text).unwrap();
    }
    let mut setups: Vec<SetupInfo> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| {
            let path = entry.unwrap().path();
            let name = path.file_stem().unwrap().to_string_lossy().into_owned();
            SetupInfo::from_toml(&name, &std::fs::read_to_string(&path).unwrap()).unwrap()
        })
        .collect();
    setups.sort_by(|a, b| a.name.cmp(&b.name));
    setups
}

fn session(dir: &Path) -> (Session, Arc<CacheStore>) {
    let cache = Arc::new(CacheStore::default());
    let session = Session::new(DeviceRegistry::with_builtins(), catalog(dir))
        .with_cache(Arc::clone(&cache) as Arc<dyn CacheBackend>);
    (session, cache)
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_setups_from_disk_create_devices() {
    let dir = tempfile::tempdir().unwrap();
    let (session, _cache) = session(dir.path());
    assert_eq!(session.setups().count(), 4);

    let report = session.load_setup(&["ccr", "motors"]).await.unwrap();
    assert!(report.failed.is_empty(), "{:?}", report.failed);
    assert_eq!(report.loaded, vec!["system", "ccr", "motors"]);
    assert_eq!(session.sysconfig("instrument").unwrap().as_str(), Some("demo"));

    let sw = session.get_device("SW").unwrap();
    sw.maw("out").await.unwrap();
    let m1 = session.get_device("m1").unwrap();
    assert_eq!(m1.read(Some(0.0)).await.unwrap(), Value::Float(5.0));

    let err = session.destroy_device("m1").await.unwrap_err();
    assert!(matches!(err, NicosError::Usage { .. }), "{err}");
    session.destroy_device("sw").await.unwrap();
    session.destroy_device("m1").await.unwrap();

    session.shutdown().await.unwrap();
    assert!(session.devices().is_empty());
    assert!(session.loaded_setups().is_empty());
}

#[tokio::test]
async fn test_higher_priority_alias_wins_when_setup_is_added() {
    let dir = tempfile::tempdir().unwrap();
    let (session, _cache) = session(dir.path());

    session.load_setup(&["ccr"]).await.unwrap();
    let t = session.get_device("T").unwrap();
    assert_eq!(t.alias_name().as_deref(), Some("T_ccr0"));

    let report = session.load_setup(&["stick"]).await.unwrap();
    assert_eq!(report.aliases, vec![("T".to_owned(), "T_stick".to_owned())]);
    assert_eq!(t.alias_name().as_deref(), Some("T_stick"));

    // 400 K is out of range for T_ccr0 but fine for the stick.
    t.start(400.0).await.unwrap();
    assert_eq!(session.get_device("T_stick").unwrap().get_f64("target"), Some(400.0));

    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_poller_feeds_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let (session, cache) = session(dir.path());
    session.load_setup(&["ccr", "motors"]).await.unwrap();

    let poller = Poller::start(
        session.devices(),
        session.cache().cloned(),
        PollerConfig {
            blacklist: vec!["SW".to_owned()],
            ..PollerConfig::default()
        },
    );
    let mut polled: Vec<&str> = poller.devices().collect();
    polled.sort_unstable();
    assert_eq!(polled, vec!["T_ccr0", "m1"]);

    eventually("first poll", || {
        cache.get("t_ccr0", "value", Value::None) == Value::Float(295.0)
    })
    .await;
    // The alias shows the values of its target.
    eventually("alias rewrite", || {
        cache.get("t", "value", Value::None) == Value::Float(295.0)
    })
    .await;
    assert!(cache.get("t_ccr0", "status", Value::None).as_seq().is_some());

    // A move started elsewhere is picked up through the target key.
    session.get_device("m1").unwrap().start(3.0).await.unwrap();
    eventually("new position", || {
        cache.get("m1", "value", Value::None) == Value::Float(3.0)
    })
    .await;

    let state = poller.state("T_ccr0").unwrap();
    assert!(state.polls >= 1);
    assert_eq!(state.failures, 0);
    assert_ne!(state.state, PollState::Backoff);

    poller.quit().await;
    session.shutdown().await.unwrap();
}
