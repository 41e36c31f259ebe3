//! Shared helpers for command handlers.

use std::sync::Arc;

use nicos_config::Config;
use nicos_core::cache::{CacheBackend, RemoteCache};
use nicos_core::{DeviceRegistry, Mode, Session};
use nicos_proto::{CacheClient, Value};

use crate::cli::SessionOpts;
use crate::config;
use crate::error::CliError;

/// Open a line-protocol connection to the configured cache.
pub async fn connect(cfg: &Config) -> Result<CacheClient, CliError> {
    let addr = cfg.cache.addr()?;
    CacheClient::connect(&addr, cfg.cache.connect_timeout())
        .await
        .map_err(|e| CliError::ConnectionFailed {
            addr,
            reason: e.to_string(),
        })
}

/// Start a mirrored cache connection and wait for the initial sync.
pub async fn remote_cache(cfg: &Config) -> Result<Arc<RemoteCache>, CliError> {
    let remote = Arc::new(RemoteCache::connect(cfg.cache.remote_config()?));
    if remote.wait_connected(cfg.cache.connect_timeout()).await {
        Ok(remote)
    } else {
        remote.shutdown();
        Err(CliError::ConnectionFailed {
            addr: cfg.cache.addr()?,
            reason: "no answer within the connect timeout".into(),
        })
    }
}

/// A session with `opts.setup` loaded.
///
/// Device creation failures are logged; the session keeps the devices that
/// could be created.
pub async fn open_session(
    cfg: &Config,
    opts: &SessionOpts,
    mode: Mode,
) -> Result<(Session, Option<Arc<RemoteCache>>), CliError> {
    let catalog = config::catalog(cfg)?;
    for name in &opts.setup {
        catalog.get(name)?;
    }

    let remote = if opts.no_cache {
        None
    } else {
        Some(remote_cache(cfg).await?)
    };
    let mut session =
        Session::new(DeviceRegistry::with_builtins(), catalog.into_setups()).with_mode(mode);
    if let Some(ref remote) = remote {
        session = session.with_cache(Arc::clone(remote) as Arc<dyn CacheBackend>);
    }
    if let Some(timeout) = opts.io_timeout {
        session = session.with_io_timeout(timeout);
    }

    let names: Vec<&str> = opts.setup.iter().map(String::as_str).collect();
    let report = session.load_setup(&names).await?;
    for (device, error) in &report.failed {
        tracing::warn!(device = %device, error = %error, "device not available");
    }
    Ok((session, remote))
}

/// Shut down a session opened with [`open_session`].
pub async fn close_session(
    session: Session,
    remote: Option<Arc<RemoteCache>>,
) -> Result<(), CliError> {
    let result = session.shutdown().await;
    if let Some(remote) = remote {
        remote.shutdown();
    }
    Ok(result?)
}

/// Expand `device/param` to a full key under `prefix`; longer keys are kept.
pub fn full_key(prefix: &str, key: &str) -> String {
    let key = key.trim_matches('/').to_lowercase();
    if key.matches('/').count() >= 2 {
        key
    } else {
        format!("{prefix}/{key}")
    }
}

/// Parse a value literal.
pub fn parse_value(text: &str) -> Result<Value, CliError> {
    Value::decode(text).map_err(|e| CliError::Validation {
        field: "value".into(),
        reason: format!("'{text}' is not a valid value literal: {e}"),
    })
}

/// Parse a move target: a value literal, or a bare word taken as a string.
pub fn parse_target(text: &str) -> Value {
    Value::decode(text).unwrap_or_else(|_| Value::from(text))
}

/// Seconds since the epoch as local time, or `-`.
#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
pub fn format_time(time: Option<f64>) -> String {
    time.and_then(|t| chrono::DateTime::from_timestamp_micros((t * 1e6).round() as i64))
        .map_or_else(
            || "-".into(),
            |dt| {
                dt.with_timezone(&chrono::Local)
                    .format("%Y-%m-%d %H:%M:%S%.3f")
                    .to_string()
            },
        )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn short_keys_get_the_prefix() {
        assert_eq!(full_key("nicos", "T/value"), "nicos/t/value");
        assert_eq!(full_key("nicos", "inst/m1/target"), "inst/m1/target");
        assert_eq!(full_key("nicos", "/m1/unit/"), "nicos/m1/unit");
    }

    #[test]
    fn targets_fall_back_to_strings() {
        assert_eq!(parse_target("2.5"), Value::Float(2.5));
        assert_eq!(parse_target("'in'"), Value::from("in"));
        assert_eq!(parse_target("out"), Value::from("out"));
        assert!(parse_value("(1,").is_err());
    }

    #[test]
    fn missing_times_render_as_dash() {
        assert_eq!(format_time(None), "-");
        assert!(format_time(Some(0.0)).starts_with("19"));
    }
}
