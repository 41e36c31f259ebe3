//! `nicos poller`: poll the devices of setups into the cache until interrupted.

use std::sync::Arc;

use nicos_config::Config;
use nicos_core::cache::CacheBackend;
use nicos_core::{DeviceRegistry, Mode, Poller, Session};

use super::util;
use crate::cli::{GlobalOpts, PollerArgs};
use crate::config;
use crate::error::CliError;

pub async fn handle(args: PollerArgs, cfg: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    let catalog = config::catalog(cfg)?;
    for name in &args.setups {
        catalog.get(name)?;
    }
    let remote = util::remote_cache(cfg).await?;

    // The poller only mirrors hardware into the cache; it never drives devices.
    let session = Session::new(DeviceRegistry::with_builtins(), catalog.into_setups())
        .with_mode(Mode::Slave)
        .with_cache(Arc::clone(&remote) as Arc<dyn CacheBackend>);
    let names: Vec<&str> = args.setups.iter().map(String::as_str).collect();
    let report = session.load_setup(&names).await?;
    for (device, error) in &report.failed {
        tracing::warn!(device = %device, error = %error, "device not polled");
    }

    let mut poller_config = cfg.poller.to_poller_config();
    poller_config.blacklist.extend(args.blacklist);
    if let Some(timeout) = args.poll_timeout {
        poller_config.poll_timeout = timeout;
    }
    let poller = Poller::start(session.devices(), session.cache().cloned(), poller_config);
    if !global.quiet {
        let mut devices: Vec<&str> = poller.devices().collect();
        devices.sort_unstable();
        eprintln!("polling {} device(s): {}", devices.len(), devices.join(", "));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupted, stopping poller");
    poller.quit().await;
    let result = session.shutdown().await;
    remote.shutdown();
    Ok(result?)
}
