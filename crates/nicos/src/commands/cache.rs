//! `nicos cache`: run a cache server until interrupted.

use nicos_config::Config;
use nicos_core::cache::{CacheServer, CacheStore, FlatFileStore};

use crate::cli::{CacheArgs, GlobalOpts};
use crate::error::CliError;

pub async fn handle(args: CacheArgs, cfg: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    let listen = match args.listen {
        Some(addr) => addr,
        None => cfg.cache.addr()?,
    };
    let store = CacheStore::new(&cfg.cache.prefix);
    if let Some(dir) = args.store.as_ref().or(cfg.cache.store_path.as_ref()) {
        let loaded = FlatFileStore::attach(&store, dir)?;
        if !global.quiet {
            eprintln!("loaded {loaded} keys from {}", dir.display());
        }
    }
    let server = CacheServer::bind(&listen, store).await?;
    if !global.quiet {
        eprintln!("cache server listening on {}", server.local_addr());
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupted, shutting down cache server");
    server.shutdown();
    server.join().await;
    Ok(())
}
