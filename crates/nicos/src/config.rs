//! Configuration resolution: config file and environment, then global flags.

use nicos_config::{Config, SetupCatalog};

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Load the configuration and apply command-line overrides.
pub fn load(global: &GlobalOpts) -> Result<Config, CliError> {
    let mut cfg = nicos_config::load_config(global.config.as_deref())?;
    if let Some(ref addr) = global.cache {
        cfg.cache.address.clone_from(addr);
        cfg.validate()?;
    }
    // Directories given on the command line are searched first.
    let mut paths = global.setup_dirs.clone();
    paths.append(&mut cfg.setups.paths);
    cfg.setups.paths = paths;
    Ok(cfg)
}

/// Read every setup file of the configured directories.
pub fn catalog(cfg: &Config) -> Result<SetupCatalog, CliError> {
    let catalog = SetupCatalog::scan(&cfg.setups.paths)?;
    for (setup, include) in catalog.missing_includes() {
        tracing::warn!(setup = %setup, include = %include, "included setup does not exist");
    }
    Ok(catalog)
}
