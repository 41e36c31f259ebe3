//! Configuration shared by the nicos services and the CLI.
//!
//! `nicos.toml` (platform config dir, or an explicit path) layered over
//! built-in defaults and `NICOS_*` environment variables, the catalog of
//! setup files the configuration points at, and translation into the
//! `nicos_core` runtime types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use nicos_core::cache::RemoteCacheConfig;
use nicos_core::{PollerConfig, SetupInfo};
use nicos_proto::DEFAULT_CACHE_PORT;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("config file {} does not exist", .0.display())]
    MissingFile(PathBuf),

    #[error("setup {name} exists, but could not be read: {reason}")]
    BrokenSetup { name: String, reason: String },

    #[error("setup {0} does not exist")]
    UnknownSetup(String),

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub setups: SetupSettings,

    #[serde(default)]
    pub poller: PollerSettings,

    /// Default log filter when neither `-v` nor `RUST_LOG` is given.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheSettings::default(),
            setups: SetupSettings::default(),
            poller: PollerSettings::default(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CacheSettings {
    /// `host[:port]` of the cache server; also the listen address of
    /// `nicos cache`.
    #[serde(default = "default_cache_address")]
    pub address: String,

    /// First key component of every device key.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Directory where `nicos cache` keeps its values across restarts;
    /// unset keeps them in memory only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            address: default_cache_address(),
            prefix: default_prefix(),
            connect_timeout_secs: default_connect_timeout(),
            store_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SetupSettings {
    /// Directories searched (recursively) for `*.toml` setup files.
    #[serde(default = "default_setup_paths")]
    pub paths: Vec<PathBuf>,
}

impl Default for SetupSettings {
    fn default() -> Self {
        Self {
            paths: default_setup_paths(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct PollerSettings {
    /// Devices never polled.
    #[serde(default)]
    pub blacklist: Vec<String>,

    /// Bound on a single poll; unset uses the poller's default.
    pub poll_timeout_secs: Option<u64>,
}

fn default_log_level() -> String {
    "warn".into()
}
fn default_cache_address() -> String {
    format!("localhost:{DEFAULT_CACHE_PORT}")
}
fn default_prefix() -> String {
    nicos_core::cache::DEFAULT_PREFIX.into()
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_setup_paths() -> Vec<PathBuf> {
    vec![PathBuf::from("setups")]
}

// ── Validation and translation ──────────────────────────────────────

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.addr()?;
        if self.cache.prefix.is_empty() || self.cache.prefix.contains('/') {
            return Err(ConfigError::Validation {
                field: "cache.prefix".into(),
                reason: format!("expected a single key component, got '{}'", self.cache.prefix),
            });
        }
        if self.cache.connect_timeout_secs == 0 {
            return Err(ConfigError::Validation {
                field: "cache.connect_timeout_secs".into(),
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

impl CacheSettings {
    /// The server address with the default port filled in.
    pub fn addr(&self) -> Result<String, ConfigError> {
        let address = self.address.trim();
        let invalid = |reason: String| ConfigError::Validation {
            field: "cache.address".into(),
            reason,
        };
        match address.rsplit_once(':') {
            _ if address.is_empty() => Err(invalid("address is empty".into())),
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(invalid(format!("missing host in '{address}'")));
                }
                port.parse::<u16>()
                    .map_err(|_| invalid(format!("invalid port in '{address}'")))?;
                Ok(address.to_owned())
            }
            None => Ok(format!("{address}:{DEFAULT_CACHE_PORT}")),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Connection settings for a `RemoteCache`.
    pub fn remote_config(&self) -> Result<RemoteCacheConfig, ConfigError> {
        let mut config = RemoteCacheConfig::new(self.addr()?);
        config.prefix.clone_from(&self.prefix);
        config.connect_timeout = self.connect_timeout();
        Ok(config)
    }
}

impl PollerSettings {
    pub fn to_poller_config(&self) -> PollerConfig {
        let mut config = PollerConfig {
            blacklist: self.blacklist.clone(),
            ..PollerConfig::default()
        };
        if let Some(secs) = self.poll_timeout_secs {
            config.poll_timeout = Duration::from_secs(secs);
        }
        config
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("org", "nicos", "nicos").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("nicos.toml");
            p
        },
        |dirs| dirs.config_dir().join("nicos.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("nicos");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the configuration from defaults, the config file and the
/// environment (`NICOS_LOG_LEVEL`, `NICOS_CACHE__ADDRESS`, ...).
///
/// An explicit `path` must exist; the default location is optional.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = match path {
        Some(path) if !path.exists() => return Err(ConfigError::MissingFile(path.to_owned())),
        Some(path) => path.to_owned(),
        None => config_path(),
    };

    let config: Config = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(&path))
        .merge(
            // NICOS_CACHE, NICOS_CONFIG etc. belong to the command line.
            Env::prefixed("NICOS_")
                .filter(|key| {
                    key.as_str().contains("__") || key.as_str().eq_ignore_ascii_case("log_level")
                })
                .split("__"),
        )
        .extract()?;
    config.validate()?;
    Ok(config)
}

/// Serialize config to TOML and write it to `path`.
pub fn save_config(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, toml::to_string_pretty(cfg)?)?;
    Ok(())
}

// ── Setup catalog ───────────────────────────────────────────────────

/// Every setup file found under the configured directories.
///
/// Setups are named after their file stem. A file that fails to parse is
/// remembered as broken, so loading it reports the parse error instead of
/// "does not exist".
#[derive(Debug, Default)]
pub struct SetupCatalog {
    setups: IndexMap<String, SetupInfo>,
    files: IndexMap<String, PathBuf>,
    broken: IndexMap<String, String>,
}

impl SetupCatalog {
    /// Scan `paths` recursively. Missing directories are skipped.
    pub fn scan<P: AsRef<Path>>(paths: &[P]) -> Result<Self, ConfigError> {
        let mut catalog = Self::default();
        for dir in paths {
            let dir = dir.as_ref();
            if !dir.is_dir() {
                tracing::warn!(path = %dir.display(), "setup directory does not exist");
                continue;
            }
            catalog.scan_dir(dir)?;
        }
        catalog.setups.sort_keys();
        tracing::debug!(
            setups = catalog.setups.len(),
            broken = catalog.broken.len(),
            "setup files read"
        );
        Ok(catalog)
    }

    fn scan_dir(&mut self, dir: &Path) -> Result<(), ConfigError> {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<_, _>>()?;
        entries.sort();
        for path in entries {
            if path.is_dir() {
                self.scan_dir(&path)?;
            } else if path.extension().is_some_and(|ext| ext == "toml") {
                self.read_file(&path)?;
            }
        }
        Ok(())
    }

    fn read_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let Some(name) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
            return Ok(());
        };
        if let Some(first) = self.files.get(&name) {
            tracing::warn!(
                setup = %name,
                used = %first.display(),
                ignored = %path.display(),
                "setup defined twice"
            );
            return Ok(());
        }
        let text = std::fs::read_to_string(path)?;
        match SetupInfo::from_toml(&name, &text) {
            Ok(info) => {
                self.setups.insert(name.clone(), info);
            }
            Err(e) => {
                tracing::error!(setup = %name, path = %path.display(), error = %e, "could not read setup");
                self.broken.insert(name.clone(), e.to_string());
            }
        }
        self.files.insert(name, path.to_owned());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.setups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.setups.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.setups.keys().map(String::as_str)
    }

    pub fn setups(&self) -> impl Iterator<Item = &SetupInfo> {
        self.setups.values()
    }

    /// A readable setup, or why it cannot be used.
    pub fn get(&self, name: &str) -> Result<&SetupInfo, ConfigError> {
        if let Some(reason) = self.broken.get(name) {
            return Err(ConfigError::BrokenSetup {
                name: name.to_owned(),
                reason: reason.clone(),
            });
        }
        self.setups
            .get(name)
            .ok_or_else(|| ConfigError::UnknownSetup(name.to_owned()))
    }

    /// File a setup was read from.
    pub fn path(&self, name: &str) -> Option<&Path> {
        self.files.get(name).map(PathBuf::as_path)
    }

    /// Setups that could not be parsed, with the reason.
    pub fn broken(&self) -> impl Iterator<Item = (&str, &str)> {
        self.broken.iter().map(|(n, r)| (n.as_str(), r.as_str()))
    }

    /// `(setup, include)` pairs naming setups that do not exist.
    pub fn missing_includes(&self) -> Vec<(String, String)> {
        self.setups
            .values()
            .flat_map(|info| {
                info.includes
                    .iter()
                    .filter(|inc| !self.files.contains_key(*inc))
                    .map(|inc| (info.name.clone(), inc.clone()))
            })
            .collect()
    }

    pub fn into_setups(self) -> Vec<SetupInfo> {
        self.setups.into_values().collect()
    }
}
