//! CLI error types with miette diagnostics.
//!
//! Maps `NicosError` and `ConfigError` into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use nicos_config::ConfigError;
use nicos_core::NicosError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const CONFIG: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const LIMIT: i32 = 5;
    pub const DEVICE: i32 = 6;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not connect to the cache at {addr}")]
    #[diagnostic(
        code(nicos::connection_failed),
        help(
            "Check that a cache server is running: nicos cache\n\
             Address: {addr} (set with --cache or cache.address in nicos.toml)"
        )
    )]
    ConnectionFailed { addr: String, reason: String },

    #[error("Communication error: {message}")]
    #[diagnostic(code(nicos::communication))]
    Communication { message: String },

    // ── Resources ────────────────────────────────────────────────────
    #[error("{kind} '{name}' not found")]
    #[diagnostic(code(nicos::not_found), help("Run: nicos {list_command}"))]
    NotFound {
        kind: String,
        name: String,
        list_command: String,
    },

    #[error("No value for key {key}")]
    #[diagnostic(code(nicos::no_value))]
    NoValue { key: String },

    // ── Devices ──────────────────────────────────────────────────────
    #[error("{message}")]
    #[diagnostic(code(nicos::limit), help("Check the device limits with: nicos read {device}"))]
    Limit { device: String, message: String },

    #[error("{message}")]
    #[diagnostic(code(nicos::device))]
    Device { message: String },

    #[error("{device} did not finish within {seconds}s")]
    #[diagnostic(code(nicos::timeout))]
    Timeout { device: String, seconds: f64 },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(nicos::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("{message}")]
    #[diagnostic(
        code(nicos::config),
        help("Setup directories are set with --setup-dir or setups.paths in nicos.toml")
    )]
    Configuration { message: String },

    #[error(transparent)]
    #[diagnostic(code(nicos::config))]
    Config(ConfigError),

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } | Self::Communication { .. } => exit_code::CONNECTION,
            Self::NotFound { .. } | Self::NoValue { .. } => exit_code::NOT_FOUND,
            Self::Limit { .. } => exit_code::LIMIT,
            Self::Device { .. } => exit_code::DEVICE,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. } => exit_code::USAGE,
            Self::Configuration { .. } | Self::Config(_) => exit_code::CONFIG,
            Self::Io(_) => exit_code::GENERAL,
        }
    }
}

// ── Core errors → CliError ───────────────────────────────────────────

impl From<NicosError> for CliError {
    fn from(err: NicosError) -> Self {
        match err {
            NicosError::Configuration { message } => Self::Configuration { message },
            NicosError::Communication { message } => Self::Communication { message },
            NicosError::Timeout { device, seconds } => Self::Timeout { device, seconds },
            NicosError::NotFound { kind, name } => Self::NotFound {
                kind: kind.into(),
                name,
                list_command: "setups list".into(),
            },
            NicosError::Limit { device, message } => Self::Limit {
                message: format!("{device}: {message}"),
                device,
            },
            NicosError::InvalidValue { device, message } => Self::Validation {
                field: device,
                reason: message,
            },
            NicosError::Usage { message } => Self::Validation {
                field: "arguments".into(),
                reason: message,
            },
            other => Self::Device {
                message: other.to_string(),
            },
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::UnknownSetup(name) => Self::NotFound {
                kind: "setup".into(),
                name,
                list_command: "setups list".into(),
            },
            other => Self::Config(other),
        }
    }
}

impl From<nicos_proto::Error> for CliError {
    fn from(err: nicos_proto::Error) -> Self {
        NicosError::from(err).into()
    }
}
