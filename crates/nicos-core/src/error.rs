// ── Core error types ──
//
// The device-level error taxonomy. Validation errors are raised to the
// caller synchronously and never retried; communication and timeout
// errors are retryable and are what the poller backs off on. The
// `From<nicos_proto::Error>` impl folds every wire failure into
// `Communication`.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Clone, Error)]
pub enum NicosError {
    // ── Setup-time errors ────────────────────────────────────────────
    /// Bad or missing setup parameters; fatal at load.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    // ── Hardware errors ──────────────────────────────────────────────
    /// A hardware (or cache) transaction failed.
    #[error("Communication error: {message}")]
    Communication { message: String },

    /// Device failed to finish within its `timeout`.
    #[error("{device}: timeout after {seconds}s")]
    Timeout { device: String, seconds: f64 },

    /// Device failed to reach its target.
    #[error("{device}: move failed: {message}")]
    Move { device: String, message: String },

    /// Readback does not correspond to any known symbolic position.
    #[error("{device}: unknown position: {message}")]
    Position { device: String, message: String },

    // ── Request validation ───────────────────────────────────────────
    /// Target or parameter value has the wrong type or is not allowed.
    #[error("{device}: invalid value: {message}")]
    InvalidValue { device: String, message: String },

    /// Target lies outside the device limits.
    #[error("{device}: {message}")]
    Limit { device: String, message: String },

    /// Operation not permitted in the current session mode.
    #[error("{device}: {message}")]
    Mode { device: String, message: String },

    /// Operation not supported by this device or in this state.
    #[error("Usage error: {message}")]
    Usage { message: String },

    // ── Lookup ───────────────────────────────────────────────────────
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },
}

impl NicosError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn comm(message: impl Into<String>) -> Self {
        Self::Communication {
            message: message.into(),
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
        }
    }

    pub fn invalid(device: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            device: device.to_owned(),
            message: message.into(),
        }
    }

    pub fn limit(device: &str, message: impl Into<String>) -> Self {
        Self::Limit {
            device: device.to_owned(),
            message: message.into(),
        }
    }

    pub fn position(device: &str, message: impl Into<String>) -> Self {
        Self::Position {
            device: device.to_owned(),
            message: message.into(),
        }
    }

    pub fn device_not_found(name: &str) -> Self {
        Self::NotFound {
            kind: "device",
            name: name.to_owned(),
        }
    }

    /// Returns `true` for failures the poller should retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Communication { .. } | Self::Timeout { .. })
    }

    /// Returns `true` for errors raised while validating a request.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidValue { .. } | Self::Limit { .. } | Self::Configuration { .. }
        )
    }
}

// ── Conversion from wire-layer errors ────────────────────────────────

impl From<nicos_proto::Error> for NicosError {
    fn from(err: nicos_proto::Error) -> Self {
        match err {
            nicos_proto::Error::Value { message, offset } => Self::InvalidValue {
                device: "cache".into(),
                message: format!("{message} (offset {offset})"),
            },
            other => Self::Communication {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_failures_become_retryable_communication_errors() {
        let err: NicosError = nicos_proto::Error::ConnectionClosed.into();
        assert!(matches!(err, NicosError::Communication { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn validation_errors_are_not_retryable() {
        let err = NicosError::limit("m", "moving to 5 is not allowed");
        assert!(!err.is_retryable());
        assert!(err.is_validation());
        assert_eq!(err.to_string(), "m: moving to 5 is not allowed");
    }
}
