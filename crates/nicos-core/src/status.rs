// ── Device status ──
//
// Status codes as published in the cache: `(code, 'message')`. A higher
// code is more severe, which is what `multi_status` relies on.

use nicos_proto::Value;
use serde::Serialize;
use strum::{AsRefStr, Display, EnumIter, EnumString};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
    Serialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Warn,
    Busy,
    NotReached,
    Disabled,
    Error,
    Unknown,
}

impl Status {
    pub fn code(self) -> i64 {
        match self {
            Self::Ok => 200,
            Self::Warn => 210,
            Self::Busy => 220,
            Self::NotReached => 230,
            Self::Disabled => 235,
            Self::Error => 240,
            Self::Unknown => 999,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            200 => Self::Ok,
            210 => Self::Warn,
            220 => Self::Busy,
            230 => Self::NotReached,
            235 => Self::Disabled,
            240 => Self::Error,
            999 => Self::Unknown,
            _ => return None,
        })
    }
}

/// A status code with its human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub status: Status,
    pub message: String,
}

impl DeviceStatus {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(Status::Ok, message)
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(Status::Busy, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Status::Error, message)
    }

    pub fn is_busy(&self) -> bool {
        self.status == Status::Busy
    }

    /// Cache form: `(code, 'message')`.
    pub fn to_value(&self) -> Value {
        Value::Tuple(vec![
            Value::Int(self.status.code()),
            Value::Str(self.message.clone()),
        ])
    }

    /// Parse the cache form; unknown codes map to `Unknown`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let [code, message] = value.as_seq()? else {
            return None;
        };
        let status = Status::from_code(code.as_i64()?).unwrap_or(Status::Unknown);
        Some(Self::new(status, message.as_str().unwrap_or_default()))
    }
}

/// Combine statuses of several devices into the most severe one.
///
/// Messages of all devices sharing the worst code are joined, prefixed
/// with the device name.
pub fn multi_status<'a, I>(items: I) -> DeviceStatus
where
    I: IntoIterator<Item = (&'a str, &'a DeviceStatus)>,
{
    let items: Vec<_> = items.into_iter().collect();
    let Some(worst) = items.iter().map(|(_, st)| st.status).max() else {
        return DeviceStatus::ok("");
    };
    let message = items
        .iter()
        .filter(|(_, st)| st.status == worst)
        .map(|(name, st)| {
            if st.message.is_empty() {
                (*name).to_owned()
            } else {
                format!("{name}: {}", st.message)
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    DeviceStatus::new(worst, message)
}
