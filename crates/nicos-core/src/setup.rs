// ── Setup files ──
//
// A setup is a named TOML document declaring devices, the setups it
// includes or excludes, system configuration and alias preferences.
//
// ```toml
// description = "CCR cryostat"
// group = "optional"
// includes = ["base"]
//
// [devices.T_ccr0]
// class = "VirtualTemperature"
// abslimits = [0, 300]
//
// [alias_config.T]
// T_ccr0 = 200
// ```

use indexmap::IndexMap;
use nicos_proto::Value;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::NicosError;

/// What a setup is for; decides whether and how it can be loaded.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SetupGroup {
    /// An instrument's base configuration.
    Basic,
    #[default]
    Optional,
    /// Only loaded as an include.
    Lowlevel,
    /// Service configurations (cache, poller); not loadable in a session.
    Special,
    /// Sample environment announced at runtime.
    Plugplay,
    /// Pure data for other setups; never loaded.
    Configdata,
}

/// One device entry: class name plus parameters and attachments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub class: String,
    #[serde(flatten)]
    pub params: IndexMap<String, toml::Value>,
}

impl DeviceConfig {
    /// Whether the device should be hidden from users.
    pub fn is_lowlevel(&self) -> bool {
        self.params
            .get("lowlevel")
            .and_then(toml::Value::as_bool)
            .unwrap_or(false)
    }

    /// Device names referenced under `key` (one name or a list).
    pub fn device_refs(&self, key: &str) -> Vec<String> {
        match self.params.get(key) {
            Some(toml::Value::String(name)) => vec![name.clone()],
            Some(toml::Value::Array(names)) => names
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SetupInfo {
    #[serde(skip)]
    pub name: String,
    pub description: String,
    pub group: SetupGroup,
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
    pub sysconfig: IndexMap<String, toml::Value>,
    pub devices: IndexMap<String, DeviceConfig>,
    /// Recorded for the script layer; never executed here.
    pub startupcode: String,
    /// alias -> target -> priority (higher wins).
    pub alias_config: IndexMap<String, IndexMap<String, i64>>,
    /// Free-form data for other tools.
    pub extended: toml::Table,
}

impl SetupInfo {
    pub fn from_toml(name: &str, text: &str) -> Result<Self, NicosError> {
        let mut info: Self = toml::from_str(text)
            .map_err(|e| NicosError::config(format!("setup {name}: {}", e.message())))?;
        info.name = name.to_owned();
        Ok(info)
    }

    /// Loaded on demand (e.g. plug-and-play) rather than requested.
    pub fn is_dynamic(&self) -> bool {
        self.extended
            .get("dynamic_loaded")
            .and_then(toml::Value::as_bool)
            .unwrap_or(false)
    }
}

/// Convert a TOML value into a cache value.
pub fn toml_to_value(value: &toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::Str(s.clone()),
        toml::Value::Integer(i) => Value::Int(*i),
        toml::Value::Float(f) => Value::Float(*f),
        toml::Value::Boolean(b) => Value::Bool(*b),
        toml::Value::Datetime(dt) => Value::Str(dt.to_string()),
        toml::Value::Array(items) => Value::List(items.iter().map(toml_to_value).collect()),
        toml::Value::Table(table) => Value::Dict(
            table
                .iter()
                .map(|(k, v)| (Value::Str(k.clone()), toml_to_value(v)))
                .collect(),
        ),
    }
}
