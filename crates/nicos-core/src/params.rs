// ── Parameter descriptors ──
//
// Every device class declares a schema of named, typed parameters. The
// schema is fixed once the class is built; instances hold one value slot
// per parameter.

use std::fmt;
use std::sync::{PoisonError, RwLock};

use indexmap::IndexMap;
use nicos_proto::Value;

/// Value type of a parameter (or of a moveable's target).
#[derive(Debug, Clone, PartialEq)]
pub enum ParamType {
    Any,
    Bool,
    Int,
    Float,
    /// Float within inclusive bounds.
    FloatRange(f64, f64),
    Str,
    /// One of a fixed set of values.
    OneOf(Vec<Value>),
    /// `None` or the inner type.
    NoneOr(Box<ParamType>),
    ListOf(Box<ParamType>),
    TupleOf(Vec<ParamType>),
    DictOf(Box<ParamType>, Box<ParamType>),
    /// `(low, high)` with `low <= high`.
    Limits,
}

impl ParamType {
    pub fn none_or(inner: ParamType) -> Self {
        Self::NoneOr(Box::new(inner))
    }

    pub fn list_of(inner: ParamType) -> Self {
        Self::ListOf(Box::new(inner))
    }

    pub fn dict_of(key: ParamType, value: ParamType) -> Self {
        Self::DictOf(Box::new(key), Box::new(value))
    }

    pub fn one_of<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::OneOf(values.into_iter().map(Into::into).collect())
    }

    /// Check `value` and convert it to the canonical representation.
    ///
    /// Ints are accepted for floats, lists and tuples are interchangeable,
    /// and the string `"none"` stands in for `None` where allowed (TOML has
    /// no null).
    pub fn validate(&self, value: Value) -> Result<Value, String> {
        match (self, value) {
            (Self::Any, v) => Ok(v),
            (Self::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),
            (Self::Bool, Value::Int(i @ (0 | 1))) => Ok(Value::Bool(i == 1)),
            (Self::Int, Value::Int(i)) => Ok(Value::Int(i)),
            (Self::Float, v @ (Value::Int(_) | Value::Float(_))) => {
                Ok(Value::Float(v.as_f64().unwrap_or_default()))
            }
            (Self::FloatRange(lo, hi), v @ (Value::Int(_) | Value::Float(_))) => {
                let f = v.as_f64().unwrap_or_default();
                if f < *lo || f > *hi {
                    Err(format!("{f} is not within [{lo}, {hi}]"))
                } else {
                    Ok(Value::Float(f))
                }
            }
            (Self::Str, Value::Str(s)) => Ok(Value::Str(s)),
            (Self::OneOf(choices), v) => choices
                .iter()
                .find(|c| c.loosely_equals(&v))
                .cloned()
                .ok_or_else(|| {
                    let allowed: Vec<String> = choices.iter().map(Value::encode).collect();
                    format!("{v} is not one of {}", allowed.join(", "))
                }),
            (Self::NoneOr(_), Value::None) => Ok(Value::None),
            (Self::NoneOr(_), Value::Str(s)) if s.eq_ignore_ascii_case("none") => Ok(Value::None),
            (Self::NoneOr(inner), v) => inner.validate(v),
            (Self::ListOf(inner), Value::List(items) | Value::Tuple(items)) => items
                .into_iter()
                .map(|item| inner.validate(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            (Self::TupleOf(types), Value::List(items) | Value::Tuple(items)) => {
                if types.len() != items.len() {
                    return Err(format!(
                        "expected a sequence of {} elements, got {}",
                        types.len(),
                        items.len()
                    ));
                }
                types
                    .iter()
                    .zip(items)
                    .map(|(ty, item)| ty.validate(item))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Tuple)
            }
            (Self::DictOf(kt, vt), Value::Dict(items)) => items
                .into_iter()
                .map(|(k, v)| Ok((kt.validate(k)?, vt.validate(v)?)))
                .collect::<Result<Vec<_>, String>>()
                .map(Value::Dict),
            (Self::Limits, Value::List(items) | Value::Tuple(items)) => {
                let [lo, hi] = items.as_slice() else {
                    return Err("limits must be a (low, high) pair".into());
                };
                match (lo.as_f64(), hi.as_f64()) {
                    (Some(lo), Some(hi)) if lo <= hi => {
                        Ok(Value::Tuple(vec![Value::Float(lo), Value::Float(hi)]))
                    }
                    (Some(lo), Some(hi)) => {
                        Err(format!("lower limit {lo} is above upper limit {hi}"))
                    }
                    _ => Err("limits must be numbers".into()),
                }
            }
            (ty, v) => Err(format!("{v} ({}) is not a valid {ty}", v.type_name())),
        }
    }

    /// Value used when a parameter declares no explicit default.
    pub fn default_value(&self) -> Value {
        match self {
            Self::Bool => Value::Bool(false),
            Self::Int => Value::Int(0),
            Self::Float => Value::Float(0.0),
            Self::FloatRange(lo, _) => Value::Float(*lo),
            Self::Str => Value::Str(String::new()),
            Self::OneOf(choices) => choices.first().cloned().unwrap_or_default(),
            Self::ListOf(_) => Value::List(Vec::new()),
            Self::TupleOf(types) => Value::Tuple(types.iter().map(Self::default_value).collect()),
            Self::DictOf(..) => Value::Dict(Vec::new()),
            Self::Limits => Value::Tuple(vec![Value::Float(0.0), Value::Float(0.0)]),
            Self::Any | Self::NoneOr(_) => Value::None,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("any value"),
            Self::Bool => f.write_str("bool"),
            Self::Int => f.write_str("int"),
            Self::Float => f.write_str("float"),
            Self::FloatRange(lo, hi) => write!(f, "float in [{lo}, {hi}]"),
            Self::Str => f.write_str("string"),
            Self::OneOf(choices) => {
                let names: Vec<String> = choices.iter().map(Value::encode).collect();
                write!(f, "one of {}", names.join(", "))
            }
            Self::NoneOr(inner) => write!(f, "None or {inner}"),
            Self::ListOf(inner) => write!(f, "list of {inner}"),
            Self::TupleOf(types) => {
                let names: Vec<String> = types.iter().map(ToString::to_string).collect();
                write!(f, "tuple of ({})", names.join(", "))
            }
            Self::DictOf(k, v) => write!(f, "dict of {k} to {v}"),
            Self::Limits => f.write_str("(low, high) limits"),
        }
    }
}

// ── ParamInfo ────────────────────────────────────────────────────────

/// Declaration of a single parameter.
#[derive(Debug, Clone)]
pub struct ParamInfo {
    pub description: String,
    pub ty: ParamType,
    pub unit: String,
    pub default: Option<Value>,
    /// May be changed at runtime via `set_param`.
    pub settable: bool,
    /// Must be given in the setup.
    pub mandatory: bool,
    /// Always read from the hardware instead of the stored value.
    pub volatile: bool,
    /// Shown to users in parameter listings.
    pub userparam: bool,
    /// Grouping for informational dumps (e.g. "general", "limits").
    pub category: Option<String>,
}

impl ParamInfo {
    pub fn new(description: impl Into<String>, ty: ParamType) -> Self {
        Self {
            description: description.into(),
            ty,
            unit: String::new(),
            default: None,
            settable: false,
            mandatory: false,
            volatile: false,
            userparam: true,
            category: None,
        }
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn settable(mut self) -> Self {
        self.settable = true;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn volatile(mut self) -> Self {
        self.volatile = true;
        self
    }

    pub fn internal(mut self) -> Self {
        self.userparam = false;
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// The default, falling back to the type's neutral value.
    pub fn default_value(&self) -> Value {
        self.default
            .clone()
            .unwrap_or_else(|| self.ty.default_value())
    }
}

// ── ParamSchema ──────────────────────────────────────────────────────

/// Ordered parameter declarations of a device class.
#[derive(Debug, Clone, Default)]
pub struct ParamSchema {
    params: IndexMap<String, ParamInfo>,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare (or redeclare) a parameter.
    pub fn insert(&mut self, name: impl Into<String>, info: ParamInfo) {
        self.params.insert(name.into().to_lowercase(), info);
    }

    pub fn get(&self, name: &str) -> Option<&ParamInfo> {
        self.params.get(&name.to_lowercase())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ParamInfo> {
        self.params.get_mut(&name.to_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(&name.to_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamInfo)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

// ── ParamStore ───────────────────────────────────────────────────────

/// Per-instance parameter values, owned by exactly one device.
#[derive(Debug, Default)]
pub struct ParamStore {
    values: RwLock<IndexMap<String, Value>>,
}

impl ParamStore {
    pub fn get(&self, name: &str) -> Option<Value> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name.to_lowercase())
            .cloned()
    }

    pub fn set(&self, name: &str, value: Value) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_lowercase(), value);
    }

    /// All values in declaration order.
    pub fn snapshot(&self) -> Vec<(String, Value)> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

// ── Base parameter sets ──────────────────────────────────────────────

/// Parameters every device has.
pub(crate) fn device_params(schema: &mut ParamSchema) {
    schema.insert(
        "description",
        ParamInfo::new("A description of the device", ParamType::Str).settable(),
    );
    schema.insert(
        "lowlevel",
        ParamInfo::new("Whether the device is hidden from users", ParamType::Bool).internal(),
    );
}

/// Parameters of readable devices.
pub(crate) fn readable_params(schema: &mut ParamSchema) {
    schema.insert(
        "unit",
        ParamInfo::new("Unit of the device main value", ParamType::Str)
            .mandatory()
            .settable(),
    );
    schema.insert(
        "fmtstr",
        ParamInfo::new("Format string for the device value", ParamType::Str)
            .default("%.3f")
            .settable(),
    );
    schema.insert(
        "maxage",
        ParamInfo::new(
            "Maximum age of cached values (None: forever, 0: never cache)",
            ParamType::none_or(ParamType::Float),
        )
        .unit("s")
        .default(6.0)
        .settable(),
    );
    schema.insert(
        "pollinterval",
        ParamInfo::new(
            "Polling interval for value and status (None: never)",
            ParamType::none_or(ParamType::Float),
        )
        .unit("s")
        .default(5.0)
        .settable(),
    );
}

/// Parameters of moveable devices.
pub(crate) fn moveable_params(schema: &mut ParamSchema) {
    schema.insert(
        "target",
        ParamInfo::new("Last target position of a start() action", ParamType::Any).internal(),
    );
    schema.insert(
        "fixed",
        ParamInfo::new("Why the device is fixed (empty if not fixed)", ParamType::Str).internal(),
    );
}

/// Limit parameters.
pub(crate) fn limit_params(schema: &mut ParamSchema) {
    schema.insert(
        "abslimits",
        ParamInfo::new("Absolute limits of the device value", ParamType::Limits)
            .mandatory()
            .category("limits"),
    );
    schema.insert(
        "userlimits",
        ParamInfo::new(
            "User defined limits, must lie within the absolute limits",
            ParamType::Limits,
        )
        .settable()
        .category("limits"),
    );
}

pub(crate) fn timeout_params(schema: &mut ParamSchema) {
    schema.insert(
        "timeout",
        ParamInfo::new(
            "Time limit for waiting on a move (None: no limit)",
            ParamType::none_or(ParamType::Float),
        )
        .unit("s")
        .settable(),
    );
}

pub(crate) fn precision_params(schema: &mut ParamSchema) {
    schema.insert(
        "precision",
        ParamInfo::new("Precision of the device value", ParamType::Float).settable(),
    );
}

/// Extract `(low, high)` from a limits value.
pub fn limits_of(value: &Value) -> Option<(f64, f64)> {
    match value.as_seq()? {
        [lo, hi] => Some((lo.as_f64()?, hi.as_f64()?)),
        _ => None,
    }
}
