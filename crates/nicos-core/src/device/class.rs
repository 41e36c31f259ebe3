// ── Device classes and registry ──
//
// A class bundles a parameter schema (composed from capability sets),
// attachment roles and a driver factory. Setups refer to classes by name;
// the registry is filled by explicit registration at startup.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use nicos_proto::Value;

use super::driver::Driver;
use crate::params::{self, ParamInfo, ParamSchema};

pub type DriverFactory = Arc<dyn Fn() -> Box<dyn Driver> + Send + Sync>;

/// Behaviour selected per class instead of an inheritance chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub moveable: bool,
    /// `abslimits` / `userlimits` checked on every start.
    pub limits: bool,
    /// `timeout` applied to `wait`.
    pub timeout: bool,
    pub precision: bool,
}

/// An attached-device role.
#[derive(Debug, Clone)]
pub struct AttachSpec {
    pub role: String,
    pub description: String,
    pub optional: bool,
    /// Accepts a list of devices instead of exactly one.
    pub multiple: bool,
}

pub enum DeviceKind {
    Driver(DriverFactory),
    /// Forwards to a retargetable device.
    Alias,
}

pub struct DeviceClass {
    pub name: String,
    pub description: String,
    pub caps: Capabilities,
    pub schema: ParamSchema,
    pub attachments: Vec<AttachSpec>,
    pub kind: DeviceKind,
}

impl fmt::Debug for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceClass")
            .field("name", &self.name)
            .field("caps", &self.caps)
            .field("params", &self.schema.len())
            .finish_non_exhaustive()
    }
}

impl DeviceClass {
    pub fn builder(name: impl Into<String>) -> DeviceClassBuilder {
        DeviceClassBuilder {
            name: name.into(),
            description: String::new(),
            caps: Capabilities::default(),
            params: Vec::new(),
            defaults: Vec::new(),
            attachments: Vec::new(),
            kind: None,
        }
    }

    pub fn is_alias(&self) -> bool {
        matches!(self.kind, DeviceKind::Alias)
    }

    pub fn attachment(&self, role: &str) -> Option<&AttachSpec> {
        self.attachments.iter().find(|a| a.role == role)
    }

    /// Whether a device of this class satisfies `wanted` (a class name or
    /// the capability names `Readable` / `Moveable`).
    pub fn satisfies(&self, wanted: &str) -> bool {
        match wanted.to_lowercase().as_str() {
            "" | "readable" | "device" => true,
            "moveable" => self.caps.moveable,
            other => short_name(&self.name).eq_ignore_ascii_case(short_name(other)),
        }
    }
}

fn short_name(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

// ── Builder ──────────────────────────────────────────────────────────

pub struct DeviceClassBuilder {
    name: String,
    description: String,
    caps: Capabilities,
    params: Vec<(String, ParamInfo)>,
    defaults: Vec<(String, Value)>,
    attachments: Vec<AttachSpec>,
    kind: Option<DeviceKind>,
}

impl DeviceClassBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn moveable(mut self) -> Self {
        self.caps.moveable = true;
        self
    }

    pub fn limits(mut self) -> Self {
        self.caps.limits = true;
        self
    }

    pub fn timeout(mut self) -> Self {
        self.caps.timeout = true;
        self
    }

    pub fn precision(mut self) -> Self {
        self.caps.precision = true;
        self
    }

    /// Declare a class parameter (replaces a base parameter of that name).
    pub fn param(mut self, name: &str, info: ParamInfo) -> Self {
        self.params.push((name.to_owned(), info));
        self
    }

    /// Change the default of an inherited parameter; it stops being mandatory.
    pub fn default(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.defaults.push((name.to_owned(), value.into()));
        self
    }

    pub fn attach(self, role: &str, description: &str) -> Self {
        self.attach_spec(role, description, false, false)
    }

    pub fn attach_optional(self, role: &str, description: &str) -> Self {
        self.attach_spec(role, description, true, false)
    }

    pub fn attach_many(self, role: &str, description: &str, optional: bool) -> Self {
        self.attach_spec(role, description, optional, true)
    }

    fn attach_spec(mut self, role: &str, description: &str, optional: bool, multiple: bool) -> Self {
        self.attachments.push(AttachSpec {
            role: role.to_lowercase(),
            description: description.to_owned(),
            optional,
            multiple,
        });
        self
    }

    pub fn driver<F, D>(mut self, factory: F) -> Self
    where
        F: Fn() -> D + Send + Sync + 'static,
        D: Driver + 'static,
    {
        self.kind = Some(DeviceKind::Driver(Arc::new(move || -> Box<dyn Driver> {
            Box::new(factory())
        })));
        self
    }

    pub fn alias(mut self) -> Self {
        self.kind = Some(DeviceKind::Alias);
        self
    }

    pub fn build(self) -> Arc<DeviceClass> {
        let kind = self.kind.unwrap_or(DeviceKind::Alias);
        let mut schema = ParamSchema::new();
        params::device_params(&mut schema);
        if !matches!(kind, DeviceKind::Alias) {
            params::readable_params(&mut schema);
        }
        if self.caps.moveable {
            params::moveable_params(&mut schema);
        }
        if self.caps.limits {
            params::limit_params(&mut schema);
        }
        if self.caps.timeout {
            params::timeout_params(&mut schema);
        }
        if self.caps.precision {
            params::precision_params(&mut schema);
        }
        for (name, info) in self.params {
            schema.insert(name, info);
        }
        for (name, value) in self.defaults {
            if let Some(info) = schema.get_mut(&name) {
                info.default = Some(value);
                info.mandatory = false;
            }
        }

        Arc::new(DeviceClass {
            name: self.name,
            description: self.description,
            caps: self.caps,
            schema,
            attachments: self.attachments,
            kind,
        })
    }
}

// ── Registry ─────────────────────────────────────────────────────────

/// Symbolic class name -> class, filled by explicit registration.
#[derive(Debug, Default, Clone)]
pub struct DeviceRegistry {
    classes: IndexMap<String, Arc<DeviceClass>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with all classes shipped in this crate.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::devices::register_builtins(&mut registry);
        registry
    }

    pub fn register(&mut self, class: Arc<DeviceClass>) {
        self.classes.insert(class.name.to_lowercase(), class);
    }

    /// Look up by name; dotted paths resolve by their last component.
    pub fn get(&self, name: &str) -> Option<Arc<DeviceClass>> {
        let lower = name.to_lowercase();
        self.classes
            .get(&lower)
            .or_else(|| self.classes.get(short_name(&lower)))
            .cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.classes.values().map(|c| c.name.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_compose_parameter_sets() {
        let class = DeviceClass::builder("Test")
            .moveable()
            .limits()
            .default("unit", "mm")
            .alias()
            .build();
        assert!(class.schema.contains("target"));
        assert!(class.schema.contains("abslimits"));
        assert!(!class.schema.contains("timeout"));
        // Aliases carry no readable parameters of their own.
        assert!(!class.schema.contains("fmtstr"));
    }

    #[test]
    fn registry_resolves_dotted_paths() {
        let registry = DeviceRegistry::with_builtins();
        let class = registry.get("nicos.devices.generic.VirtualMotor").unwrap();
        assert_eq!(class.name, "VirtualMotor");
        assert!(class.caps.moveable);
        assert!(registry.get("NoSuchClass").is_none());
    }

    #[test]
    fn satisfies_capability_names() {
        let registry = DeviceRegistry::with_builtins();
        let motor = registry.get("VirtualMotor").unwrap();
        assert!(motor.satisfies("Moveable"));
        assert!(motor.satisfies("nicos.devices.generic.VirtualMotor"));
        let coder = registry.get("VirtualCoder").unwrap();
        assert!(!coder.satisfies("Moveable"));
    }
}
