// ── Device alias ──
//
// The target lives in an `ArcSwapOption`: a switch is one atomic store,
// and each forwarded operation loads the target once, so no call sees a
// half-switched alias.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use nicos_proto::Value;

use crate::device::{Body, Device, DeviceClass};
use crate::error::NicosError;
use crate::params::{ParamInfo, ParamType};

/// Storage for the current alias target.
#[derive(Default)]
pub struct AliasSlot {
    target: ArcSwapOption<Device>,
}

impl AliasSlot {
    pub fn load(&self) -> Option<Arc<Device>> {
        self.target.load_full()
    }

    fn swap(&self, target: Option<Arc<Device>>) -> Option<Arc<Device>> {
        self.target.swap(target)
    }
}

pub fn class() -> Arc<DeviceClass> {
    DeviceClass::builder("DeviceAlias")
        .description("Indirection to another device, retargetable at runtime")
        .param(
            "alias",
            ParamInfo::new("Name of the device the alias points to", ParamType::Str)
                .category("general"),
        )
        .param(
            "devclass",
            ParamInfo::new(
                "Class (or Readable/Moveable) every target must satisfy",
                ParamType::Str,
            )
            .internal(),
        )
        .alias()
        .build()
}

impl Device {
    /// Name of the current alias target (empty if unset).
    pub fn alias_name(&self) -> Option<String> {
        match &self.body {
            Body::Alias(slot) => Some(slot.load().map(|t| t.name.clone()).unwrap_or_default()),
            Body::Driver(_) => None,
        }
    }

    /// Point the alias at `target` (or nowhere).
    ///
    /// The new target must satisfy `devclass` and must not lead back to
    /// the alias. The change is published as the `alias` parameter and
    /// registered as a cache rewrite, so the target's values also appear
    /// under the alias name.
    pub fn set_alias(&self, target: Option<Arc<Device>>) -> Result<(), NicosError> {
        let Body::Alias(slot) = &self.body else {
            return Err(NicosError::usage(format!("{} is not an alias", self.name)));
        };
        if let Some(new) = &target {
            let resolved = self.resolve_chain(new)?;
            let devclass = self.get_str("devclass");
            if !devclass.is_empty() && !resolved.class.satisfies(&devclass) {
                return Err(NicosError::config(format!(
                    "{}: {} (class {}) cannot be used as target, a {devclass} is required",
                    self.name, new.name, resolved.class.name
                )));
            }
        }

        let new_name = target.as_ref().map(|t| t.name.clone()).unwrap_or_default();
        let old = slot.swap(target);
        let old_name = old.map(|t| t.name.clone()).unwrap_or_default();
        if old_name == new_name {
            return Ok(());
        }
        self.update_param("alias", Value::from(new_name.as_str()));

        if let Some(cache) = &self.cache {
            let own = format!("{}/{}", cache.prefix(), self.name).to_lowercase();
            cache.remove_rewrite(&own);
            if !new_name.is_empty() {
                cache.add_rewrite(&own, &format!("{}/{new_name}", cache.prefix()).to_lowercase());
            }
        }
        tracing::info!(alias = %self.name, from = %old_name, to = %new_name, "alias switched");
        Ok(())
    }

    /// Follow alias chains from `start`, refusing cycles through `self`.
    fn resolve_chain(&self, start: &Arc<Device>) -> Result<Arc<Device>, NicosError> {
        let mut current = Arc::clone(start);
        loop {
            if current.name.eq_ignore_ascii_case(&self.name) {
                return Err(NicosError::config(format!(
                    "{}: setting the alias to {} would create a cycle",
                    self.name, start.name
                )));
            }
            let next = match &current.body {
                Body::Alias(slot) => slot.load(),
                Body::Driver(_) => None,
            };
            match next {
                Some(next) => current = next,
                None => return Ok(current),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cache::{CacheBackend, CacheStore};
    use crate::device::DeviceRegistry;

    fn motor(registry: &DeviceRegistry, name: &str) -> Arc<Device> {
        Device::builder(name, registry.get("VirtualMotor").unwrap())
            .param("unit", "mm")
            .param("abslimits", Value::decode("(0, 100)").unwrap())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn unset_alias_is_a_configuration_error() {
        let alias = Device::builder("T", class()).build().unwrap();
        let err = alias.read(None).await.unwrap_err();
        assert!(matches!(err, NicosError::Configuration { .. }));
        assert_eq!(alias.alias_name(), Some(String::new()));
    }

    #[test]
    fn devclass_is_enforced() {
        let registry = DeviceRegistry::with_builtins();
        let alias = Device::builder("m", class())
            .param("devclass", "VirtualCoder")
            .build()
            .unwrap();
        assert!(alias.set_alias(Some(motor(&registry, "m1"))).is_err());
        assert_eq!(alias.alias_name(), Some(String::new()));
    }

    #[test]
    fn cycles_are_refused() {
        let a = Device::builder("a", class()).build().unwrap();
        let b = Device::builder("b", class()).build().unwrap();
        b.set_alias(Some(Arc::clone(&a))).unwrap();
        assert!(a.set_alias(Some(b)).is_err());
    }

    #[test]
    fn switching_registers_a_rewrite() {
        let registry = DeviceRegistry::with_builtins();
        let store = CacheStore::default();
        let cache: Arc<dyn CacheBackend> = Arc::new(store.clone());
        let alias = Device::builder("mot", class())
            .cache(Arc::clone(&cache))
            .build()
            .unwrap();
        alias.set_alias(Some(motor(&registry, "m1"))).unwrap();
        assert_eq!(store.get("mot", "alias", Value::None), Value::from("m1"));

        store.set("m1", "value", Value::Float(3.0), crate::cache::now(), None);
        assert_eq!(store.get("mot", "value", Value::None), Value::Float(3.0));
    }
}
