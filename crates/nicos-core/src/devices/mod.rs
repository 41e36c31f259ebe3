//! Built-in device classes.

pub mod alias;
pub mod axis;
pub mod manual;
pub mod switcher;
pub mod virtual_motor;
pub mod virtual_temperature;

use crate::device::DeviceRegistry;

/// Register every class of this module.
pub fn register_builtins(registry: &mut DeviceRegistry) {
    registry.register(alias::class());
    registry.register(virtual_motor::motor_class());
    registry.register(virtual_motor::coder_class());
    registry.register(virtual_temperature::class());
    registry.register(manual::move_class());
    registry.register(manual::switch_class());
    registry.register(axis::class());
    registry.register(switcher::switcher_class());
    registry.register(switcher::readonly_switcher_class());
    registry.register(switcher::multi_switcher_class());
    registry.register(switcher::selector_switcher_class());
}
