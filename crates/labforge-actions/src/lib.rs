//! Built-in deployment actions.
//!
//! Each action is a thin composition over its injected collaborators; the
//! per-service installation detail lives in configuration (scripts,
//! package lists, params), not here. The registry is built once behind a
//! process-wide init guard and is read-only afterwards.

pub mod bootstrap;
pub mod packaging;
pub mod script;
pub mod services;

use labforge_config::UnitConfig;
use labforge_core::ActionRegistry;
use std::sync::OnceLock;

/// The registry of every built-in action, built once per process.
pub fn builtin() -> &'static ActionRegistry {
    static REGISTRY: OnceLock<ActionRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut reg = ActionRegistry::new();
        reg.register(|| Box::new(packaging::SystemUpgrade));
        reg.register(|| Box::new(packaging::BaseToolsInstall));
        reg.register(|| Box::new(packaging::PackageProxyConfigure));
        reg.register(|| Box::new(packaging::PackageSourcesFix));
        reg.register(|| Box::new(packaging::DisablePackageTimers));
        reg.register(|| Box::new(services::ServiceEnablement));
        reg.register(|| Box::new(services::WaitServiceReady));
        reg.register(|| Box::new(script::RunScript));
        reg.register(|| Box::new(bootstrap::ClusterBootstrap));
        reg.register(|| Box::new(bootstrap::StorageBootstrap));
        reg
    })
}

/// String param from a unit's free-form table.
pub(crate) fn param_str<'u>(unit: &'u UnitConfig, key: &str) -> Option<&'u str> {
    unit.params.get(key).and_then(toml::Value::as_str)
}

/// Integer param from a unit's free-form table.
pub(crate) fn param_int(unit: &UnitConfig, key: &str) -> Option<i64> {
    unit.params.get(key).and_then(toml::Value::as_integer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_resolves_every_description() {
        let reg = builtin();
        for name in [
            "system upgrade",
            "base tools installation",
            "package proxy configuration",
            "package sources fix",
            "disable automatic package timers",
            "service enablement",
            "wait service ready",
            "run script",
            "cluster bootstrap",
            "storage bootstrap",
        ] {
            assert!(reg.lookup(name).is_ok(), "missing builtin action {name}");
        }
    }

    #[test]
    fn builtin_registry_is_cached() {
        assert!(std::ptr::eq(builtin(), builtin()));
    }
}
