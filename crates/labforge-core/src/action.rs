//! The unit of remote work and its lookup registry.
//!
//! Actions are constructed fresh per invocation with injected
//! collaborators and hold no state of their own; `execute` reports plain
//! success or failure and causes side effects only through the context.
//! The registry is an explicit static table populated by direct
//! registration calls at process start, indexed by normalized description.

use crate::DeployError;
use labforge_config::{LabConfig, UnitConfig};
use labforge_remote::{CommandRunner, PkgCoordinator, UnitProvider};

/// What an action is allowed to touch. Declared, not enforced at runtime;
/// the executor never inspects an action beyond its description and this
/// set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    RemoteExec,
    PrivilegedExec,
    PackageOps,
    UnitLifecycle,
}

/// Collaborators injected into every action invocation.
pub struct ActionContext<'a> {
    /// Session into the unit being configured.
    pub runner: &'a mut dyn CommandRunner,
    pub pkg: &'a mut PkgCoordinator,
    pub provider: &'a mut dyn UnitProvider,
    pub unit: &'a UnitConfig,
    pub cfg: &'a LabConfig,
}

pub trait Action {
    /// Immutable description; doubles as the registry key.
    fn describe(&self) -> &'static str;
    fn capabilities(&self) -> &'static [Capability];
    /// Internal failures are caught and converted to `false`.
    fn execute(&mut self, ctx: &mut ActionContext<'_>) -> bool;
}

pub type ActionFactory = fn() -> Box<dyn Action>;

struct RegistryEntry {
    normalized: String,
    display: &'static str,
    factory: ActionFactory,
}

/// Name → implementation lookup table.
#[derive(Default)]
pub struct ActionRegistry {
    entries: Vec<RegistryEntry>,
}

/// Lowercase, with spaces and underscores folded to dashes.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase().replace([' ', '_'], "-")
}

/// Normalized form with separators removed entirely, for the
/// dash/space-insensitive fallback match.
fn squash(name: &str) -> String {
    normalize_name(name).replace('-', "")
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under the description of the action it builds.
    /// A later registration under the same normalized name replaces the
    /// earlier one.
    pub fn register(&mut self, factory: ActionFactory) {
        let display = factory().describe();
        let normalized = normalize_name(display);
        self.entries.retain(|e| e.normalized != normalized);
        self.entries.push(RegistryEntry {
            normalized,
            display,
            factory,
        });
    }

    pub fn descriptions(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.display).collect()
    }

    /// Resolve a configuration-provided name to an implementation.
    ///
    /// Exact normalized match wins; otherwise a unique
    /// separator-insensitive match wins; multiple candidates or none are
    /// errors naming the alternatives.
    pub fn lookup(&self, name: &str) -> Result<Box<dyn Action>, DeployError> {
        let normalized = normalize_name(name);
        if let Some(entry) = self.entries.iter().find(|e| e.normalized == normalized) {
            return Ok((entry.factory)());
        }

        let squashed = squash(name);
        let candidates: Vec<&RegistryEntry> = self
            .entries
            .iter()
            .filter(|e| squash(e.display) == squashed)
            .collect();
        match candidates.as_slice() {
            [entry] => Ok((entry.factory)()),
            [] => Err(DeployError::UnknownAction {
                name: name.to_owned(),
                available: self.descriptions().join(", "),
            }),
            many => Err(DeployError::AmbiguousAction {
                name: name.to_owned(),
                candidates: many.iter().map(|e| e.display).collect::<Vec<_>>().join(", "),
            }),
        }
    }

    /// Plan-construction check: does the name resolve at all?
    pub fn resolves(&self, name: &str) -> Result<(), DeployError> {
        self.lookup(name).map(|_| ())
    }
}
