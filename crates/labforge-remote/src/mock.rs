//! Scripted runner and provider for tests.
//!
//! The mock runner answers commands by substring rule, first match wins,
//! with optional per-rule use counts so a command can answer differently
//! on successive calls (a lock that clears after a kill, a service that
//! becomes ready on the third poll). Its call log is a cheaply cloneable
//! handle, so tests keep one before moving the runner into the code under
//! test.

use crate::provider::{UnitProvider, UnitState};
use crate::session::{CommandRunner, Connector, ExecOutcome};
use crate::RemoteError;
use labforge_config::UnitConfig;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub command: String,
    pub elevated: bool,
}

/// Shared view of every command a [`MockRunner`] executed.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<RecordedCall>>>);

impl CallLog {
    fn push(&self, call: RecordedCall) {
        self.0.lock().expect("call log lock").push(call);
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.0
            .lock()
            .expect("call log lock")
            .iter()
            .any(|c| c.command.contains(needle))
    }

    pub fn count(&self, needle: &str) -> usize {
        self.0
            .lock()
            .expect("call log lock")
            .iter()
            .filter(|c| c.command.contains(needle))
            .count()
    }

    pub fn commands(&self) -> Vec<String> {
        self.0
            .lock()
            .expect("call log lock")
            .iter()
            .map(|c| c.command.clone())
            .collect()
    }

    pub fn elevated_count(&self) -> usize {
        self.0
            .lock()
            .expect("call log lock")
            .iter()
            .filter(|c| c.elevated)
            .count()
    }
}

struct Rule {
    needle: String,
    outcome: ExecOutcome,
    /// Remaining uses; `None` means unlimited.
    uses: Option<usize>,
}

#[derive(Default)]
pub struct MockRunner {
    target: String,
    rules: Vec<Rule>,
    log: CallLog,
    refuse_connect: bool,
    connected: bool,
}

impl MockRunner {
    pub fn new() -> Self {
        Self {
            target: "mock@lab".to_owned(),
            ..Self::default()
        }
    }

    /// Answer every command containing `needle` with `outcome`.
    #[must_use]
    pub fn on(mut self, needle: &str, outcome: ExecOutcome) -> Self {
        self.add_rule(needle, outcome, None);
        self
    }

    /// Answer the next `n` commands containing `needle` with `outcome`,
    /// then fall through to later rules.
    #[must_use]
    pub fn on_n(mut self, needle: &str, outcome: ExecOutcome, n: usize) -> Self {
        self.add_rule(needle, outcome, Some(n));
        self
    }

    pub fn add_rule(&mut self, needle: &str, outcome: ExecOutcome, uses: Option<usize>) {
        self.rules.push(Rule {
            needle: needle.to_owned(),
            outcome,
            uses,
        });
    }

    #[must_use]
    pub fn refuse_connect(mut self) -> Self {
        self.refuse_connect = true;
        self
    }

    /// Handle onto the call log, valid after the runner is moved away.
    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    /// Record into an existing log instead of a fresh one, so several
    /// runners (e.g. one per opened session) share a single history.
    #[must_use]
    pub fn with_shared_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.log.ran(needle)
    }

    pub fn count(&self, needle: &str) -> usize {
        self.log.count(needle)
    }
}

impl CommandRunner for MockRunner {
    fn connect(&mut self) -> bool {
        if self.refuse_connect {
            return false;
        }
        self.connected = true;
        true
    }

    fn execute(
        &mut self,
        command: &str,
        _timeout: Option<Duration>,
        elevated: bool,
    ) -> ExecOutcome {
        self.log.push(RecordedCall {
            command: command.to_owned(),
            elevated,
        });
        for rule in &mut self.rules {
            if !command.contains(&rule.needle) {
                continue;
            }
            match &mut rule.uses {
                Some(0) => continue,
                Some(n) => {
                    *n -= 1;
                    return rule.outcome.clone();
                }
                None => return rule.outcome.clone(),
            }
        }
        // Unscripted commands succeed silently.
        ExecOutcome::of("", 0)
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn target(&self) -> &str {
        &self.target
    }
}

/// Connector that hands out scripted runners, all recording into one
/// shared log, and remembers every target it was asked to open.
#[derive(Default)]
pub struct MockConnector {
    log: CallLog,
    rules: Vec<(String, ExecOutcome)>,
    opened: Mutex<Vec<String>>,
    refuse: bool,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script every runner this connector hands out.
    #[must_use]
    pub fn on(mut self, needle: &str, outcome: ExecOutcome) -> Self {
        self.rules.push((needle.to_owned(), outcome));
        self
    }

    #[must_use]
    pub fn refuse(mut self) -> Self {
        self.refuse = true;
        self
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().expect("opened lock").clone()
    }
}

impl Connector for MockConnector {
    fn open(&self, target: &str) -> Result<Box<dyn CommandRunner>, RemoteError> {
        if self.refuse {
            return Err(RemoteError::ConnectFailed(target.to_owned()));
        }
        self.opened
            .lock()
            .expect("opened lock")
            .push(target.to_owned());
        let mut runner = MockRunner::new().with_shared_log(self.log.clone());
        for (needle, outcome) in &self.rules {
            runner.add_rule(needle, outcome.clone(), None);
        }
        Ok(Box::new(runner))
    }
}

/// In-memory unit lifecycle for executor tests. Records every mutation so
/// tests can assert what was (and was not) touched.
pub struct MockProvider {
    runner: MockRunner,
    pub states: BTreeMap<u32, UnitState>,
    pub privileged: BTreeMap<u32, bool>,
    pub created: Vec<u32>,
    pub destroyed: Vec<u32>,
    pub started: Vec<u32>,
    pub access_installed: Vec<u32>,
    pub fail_create: BTreeSet<u32>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            runner: MockRunner::new(),
            states: BTreeMap::new(),
            privileged: BTreeMap::new(),
            created: Vec::new(),
            destroyed: Vec::new(),
            started: Vec::new(),
            access_installed: Vec::new(),
            fail_create: BTreeSet::new(),
        }
    }

    /// Pre-seed an existing unit, as a previous run would have left it.
    pub fn seed(&mut self, id: u32, state: UnitState, privileged: bool) {
        self.states.insert(id, state);
        self.privileged.insert(id, privileged);
    }

    /// Script the embedded host runner (used by `exec_in` and probes).
    pub fn script(&mut self, needle: &str, outcome: ExecOutcome) {
        self.runner.add_rule(needle, outcome, None);
    }

    pub fn exec_log(&self) -> CallLog {
        self.runner.log()
    }
}

impl UnitProvider for MockProvider {
    fn state(&mut self, id: u32) -> UnitState {
        self.states.get(&id).copied().unwrap_or(UnitState::Absent)
    }

    fn is_privileged(&mut self, id: u32) -> Option<bool> {
        self.privileged.get(&id).copied()
    }

    fn create(&mut self, unit: &UnitConfig) -> Result<(), RemoteError> {
        if self.fail_create.contains(&unit.id) {
            return Err(RemoteError::Lifecycle(unit.id, "create failed".to_owned()));
        }
        self.created.push(unit.id);
        self.states.insert(unit.id, UnitState::Stopped);
        self.privileged.insert(unit.id, unit.privileged);
        Ok(())
    }

    fn configure_features(&mut self, _id: u32, _nested: bool) -> Result<(), RemoteError> {
        Ok(())
    }

    fn set_autostart(&mut self, _id: u32, _autostart: bool) -> Result<(), RemoteError> {
        Ok(())
    }

    fn start(&mut self, id: u32) -> Result<(), RemoteError> {
        self.started.push(id);
        self.states.insert(id, UnitState::Running);
        Ok(())
    }

    fn stop(&mut self, id: u32) -> Result<(), RemoteError> {
        self.states.insert(id, UnitState::Stopped);
        Ok(())
    }

    fn destroy(&mut self, id: u32) -> Result<(), RemoteError> {
        self.destroyed.push(id);
        self.states.remove(&id);
        self.privileged.remove(&id);
        Ok(())
    }

    fn exec_in(&mut self, _id: u32, command: &str, timeout: Option<Duration>) -> ExecOutcome {
        self.runner.execute(command, timeout, true)
    }

    fn wait_ready(&mut self, _unit: &UnitConfig) -> bool {
        true
    }

    fn list(&mut self) -> Vec<u32> {
        self.states.keys().copied().collect()
    }

    fn install_access(
        &mut self,
        unit: &UnitConfig,
        _users: &[labforge_config::UserSection],
    ) -> Result<(), RemoteError> {
        self.access_installed.push(unit.id);
        Ok(())
    }

    fn ensure_remote_login(&mut self, _unit: &UnitConfig) -> Result<(), RemoteError> {
        Ok(())
    }

    fn host_runner(&mut self) -> &mut dyn CommandRunner {
        &mut self.runner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labforge_config::ResourceSpec;

    #[test]
    fn rules_match_first_and_respect_counts() {
        let mut runner = MockRunner::new()
            .on_n("pct status 200", ExecOutcome::of("status: stopped", 0), 1)
            .on("pct status 200", ExecOutcome::of("status: running", 0));

        let first = runner.execute("pct status 200", None, false);
        let second = runner.execute("pct status 200", None, false);
        assert_eq!(first.output.unwrap(), "status: stopped");
        assert_eq!(second.output.unwrap(), "status: running");
    }

    #[test]
    fn unscripted_commands_succeed() {
        let mut runner = MockRunner::new();
        let outcome = runner.execute("true", None, false);
        assert!(outcome.succeeded());
        assert_eq!(runner.count("true"), 1);
    }

    #[test]
    fn log_survives_moving_the_runner() {
        let runner = MockRunner::new();
        let log = runner.log();
        let mut boxed: Box<dyn CommandRunner> = Box::new(runner);
        boxed.execute("uptime", None, true);
        assert!(log.ran("uptime"));
        assert_eq!(log.elevated_count(), 1);
    }

    #[test]
    fn provider_tracks_lifecycle() {
        let mut provider = MockProvider::new();
        assert_eq!(provider.state(7), UnitState::Absent);

        let unit = UnitConfig {
            id: 7,
            name: "db".to_owned(),
            hostname: "db".to_owned(),
            address: "10.0.0.7".to_owned(),
            template: None,
            resources: ResourceSpec::default(),
            privileged: true,
            nested: true,
            autostart: true,
            actions: Vec::new(),
            params: toml::Table::new(),
        };
        provider.create(&unit).unwrap();
        provider.start(7).unwrap();
        assert_eq!(provider.state(7), UnitState::Running);
        assert_eq!(provider.is_privileged(7), Some(true));
        provider.destroy(7).unwrap();
        assert_eq!(provider.state(7), UnitState::Absent);
    }
}
