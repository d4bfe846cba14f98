//! The resumable deployment executor.
//!
//! Drives a [`DeployPlan`] through its execution window with a monotonic
//! step counter. Stages entirely before the window are skipped but still
//! counted, so resumed runs report the same absolute step numbers as full
//! ones. Within an entered stage, a skipped creation step reuses the
//! existing unit, except that a privilege mode disagreeing with
//! configuration forces a destroy-and-recreate regardless of the window.
//! The first failed creation or action aborts the run with a typed error
//! naming the stage, absolute step, and operation.

use crate::action::{ActionContext, ActionRegistry};
use crate::plan::{DeployPlan, Stage, StageKind};
use crate::signal::shutdown_requested;
use crate::verify::{probe_services, ProbeFailure};
use crate::DeployError;
use labforge_config::{LabConfig, UnitConfig};
use labforge_remote::{
    CommandRunner, Connector, PkgCoordinator, RemoteError, UnitProvider, UnitState,
};
use tracing::{debug, info, warn};

/// Executor lifecycle. `Building` covers plan construction, which happens
/// in [`DeployPlan::build`] before an executor exists; a constructed
/// executor starts out `Planned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    Building,
    Planned,
    Executing,
    Completed,
    Failed,
    StoppedAtWindow,
}

/// What a finished (or window-stopped) run looked like.
#[derive(Debug)]
pub struct RunReport {
    pub state: ExecState,
    /// Last step counted, including skipped and the overshooting step that
    /// closed the window.
    pub last_step: usize,
    pub probe_failures: Vec<ProbeFailure>,
}

enum Flow {
    Continue,
    Stop,
}

pub struct Executor<'a> {
    cfg: &'a LabConfig,
    plan: DeployPlan,
    provider: &'a mut dyn UnitProvider,
    connector: &'a dyn Connector,
    registry: &'a ActionRegistry,
    current: usize,
    state: ExecState,
}

impl<'a> Executor<'a> {
    pub fn new(
        cfg: &'a LabConfig,
        plan: DeployPlan,
        provider: &'a mut dyn UnitProvider,
        connector: &'a dyn Connector,
        registry: &'a ActionRegistry,
    ) -> Self {
        Self {
            cfg,
            plan,
            provider,
            connector,
            registry,
            current: 0,
            state: ExecState::Planned,
        }
    }

    pub fn state(&self) -> ExecState {
        self.state
    }

    pub fn plan(&self) -> &DeployPlan {
        &self.plan
    }

    pub fn run(&mut self) -> Result<RunReport, DeployError> {
        self.state = ExecState::Executing;
        if let Err(e) = self.run_stages() {
            self.state = ExecState::Failed;
            return Err(e);
        }

        if self.state == ExecState::Executing {
            self.state = ExecState::Completed;
        }

        let failures = probe_services(self.provider.host_runner(), self.cfg);
        if !failures.is_empty() {
            let summary = failures
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("\n");
            if self.plan.window.end == self.plan.total_steps {
                // A full run must leave every service answering.
                self.state = ExecState::Failed;
                return Err(DeployError::ProbesFailed(summary));
            }
            warn!("service probes failed on a windowed run (tolerated):\n{summary}");
        }

        Ok(RunReport {
            state: self.state,
            last_step: self.current,
            probe_failures: failures,
        })
    }

    fn run_stages(&mut self) -> Result<(), DeployError> {
        info!("==================================================");
        info!("Executing deployment");
        info!("==================================================");
        for index in 0..self.plan.stages.len() {
            if shutdown_requested() {
                return Err(DeployError::Interrupted(self.current + 1));
            }
            let stage = self.plan.stages[index].clone();
            let stage_end = self.current + stage.size();
            if self.plan.window.start > stage_end {
                info!(
                    "skipping stage '{}' (steps {}-{} are before the window)",
                    stage.label,
                    self.current + 1,
                    stage_end
                );
                self.current = stage_end;
                continue;
            }

            let flow = if stage.kind.is_compute() {
                self.run_compute_stage(&stage)?
            } else {
                self.run_single_step(&stage)?
            };
            if matches!(flow, Flow::Stop) {
                info!(
                    "reached end step {}, stopping deployment",
                    self.plan.window.end
                );
                self.state = ExecState::StoppedAtWindow;
                return Ok(());
            }
        }
        Ok(())
    }

    fn run_compute_stage(&mut self, stage: &Stage) -> Result<Flow, DeployError> {
        let unit = self.stage_unit(stage)?;

        self.current += 1;
        if self.current > self.plan.window.end {
            return Ok(Flow::Stop);
        }
        if self.current < self.plan.window.start {
            info!(
                "skipping '{}' creation (step {} < start step {})",
                stage.label, self.current, self.plan.window.start
            );
            self.reuse_or_recreate(stage, &unit)?;
        } else {
            self.log_step(&stage.label, "create unit");
            self.provision(&unit)
                .map_err(|e| self.step_error(stage, "create unit", &e))?;
            info!("unit '{}' created", stage.label);
        }

        let mut session: Option<Box<dyn CommandRunner>> = None;
        let mut pkg = PkgCoordinator::new(&self.cfg.packages, &self.cfg.waits);
        let mut flow = Flow::Continue;

        for action_name in &stage.actions {
            self.current += 1;
            if self.current < self.plan.window.start {
                debug!(
                    "skipping action '{action_name}' (step {} < start step {})",
                    self.current, self.plan.window.start
                );
                continue;
            }
            if self.current > self.plan.window.end {
                flow = Flow::Stop;
                break;
            }
            self.log_step(&stage.label, action_name);

            let mut action = self.registry.lookup(action_name)?;
            if session.is_none() {
                let target = format!("{}@{}", self.cfg.default_user(), unit.address);
                session = Some(
                    self.connector
                        .open(&target)
                        .map_err(|e| self.step_error(stage, action_name, &e))?,
                );
            }
            let runner = session.as_mut().expect("session opened above").as_mut();
            let ok = action.execute(&mut ActionContext {
                runner,
                pkg: &mut pkg,
                provider: &mut *self.provider,
                unit: &unit,
                cfg: self.cfg,
            });
            if !ok {
                return Err(self.step_error(stage, action_name, &"action reported failure"));
            }
            info!("action '{action_name}' completed for '{}'", stage.label);
        }

        if let Some(mut session) = session {
            session.disconnect();
        }

        // Template units exist only to produce an archive; tear them down
        // once their actions have run.
        if stage.kind == StageKind::Template {
            info!("destroying template unit '{}' after processing", stage.label);
            self.provider
                .destroy(unit.id)
                .map_err(|e| self.step_error(stage, "destroy template unit", &e))?;
        }

        Ok(flow)
    }

    fn run_single_step(&mut self, stage: &Stage) -> Result<Flow, DeployError> {
        self.current += 1;
        if self.current < self.plan.window.start {
            info!(
                "skipping '{}' (step {} < start step {})",
                stage.label, self.current, self.plan.window.start
            );
            return Ok(Flow::Continue);
        }
        if self.current > self.plan.window.end {
            return Ok(Flow::Stop);
        }
        self.log_step(&stage.label, &stage.label);

        let unit_id = stage
            .unit_id
            .ok_or_else(|| DeployError::MissingUnit(stage.label.clone()))?;
        let unit = self
            .cfg
            .unit_by_id(unit_id)
            .cloned()
            .ok_or_else(|| DeployError::MissingUnit(format!("unit id {unit_id}")))?;

        let mut action = self.registry.lookup(&stage.label)?;
        let target = format!("{}@{}", self.cfg.default_user(), unit.address);
        let mut session = self
            .connector
            .open(&target)
            .map_err(|e| self.step_error(stage, &stage.label, &e))?;
        let mut pkg = PkgCoordinator::new(&self.cfg.packages, &self.cfg.waits);
        let ok = action.execute(&mut ActionContext {
            runner: session.as_mut(),
            pkg: &mut pkg,
            provider: &mut *self.provider,
            unit: &unit,
            cfg: self.cfg,
        });
        session.disconnect();
        if !ok {
            return Err(self.step_error(stage, &stage.label, &"operation reported failure"));
        }
        Ok(Flow::Continue)
    }

    /// Creation was skipped by the window: the unit must already exist.
    /// A privilege-mode mismatch forces a recreate regardless of the
    /// window; a stopped unit is started; a missing unit is an error.
    fn reuse_or_recreate(&mut self, stage: &Stage, unit: &UnitConfig) -> Result<(), DeployError> {
        let state = self.provider.state(unit.id);
        if state == UnitState::Absent {
            return Err(DeployError::MissingOnResume {
                unit: unit.name.clone(),
                step: self.current,
            });
        }

        if let Some(privileged) = self.provider.is_privileged(unit.id) {
            if privileged != unit.privileged {
                info!(
                    "unit '{}' exists but its privilege mode does not match configuration, \
                     destroying and recreating",
                    unit.name
                );
                return self
                    .provision(unit)
                    .map_err(|e| self.step_error(stage, "recreate unit", &e));
            }
        }

        info!("unit '{}' already exists, reusing", unit.name);
        if state == UnitState::Stopped {
            self.provider
                .start(unit.id)
                .map_err(|e| self.step_error(stage, "start unit", &e))?;
            self.provider.wait_ready(unit);
        }
        Ok(())
    }

    /// Full creation path: destroy any leftover, create from template,
    /// configure, start, wait, and install access.
    fn provision(&mut self, unit: &UnitConfig) -> Result<(), RemoteError> {
        self.provider.destroy(unit.id)?;
        self.provider.create(unit)?;
        if let Err(e) = self.provider.configure_features(unit.id, unit.nested) {
            // Feature configuration failing is survivable; the unit still
            // boots without nesting.
            warn!("feature configuration for unit {} failed: {e}", unit.id);
        }
        self.provider.set_autostart(unit.id, unit.autostart)?;
        self.provider.start(unit.id)?;
        self.provider.wait_ready(unit);
        self.provider.install_access(unit, &self.cfg.users)?;
        self.provider.ensure_remote_login(unit)?;
        Ok(())
    }

    fn stage_unit(&self, stage: &Stage) -> Result<UnitConfig, DeployError> {
        let id = stage
            .unit_id
            .ok_or_else(|| DeployError::MissingUnit(stage.label.clone()))?;
        if stage.kind == StageKind::Template {
            return self
                .cfg
                .templates
                .iter()
                .find(|t| t.id == id)
                .map(labforge_config::TemplateConfig::as_unit)
                .ok_or_else(|| DeployError::MissingUnit(stage.label.clone()));
        }
        self.cfg
            .unit_by_id(id)
            .cloned()
            .ok_or_else(|| DeployError::MissingUnit(stage.label.clone()))
    }

    fn log_step(&self, label: &str, operation: &str) {
        let pct = self.current * 100 / self.plan.total_steps.max(1);
        info!("==================================================");
        info!(
            "[Overall: {pct}%] [Step: {}/{}] Executing: {label} - {operation}",
            self.current, self.plan.total_steps
        );
        info!("==================================================");
    }

    fn step_error(
        &self,
        stage: &Stage,
        operation: &str,
        detail: &dyn std::fmt::Display,
    ) -> DeployError {
        DeployError::Step {
            stage: stage.label.clone(),
            step: self.current,
            operation: operation.to_owned(),
            detail: detail.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, Capability};
    use crate::plan::DeployPlan;
    use labforge_remote::{MockConnector, MockProvider};

    struct Nop(&'static str);
    impl Action for Nop {
        fn describe(&self) -> &'static str {
            self.0
        }
        fn capabilities(&self) -> &'static [Capability] {
            &[Capability::RemoteExec]
        }
        fn execute(&mut self, ctx: &mut ActionContext<'_>) -> bool {
            // Leave a trace on the unit session so tests can assert which
            // steps actually ran.
            ctx.runner
                .execute(&format!("marker {}", self.describe()), None, false);
            true
        }
    }

    struct Broken;
    impl Action for Broken {
        fn describe(&self) -> &'static str {
            "broken action"
        }
        fn capabilities(&self) -> &'static [Capability] {
            &[Capability::RemoteExec]
        }
        fn execute(&mut self, _ctx: &mut ActionContext<'_>) -> bool {
            false
        }
    }

    fn registry() -> ActionRegistry {
        let mut reg = ActionRegistry::new();
        reg.register(|| Box::new(Nop("alpha step")));
        reg.register(|| Box::new(Nop("beta step")));
        reg.register(|| Box::new(Nop("gamma step")));
        reg.register(|| Box::new(Nop(crate::plan::CLUSTER_BOOTSTRAP)));
        reg.register(|| Box::new(Broken));
        reg
    }

    /// Two compute stages sized (1+3) and (1+2): total 7 steps.
    fn two_stage_config() -> LabConfig {
        labforge_config::parse_config_str(
            r#"
            cache_unit = "cache"
            [host]
            address = "root@virt.lab"
            gateway = "10.0.0.1"
            [[units]]
            id = 200
            name = "cache"
            hostname = "cache"
            address = "10.0.0.200"
            actions = ["alpha step", "beta step", "gamma step"]
            [[units]]
            id = 210
            name = "db"
            hostname = "db"
            address = "10.0.0.210"
            actions = ["alpha step", "beta step"]
        "#,
        )
        .unwrap()
    }

    fn run(
        cfg: &LabConfig,
        provider: &mut MockProvider,
        start: usize,
        end: Option<usize>,
    ) -> Result<RunReport, DeployError> {
        let reg = registry();
        let connector = MockConnector::new();
        let plan = DeployPlan::build(cfg, &reg, start, end).unwrap();
        let mut executor = Executor::new(cfg, plan, provider, &connector, &reg);
        executor.run()
    }

    #[test]
    fn full_run_provisions_everything_in_order() {
        let cfg = two_stage_config();
        let mut provider = MockProvider::new();
        let report = run(&cfg, &mut provider, 1, None).unwrap();

        assert_eq!(report.state, ExecState::Completed);
        assert_eq!(report.last_step, 7);
        assert_eq!(provider.created, vec![200, 210]);
        assert_eq!(provider.access_installed, vec![200, 210]);
        assert!(report.probe_failures.is_empty());
    }

    #[test]
    fn window_skips_first_stage_entirely() {
        // Stages sized (1+3) then (1+2): total 7. Window [5,7] must touch
        // nothing of the first stage, then execute steps 5, 6, 7.
        let cfg = two_stage_config();
        let mut provider = MockProvider::new();
        let report = run(&cfg, &mut provider, 5, Some(7)).unwrap();

        assert_eq!(report.state, ExecState::Completed);
        assert_eq!(report.last_step, 7);
        // First unit untouched even though it does not exist.
        assert_eq!(provider.created, vec![210]);
        assert!(provider.destroyed.contains(&210));
        assert!(!provider.destroyed.contains(&200));
    }

    #[test]
    fn execution_halts_the_instant_the_window_closes() {
        let cfg = two_stage_config();
        let mut provider = MockProvider::new();
        let connector = MockConnector::new();
        let reg = registry();
        let plan = DeployPlan::build(&cfg, &reg, 1, Some(2)).unwrap();
        let mut executor = Executor::new(&cfg, plan, &mut provider, &connector, &reg);
        let report = executor.run().unwrap();

        assert_eq!(report.state, ExecState::StoppedAtWindow);
        // Step 1 creates, step 2 runs the first action, step 3 overshoots.
        assert!(connector.log().ran("marker alpha step"));
        assert!(!connector.log().ran("marker beta step"));
        assert_eq!(provider.created, vec![200]);
    }

    #[test]
    fn steps_before_window_start_have_no_side_effects() {
        let cfg = two_stage_config();
        let mut provider = MockProvider::new();
        // Window [4,7]: stage one is entered (its interval is 1-4), its
        // creation and first two actions are skipped, only "gamma step"
        // (step 4) runs.
        provider.seed(200, UnitState::Running, false);
        let connector = MockConnector::new();
        let reg = registry();
        let plan = DeployPlan::build(&cfg, &reg, 4, None).unwrap();
        let mut executor = Executor::new(&cfg, plan, &mut provider, &connector, &reg);
        executor.run().unwrap();

        assert!(!connector.log().ran("marker alpha step"));
        assert!(!connector.log().ran("marker beta step"));
        assert!(connector.log().ran("marker gamma step"));
        assert!(provider.created.contains(&210));
        assert!(!provider.created.contains(&200));
    }

    #[test]
    fn resume_reuses_existing_matching_unit() {
        let cfg = two_stage_config();
        let mut provider = MockProvider::new();
        provider.seed(210, UnitState::Stopped, false);
        // Window [6,7]: db's creation step (5) is skipped, db exists with a
        // matching privilege mode, so it is started and reused.
        let report = run(&cfg, &mut provider, 6, None).unwrap();

        assert_eq!(report.state, ExecState::Completed);
        assert!(provider.created.is_empty());
        assert_eq!(provider.started, vec![210]);
    }

    #[test]
    fn privilege_mismatch_recreates_despite_window() {
        let mut cfg = two_stage_config();
        cfg.units[1].privileged = true;
        let mut provider = MockProvider::new();
        provider.seed(210, UnitState::Running, false);
        let report = run(&cfg, &mut provider, 6, None).unwrap();

        assert_eq!(report.state, ExecState::Completed);
        assert!(provider.destroyed.contains(&210));
        assert_eq!(provider.created, vec![210]);
    }

    #[test]
    fn missing_unit_on_resume_is_a_typed_error() {
        let cfg = two_stage_config();
        let mut provider = MockProvider::new();
        let err = run(&cfg, &mut provider, 6, None).unwrap_err();
        assert!(matches!(
            err,
            DeployError::MissingOnResume { ref unit, step: 5 } if unit == "db"
        ));
    }

    #[test]
    fn action_failure_aborts_with_stage_and_step() {
        let mut cfg = two_stage_config();
        cfg.units[0].actions = vec!["alpha step".to_owned(), "broken action".to_owned()];
        let mut provider = MockProvider::new();
        let err = run(&cfg, &mut provider, 1, None).unwrap_err();

        let DeployError::Step {
            stage,
            step,
            operation,
            ..
        } = err
        else {
            panic!("expected Step error, got {err}");
        };
        assert_eq!(stage, "cache");
        assert_eq!(step, 3);
        assert_eq!(operation, "broken action");
        // Nothing past the failure ran.
        assert!(!provider.created.contains(&210));
    }

    #[test]
    fn creation_failure_aborts_the_run() {
        let cfg = two_stage_config();
        let mut provider = MockProvider::new();
        provider.fail_create.insert(200);
        let err = run(&cfg, &mut provider, 1, None).unwrap_err();
        assert!(matches!(
            err,
            DeployError::Step { ref operation, step: 1, .. } if operation == "create unit"
        ));
    }

    #[test]
    fn template_stage_destroys_its_unit_after_actions() {
        let cfg = labforge_config::parse_config_str(
            r#"
            cache_unit = "cache"
            [host]
            address = "root@virt.lab"
            gateway = "10.0.0.1"
            [[units]]
            id = 200
            name = "cache"
            hostname = "cache"
            address = "10.0.0.200"
            [[templates]]
            id = 150
            name = "base-template"
            hostname = "base"
            address = "10.0.0.150"
            actions = ["alpha step"]
        "#,
        )
        .unwrap();
        let mut provider = MockProvider::new();
        run(&cfg, &mut provider, 1, None).unwrap();

        assert!(provider.created.contains(&150));
        // Destroyed once pre-create (leftover sweep) and once at teardown.
        assert!(provider.destroyed.iter().filter(|id| **id == 150).count() >= 2);
        assert_eq!(provider.state(150), UnitState::Absent);
    }

    #[test]
    fn cluster_bootstrap_runs_as_its_own_step() {
        let cfg = labforge_config::parse_config_str(
            r#"
            cache_unit = "cache"
            [host]
            address = "root@virt.lab"
            gateway = "10.0.0.1"
            [[units]]
            id = 200
            name = "cache"
            hostname = "cache"
            address = "10.0.0.200"
            [[units]]
            id = 301
            name = "ctl"
            hostname = "ctl"
            address = "10.0.0.31"
            [cluster]
            control = [301]
        "#,
        )
        .unwrap();
        let mut provider = MockProvider::new();
        let reg = registry();
        let connector = MockConnector::new();
        let plan = DeployPlan::build(&cfg, &reg, 1, None).unwrap();
        assert_eq!(plan.total_steps, 3);
        let mut executor = Executor::new(&cfg, plan, &mut provider, &connector, &reg);
        let report = executor.run().unwrap();

        assert_eq!(report.state, ExecState::Completed);
        assert!(connector.log().ran("marker cluster bootstrap"));
        // The bootstrap session targets the control node.
        assert!(connector.opened().iter().any(|t| t.contains("10.0.0.31")));
    }

    #[test]
    fn probe_failures_fatal_only_on_full_runs() {
        let mut cfg = two_stage_config();
        cfg.services.push(labforge_config::ServiceProbe {
            name: "cache".to_owned(),
            unit: "cache".to_owned(),
            port: 3142,
            udp: false,
        });
        // The mock provider's host runner answers probes with empty
        // output, so every probe fails.
        let mut provider = MockProvider::new();
        let err = run(&cfg, &mut provider, 1, None).unwrap_err();
        assert!(matches!(err, DeployError::ProbesFailed(_)));

        // The same failing probe is tolerated on a windowed run.
        let mut provider = MockProvider::new();
        provider.seed(200, UnitState::Running, false);
        provider.seed(210, UnitState::Running, false);
        let report = run(&cfg, &mut provider, 2, Some(6)).unwrap();
        assert_eq!(report.probe_failures.len(), 1);
        assert_eq!(report.state, ExecState::StoppedAtWindow);
    }
}
