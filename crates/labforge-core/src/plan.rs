//! Deployment plan construction.
//!
//! A plan is an ordered stage list with a contiguous step-number interval
//! per stage. Stage order is fixed: shared infrastructure first, then
//! templates, regular units, cluster member units, the cluster and storage
//! bootstraps, and finally any custom post-steps. `total_steps` is frozen
//! when the plan is built; execution only ever reads it.

use crate::action::ActionRegistry;
use crate::DeployError;
use labforge_config::LabConfig;

pub const CLUSTER_BOOTSTRAP: &str = "cluster bootstrap";
pub const STORAGE_BOOTSTRAP: &str = "storage bootstrap";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    SharedInfra,
    Template,
    Unit,
    ClusterUnit,
    ClusterBootstrap,
    StorageBootstrap,
    PostStep,
}

impl StageKind {
    /// Compute stages provision a unit and own `1 + actions` steps;
    /// bootstrap and post-step stages own exactly one.
    pub fn is_compute(self) -> bool {
        matches!(
            self,
            Self::SharedInfra | Self::Template | Self::Unit | Self::ClusterUnit
        )
    }
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub kind: StageKind,
    /// Unit name for compute stages, operation name otherwise.
    pub label: String,
    pub unit_id: Option<u32>,
    pub actions: Vec<String>,
}

impl Stage {
    pub fn size(&self) -> usize {
        if self.kind.is_compute() {
            1 + self.actions.len()
        } else {
            1
        }
    }
}

/// Inclusive `[start, end]` range of steps a run may execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone)]
pub struct DeployPlan {
    pub stages: Vec<Stage>,
    pub total_steps: usize,
    pub window: Window,
}

impl DeployPlan {
    /// Build the stage list in fixed priority order and freeze the step
    /// total. Fails on an unresolvable shared-infra unit, an action name
    /// the registry cannot resolve, or a window outside `[1, total]`.
    pub fn build(
        cfg: &LabConfig,
        registry: &ActionRegistry,
        start_step: usize,
        end_step: Option<usize>,
    ) -> Result<Self, DeployError> {
        let mut stages = Vec::new();

        let cache = cfg
            .unit_by_name(&cfg.cache_unit)
            .ok_or_else(|| DeployError::MissingUnit(cfg.cache_unit.clone()))?;
        stages.push(Stage {
            kind: StageKind::SharedInfra,
            label: cache.name.clone(),
            unit_id: Some(cache.id),
            actions: cache.actions.clone(),
        });

        for template in &cfg.templates {
            stages.push(Stage {
                kind: StageKind::Template,
                label: template.name.clone(),
                unit_id: Some(template.id),
                actions: template.actions.clone(),
            });
        }

        for unit in cfg.regular_units() {
            stages.push(Stage {
                kind: StageKind::Unit,
                label: unit.name.clone(),
                unit_id: Some(unit.id),
                actions: unit.actions.clone(),
            });
        }

        let cluster_ids = cfg.cluster_member_ids();
        for id in &cluster_ids {
            let unit = cfg
                .unit_by_id(*id)
                .ok_or_else(|| DeployError::MissingUnit(format!("unit id {id}")))?;
            stages.push(Stage {
                kind: StageKind::ClusterUnit,
                label: unit.name.clone(),
                unit_id: Some(unit.id),
                actions: unit.actions.clone(),
            });
        }

        if !cluster_ids.is_empty() {
            stages.push(Stage {
                kind: StageKind::ClusterBootstrap,
                label: CLUSTER_BOOTSTRAP.to_owned(),
                unit_id: cluster_ids.first().copied(),
                actions: Vec::new(),
            });
        }

        if let Some(storage) = &cfg.storage {
            stages.push(Stage {
                kind: StageKind::StorageBootstrap,
                label: STORAGE_BOOTSTRAP.to_owned(),
                unit_id: storage.members.first().copied(),
                actions: Vec::new(),
            });
        }

        if let Some(cluster) = &cfg.cluster {
            for step in &cluster.post_steps {
                stages.push(Stage {
                    kind: StageKind::PostStep,
                    label: step.clone(),
                    unit_id: cluster.control.first().copied(),
                    actions: Vec::new(),
                });
            }
        }

        // Every name the plan will ever look up must resolve now;
        // --planonly runs exactly this far and no further.
        for stage in &stages {
            if stage.kind.is_compute() {
                for action in &stage.actions {
                    registry.resolves(action)?;
                }
            } else {
                registry.resolves(&stage.label)?;
            }
        }

        let total_steps: usize = stages.iter().map(Stage::size).sum();
        let end = end_step.unwrap_or(total_steps);
        if start_step < 1 || start_step > end || end > total_steps {
            return Err(DeployError::InvalidWindow {
                start: start_step,
                end,
                total: total_steps,
            });
        }

        Ok(Self {
            stages,
            total_steps,
            window: Window {
                start: start_step,
                end,
            },
        })
    }

    /// Numbered step table with RUN/skip markers.
    pub fn render(&self) -> String {
        let mut out = format!(
            "Deploy plan (total {} steps, running {}-{}):\n",
            self.total_steps, self.window.start, self.window.end
        );
        let mut step = 0_usize;
        let mut push = |step: &mut usize, label: String, window: Window| {
            *step += 1;
            let marker = if window.start <= *step && *step <= window.end {
                "RUN "
            } else {
                "skip"
            };
            out.push_str(&format!("  [{step:>3}] {marker} {label}\n"));
        };
        for stage in &self.stages {
            if stage.kind.is_compute() {
                let verb = if stage.kind == StageKind::Template {
                    "create template"
                } else {
                    "create unit"
                };
                push(&mut step, format!("{}: {verb}", stage.label), self.window);
                for action in &stage.actions {
                    push(&mut step, format!("{}: {action}", stage.label), self.window);
                }
            } else {
                push(&mut step, stage.label.clone(), self.window);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionContext, Capability};

    struct Nop(&'static str);
    impl Action for Nop {
        fn describe(&self) -> &'static str {
            self.0
        }
        fn capabilities(&self) -> &'static [Capability] {
            &[Capability::RemoteExec]
        }
        fn execute(&mut self, _ctx: &mut ActionContext<'_>) -> bool {
            true
        }
    }

    fn registry() -> ActionRegistry {
        let mut reg = ActionRegistry::new();
        reg.register(|| Box::new(Nop("system upgrade")));
        reg.register(|| Box::new(Nop("base tools installation")));
        reg.register(|| Box::new(Nop("service enablement")));
        reg.register(|| Box::new(Nop(CLUSTER_BOOTSTRAP)));
        reg.register(|| Box::new(Nop(STORAGE_BOOTSTRAP)));
        reg.register(|| Box::new(Nop("install cluster tooling")));
        reg
    }

    fn config(toml: &str) -> LabConfig {
        labforge_config::parse_config_str(toml).unwrap()
    }

    fn full_config() -> LabConfig {
        config(
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
            actions = ["system upgrade", "base tools installation", "service enablement"]

            [[units]]
            id = 210
            name = "db"
            hostname = "db"
            address = "10.0.0.210"
            actions = ["system upgrade", "base tools installation"]

            [[units]]
            id = 301
            name = "ctl"
            hostname = "ctl"
            address = "10.0.0.31"
            actions = ["system upgrade"]

            [[units]]
            id = 302
            name = "wrk"
            hostname = "wrk"
            address = "10.0.0.32"
            actions = []

            [cluster]
            control = [301]
            workers = [302]
            post_steps = ["install cluster tooling"]

            [storage]
            volume_name = "vol0"
            brick_path = "/data/brick"
            mount_point = "/mnt/shared"
            members = [301, 302]
        "#,
        )
    }

    #[test]
    fn step_accounting_matches_stage_sizes() {
        let cfg = full_config();
        let plan = DeployPlan::build(&cfg, &registry(), 1, None).unwrap();
        // cache 1+3, db 1+2, ctl 1+1, wrk 1+0, cluster bootstrap 1,
        // storage bootstrap 1, post-step 1.
        assert_eq!(plan.total_steps, 4 + 3 + 2 + 1 + 1 + 1 + 1);
        assert_eq!(
            plan.total_steps,
            plan.stages.iter().map(Stage::size).sum::<usize>()
        );
    }

    #[test]
    fn stage_order_is_fixed() {
        let cfg = full_config();
        let plan = DeployPlan::build(&cfg, &registry(), 1, None).unwrap();
        let kinds: Vec<StageKind> = plan.stages.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StageKind::SharedInfra,
                StageKind::Unit,
                StageKind::ClusterUnit,
                StageKind::ClusterUnit,
                StageKind::ClusterBootstrap,
                StageKind::StorageBootstrap,
                StageKind::PostStep,
            ]
        );
        assert_eq!(plan.stages[0].label, "cache");
    }

    #[test]
    fn bootstrap_stages_only_when_configured() {
        let cfg = config(
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
        "#,
        );
        let plan = DeployPlan::build(&cfg, &registry(), 1, None).unwrap();
        assert_eq!(plan.stages.len(), 1);
        assert_eq!(plan.total_steps, 1);
    }

    #[test]
    fn missing_cache_unit_fails_construction() {
        let mut cfg = full_config();
        cfg.cache_unit = "ghost".to_owned();
        let err = DeployPlan::build(&cfg, &registry(), 1, None).unwrap_err();
        assert!(matches!(err, DeployError::MissingUnit(_)));
    }

    #[test]
    fn unresolvable_action_fails_construction() {
        let mut cfg = full_config();
        cfg.units[1].actions.push("launch the missiles".to_owned());
        let err = DeployPlan::build(&cfg, &registry(), 1, None).unwrap_err();
        assert!(matches!(err, DeployError::UnknownAction { .. }));
    }

    #[test]
    fn window_bounds_validated() {
        let cfg = full_config();
        assert!(matches!(
            DeployPlan::build(&cfg, &registry(), 0, None).unwrap_err(),
            DeployError::InvalidWindow { .. }
        ));
        assert!(matches!(
            DeployPlan::build(&cfg, &registry(), 5, Some(3)).unwrap_err(),
            DeployError::InvalidWindow { .. }
        ));
        assert!(matches!(
            DeployPlan::build(&cfg, &registry(), 1, Some(99)).unwrap_err(),
            DeployError::InvalidWindow { .. }
        ));
        let plan = DeployPlan::build(&cfg, &registry(), 3, Some(7)).unwrap();
        assert_eq!(plan.window, Window { start: 3, end: 7 });
    }

    #[test]
    fn render_marks_window() {
        let cfg = full_config();
        let plan = DeployPlan::build(&cfg, &registry(), 5, Some(7)).unwrap();
        let rendered = plan.render();
        assert!(rendered.contains("total 13 steps, running 5-7"));
        assert!(rendered.contains("[  1] skip cache: create unit"));
        assert!(rendered.contains("[  5] RUN  db: create unit"));
        assert!(rendered.contains("[  7] RUN  db: base tools installation"));
        assert!(rendered.contains("[  8] skip ctl: create unit"));
    }
}
