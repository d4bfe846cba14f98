//! Cluster and storage bootstrap stages.
//!
//! The orchestration here is ordering and bounded readiness polling; the
//! vendor-specific detail lives in the configured scripts. The bootstrap
//! session targets the control node (or first storage member); worker
//! joins go through the lifecycle provider.

use labforge_core::{Action, ActionContext, Capability};
use std::time::Duration;
use tracing::{error, info, warn};

const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(900);

/// Bring the cluster up: bootstrap script on the control node, join script
/// on each worker, then poll the ready command until it answers.
pub struct ClusterBootstrap;

impl Action for ClusterBootstrap {
    fn describe(&self) -> &'static str {
        "cluster bootstrap"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[
            Capability::RemoteExec,
            Capability::PrivilegedExec,
            Capability::UnitLifecycle,
        ]
    }

    fn execute(&mut self, ctx: &mut ActionContext<'_>) -> bool {
        let Some(cluster) = &ctx.cfg.cluster else {
            error!("cluster bootstrap scheduled without cluster configuration");
            return false;
        };

        if let Some(script) = &cluster.bootstrap_script {
            info!("bootstrapping cluster control node '{}'", ctx.unit.name);
            let outcome = ctx.runner.execute(script, Some(BOOTSTRAP_TIMEOUT), true);
            if !outcome.succeeded() {
                error!(
                    "cluster bootstrap script failed on '{}': {}",
                    ctx.unit.name,
                    outcome.output.unwrap_or_default()
                );
                return false;
            }
        } else {
            warn!("no cluster bootstrap script configured, skipping control setup");
        }

        if let Some(join) = &cluster.join_script {
            for worker_id in &cluster.workers {
                info!("joining worker unit {worker_id} to the cluster");
                let outcome = ctx
                    .provider
                    .exec_in(*worker_id, join, Some(BOOTSTRAP_TIMEOUT));
                if !outcome.succeeded() {
                    error!(
                        "cluster join failed on unit {worker_id}: {}",
                        outcome.output.unwrap_or_default()
                    );
                    return false;
                }
            }
        }

        match &cluster.ready_command {
            Some(ready) => wait_until_ready(ctx, ready, "cluster"),
            None => true,
        }
    }
}

/// Bring distributed storage up via the configured script, then poll its
/// ready command.
pub struct StorageBootstrap;

impl Action for StorageBootstrap {
    fn describe(&self) -> &'static str {
        "storage bootstrap"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::RemoteExec, Capability::PrivilegedExec]
    }

    fn execute(&mut self, ctx: &mut ActionContext<'_>) -> bool {
        let Some(storage) = &ctx.cfg.storage else {
            error!("storage bootstrap scheduled without storage configuration");
            return false;
        };

        if let Some(script) = &storage.bootstrap_script {
            info!(
                "bootstrapping storage volume '{}' from '{}'",
                storage.volume_name, ctx.unit.name
            );
            let outcome = ctx.runner.execute(script, Some(BOOTSTRAP_TIMEOUT), true);
            if !outcome.succeeded() {
                error!(
                    "storage bootstrap script failed: {}",
                    outcome.output.unwrap_or_default()
                );
                return false;
            }
        } else {
            warn!("no storage bootstrap script configured, skipping");
        }

        match &storage.ready_command {
            Some(ready) => wait_until_ready(ctx, ready, "storage"),
            None => true,
        }
    }
}

/// Bounded poll of a readiness command until it exits zero.
fn wait_until_ready(ctx: &mut ActionContext<'_>, command: &str, what: &str) -> bool {
    let attempts = ctx.cfg.waits.service_ready_attempts.max(1);
    let interval = Duration::from_secs(ctx.cfg.waits.service_ready_interval_secs);
    for attempt in 1..=attempts {
        let outcome = ctx
            .runner
            .execute(command, Some(Duration::from_secs(30)), true);
        if outcome.succeeded() {
            info!("{what} is ready");
            return true;
        }
        info!("waiting for {what}... ({attempt}/{attempts})");
        std::thread::sleep(interval);
    }
    error!("{what} never became ready within {attempts} attempts");
    false
}
