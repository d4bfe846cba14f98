//! Package-management actions, all routed through the coordinator so lock
//! contention and repository trouble are handled in one place.

use labforge_core::{Action, ActionContext, Capability};
use tracing::{error, info};

/// Full index refresh plus dist-upgrade.
pub struct SystemUpgrade;

impl Action for SystemUpgrade {
    fn describe(&self) -> &'static str {
        "system upgrade"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::PackageOps, Capability::PrivilegedExec]
    }

    fn execute(&mut self, ctx: &mut ActionContext<'_>) -> bool {
        info!("upgrading system on '{}'", ctx.unit.name);
        match ctx.pkg.upgrade(ctx.runner) {
            Ok(_) => true,
            Err(e) => {
                error!("system upgrade failed on '{}': {e}", ctx.unit.name);
                false
            }
        }
    }
}

/// Install the configured base package set.
pub struct BaseToolsInstall;

impl Action for BaseToolsInstall {
    fn describe(&self) -> &'static str {
        "base tools installation"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::PackageOps, Capability::PrivilegedExec]
    }

    fn execute(&mut self, ctx: &mut ActionContext<'_>) -> bool {
        let tools = &ctx.cfg.packages.base_tools;
        if tools.is_empty() {
            info!("no base tools configured, nothing to install");
            return true;
        }
        info!("installing base tools on '{}': {}", ctx.unit.name, tools.join(", "));
        match ctx.pkg.install(ctx.runner, tools) {
            Ok(_) => true,
            Err(e) => {
                error!("base tools installation failed on '{}': {e}", ctx.unit.name);
                false
            }
        }
    }
}

/// Point the unit's package manager at the shared cache unit.
pub struct PackageProxyConfigure;

impl Action for PackageProxyConfigure {
    fn describe(&self) -> &'static str {
        "package proxy configuration"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::PrivilegedExec]
    }

    fn execute(&mut self, ctx: &mut ActionContext<'_>) -> bool {
        let Some(cache) = ctx.cfg.unit_by_name(&ctx.cfg.cache_unit) else {
            error!("cache unit '{}' not found", ctx.cfg.cache_unit);
            return false;
        };
        if cache.id == ctx.unit.id {
            // The cache itself must reach upstream archives directly.
            info!("skipping proxy configuration on the cache unit itself");
            return true;
        }
        let proxy = format!(
            "Acquire::http::Proxy \"http://{}:{}/\";",
            cache.address, ctx.cfg.packages.proxy_port
        );
        let cmd = format!("printf '%s\\n' '{proxy}' > /etc/apt/apt.conf.d/01proxy");
        let outcome = ctx.runner.execute(&cmd, None, true);
        if outcome.succeeded() {
            info!("package proxy on '{}' points at {}", ctx.unit.name, cache.address);
            true
        } else {
            error!("failed to write package proxy configuration on '{}'", ctx.unit.name);
            false
        }
    }
}

/// Apply the one-shot source-list corrections outside of a retry cycle.
pub struct PackageSourcesFix;

impl Action for PackageSourcesFix {
    fn describe(&self) -> &'static str {
        "package sources fix"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::PrivilegedExec]
    }

    fn execute(&mut self, ctx: &mut ActionContext<'_>) -> bool {
        ctx.pkg.apply_source_fixes(ctx.runner);
        true
    }
}

/// Stop and mask the distribution's periodic package units so they cannot
/// take the lock mid-deployment.
pub struct DisablePackageTimers;

impl Action for DisablePackageTimers {
    fn describe(&self) -> &'static str {
        "disable automatic package timers"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::PrivilegedExec]
    }

    fn execute(&mut self, ctx: &mut ActionContext<'_>) -> bool {
        let script = "systemctl stop apt-daily.timer apt-daily-upgrade.timer 2>/dev/null || true\n\
                      systemctl disable apt-daily.timer apt-daily-upgrade.timer 2>/dev/null || true\n\
                      systemctl mask apt-daily.service apt-daily-upgrade.service 2>/dev/null || true\n\
                      systemctl stop unattended-upgrades 2>/dev/null || true\n\
                      systemctl disable unattended-upgrades 2>/dev/null || true\n\
                      echo timers_disabled";
        let outcome = ctx.runner.execute(script, None, true);
        let ok = outcome
            .output
            .as_deref()
            .is_some_and(|o| o.contains("timers_disabled"));
        if !ok {
            error!("failed to disable package timers on '{}'", ctx.unit.name);
        }
        ok
    }
}
