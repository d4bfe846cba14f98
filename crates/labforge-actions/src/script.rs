//! Arbitrary script execution from configuration.

use crate::param_str;
use labforge_core::{Action, ActionContext, Capability};
use labforge_remote::classify;
use std::time::Duration;
use tracing::{error, info};

/// Run the unit's `script` param elevated. The classifier decides success
/// so tools that exit zero while printing an error still count as failed.
pub struct RunScript;

impl Action for RunScript {
    fn describe(&self) -> &'static str {
        "run script"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::RemoteExec, Capability::PrivilegedExec]
    }

    fn execute(&mut self, ctx: &mut ActionContext<'_>) -> bool {
        let Some(script) = param_str(ctx.unit, "script") else {
            error!("unit '{}' has no 'script' param", ctx.unit.name);
            return false;
        };
        let timeout = ctx
            .unit
            .params
            .get("script_timeout_secs")
            .and_then(toml::Value::as_integer)
            .map(|secs| Duration::from_secs(secs.unsigned_abs()));

        info!("running configured script on '{}'", ctx.unit.name);
        let outcome = ctx.runner.execute(script, timeout, true);
        let report = classify(outcome.output.as_deref(), outcome.status);
        if report.success {
            true
        } else {
            error!(
                "script on '{}' failed ({}): {}",
                ctx.unit.name,
                report.kind,
                report.message.unwrap_or_default()
            );
            false
        }
    }
}
