//! System-service actions parameterized by the unit's params table.

use crate::{param_int, param_str};
use labforge_core::{Action, ActionContext, Capability};
use std::time::Duration;
use tracing::{error, info};

/// Enable and start the service named by the unit's `service` param.
pub struct ServiceEnablement;

impl Action for ServiceEnablement {
    fn describe(&self) -> &'static str {
        "service enablement"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::PrivilegedExec]
    }

    fn execute(&mut self, ctx: &mut ActionContext<'_>) -> bool {
        let Some(service) = param_str(ctx.unit, "service") else {
            error!(
                "unit '{}' has no 'service' param for service enablement",
                ctx.unit.name
            );
            return false;
        };
        info!("enabling service '{service}' on '{}'", ctx.unit.name);
        let outcome = ctx
            .runner
            .execute(&format!("systemctl enable --now {service}"), None, true);
        if !outcome.succeeded() {
            error!("failed to enable service '{service}' on '{}'", ctx.unit.name);
            return false;
        }
        let status = ctx.runner.execute(
            &format!("systemctl is-active {service}"),
            Some(Duration::from_secs(10)),
            true,
        );
        status
            .output
            .as_deref()
            .is_some_and(|o| o.contains("active"))
    }
}

/// Bounded poll until the port named by the unit's `port` param answers
/// locally. Never waits past the configured attempt cap.
pub struct WaitServiceReady;

impl Action for WaitServiceReady {
    fn describe(&self) -> &'static str {
        "wait service ready"
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::RemoteExec]
    }

    fn execute(&mut self, ctx: &mut ActionContext<'_>) -> bool {
        let Some(port) = param_int(ctx.unit, "port") else {
            error!(
                "unit '{}' has no 'port' param for readiness wait",
                ctx.unit.name
            );
            return false;
        };
        let attempts = ctx.cfg.waits.service_ready_attempts.max(1);
        let interval = Duration::from_secs(ctx.cfg.waits.service_ready_interval_secs);
        for attempt in 1..=attempts {
            let outcome = ctx.runner.execute(
                &format!("nc -z 127.0.0.1 {port} 2>&1 && echo port_open || echo port_closed"),
                Some(Duration::from_secs(10)),
                false,
            );
            if outcome
                .output
                .as_deref()
                .is_some_and(|o| o.contains("port_open"))
            {
                info!("port {port} on '{}' is answering", ctx.unit.name);
                return true;
            }
            info!(
                "waiting for port {port} on '{}'... ({attempt}/{attempts})",
                ctx.unit.name
            );
            std::thread::sleep(interval);
        }
        error!(
            "port {port} on '{}' never answered within {attempts} attempts",
            ctx.unit.name
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labforge_remote::{ExecOutcome, MockProvider, MockRunner, PkgCoordinator, UnitProvider};

    fn config() -> labforge_config::LabConfig {
        labforge_config::parse_config_str(
            r#"
            cache_unit = "proxy"
            [host]
            address = "root@virt.lab"
            gateway = "10.0.0.1"
            [waits]
            service_ready_attempts = 3
            service_ready_interval_secs = 0
            [[units]]
            id = 220
            name = "proxy"
            hostname = "proxy"
            address = "10.0.0.220"
            [units.params]
            service = "haproxy"
            port = 80
        "#,
        )
        .unwrap()
    }

    fn run_action(
        action: &mut dyn Action,
        runner: &mut MockRunner,
        cfg: &labforge_config::LabConfig,
    ) -> bool {
        let mut provider = MockProvider::new();
        let mut pkg = PkgCoordinator::new(&cfg.packages, &cfg.waits);
        let unit = cfg.unit_by_name("proxy").unwrap().clone();
        let mut ctx = ActionContext {
            runner,
            pkg: &mut pkg,
            provider: &mut provider as &mut dyn UnitProvider,
            unit: &unit,
            cfg,
        };
        action.execute(&mut ctx)
    }

    #[test]
    fn enablement_uses_service_param_and_verifies() {
        let cfg = config();
        let mut runner = MockRunner::new()
            .on("systemctl enable --now haproxy", ExecOutcome::of("", 0))
            .on("systemctl is-active", ExecOutcome::of("active", 0));
        assert!(run_action(&mut ServiceEnablement, &mut runner, &cfg));
    }

    #[test]
    fn enablement_fails_when_service_stays_inactive() {
        let cfg = config();
        let mut runner = MockRunner::new()
            .on("systemctl enable --now haproxy", ExecOutcome::of("", 0))
            .on("systemctl is-active", ExecOutcome::of("inactive", 3));
        assert!(!run_action(&mut ServiceEnablement, &mut runner, &cfg));
    }

    #[test]
    fn enablement_requires_service_param() {
        let mut cfg = config();
        cfg.units[0].params.remove("service");
        let mut runner = MockRunner::new();
        assert!(!run_action(&mut ServiceEnablement, &mut runner, &cfg));
    }

    #[test]
    fn readiness_wait_retries_until_port_answers() {
        let cfg = config();
        let mut runner = MockRunner::new()
            .on_n("nc -z 127.0.0.1 80", ExecOutcome::of("port_closed", 1), 2)
            .on("nc -z 127.0.0.1 80", ExecOutcome::of("port_open", 0));
        assert!(run_action(&mut WaitServiceReady, &mut runner, &cfg));
        assert_eq!(runner.count("nc -z"), 3);
    }

    #[test]
    fn readiness_wait_gives_up_after_cap() {
        let cfg = config();
        let mut runner =
            MockRunner::new().on("nc -z 127.0.0.1 80", ExecOutcome::of("port_closed", 1));
        assert!(!run_action(&mut WaitServiceReady, &mut runner, &cfg));
        assert_eq!(runner.count("nc -z"), 3);
    }
}
