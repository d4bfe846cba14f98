//! Post-window service verification.
//!
//! Once the execution window closes, every configured `(name, unit, port)`
//! triple is probed with a TCP (or UDP) connect check run from the host.
//! Failures are reported; whether they are fatal is the caller's decision
//! and depends on whether the run was a full one.

use labforge_config::LabConfig;
use labforge_remote::CommandRunner;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeFailure {
    pub name: String,
    pub address: String,
    pub port: u16,
}

impl std::fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}:{}", self.name, self.address, self.port)
    }
}

/// Probe every configured service port from the host. Returns the probes
/// that did not answer.
pub fn probe_services(runner: &mut dyn CommandRunner, cfg: &LabConfig) -> Vec<ProbeFailure> {
    if cfg.services.is_empty() {
        return Vec::new();
    }
    info!("checking service ports...");
    // Give just-started services a moment to bind.
    std::thread::sleep(Duration::from_secs(5));

    let mut failures = Vec::new();
    for probe in &cfg.services {
        // Validation guarantees the unit resolves.
        let Some(unit) = cfg.unit_by_name(&probe.unit) else {
            continue;
        };
        let flags = if probe.udp { "-zuv" } else { "-zv" };
        let cmd = format!("nc {flags} {} {} 2>&1", unit.address, probe.port);
        let outcome = runner.execute(&cmd, Some(Duration::from_secs(15)), false);
        let text = outcome.output.unwrap_or_default().to_lowercase();
        if text.contains("open") || text.contains("succeeded") {
            info!("  ok {}: {}:{}", probe.name, unit.address, probe.port);
        } else {
            error!(
                "  FAIL {}: {}:{} - not responding",
                probe.name, unit.address, probe.port
            );
            failures.push(ProbeFailure {
                name: probe.name.clone(),
                address: unit.address.clone(),
                port: probe.port,
            });
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use labforge_remote::{ExecOutcome, MockRunner};

    fn config_with_probes() -> LabConfig {
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
            [[units]]
            id = 210
            name = "dns"
            hostname = "dns"
            address = "10.0.0.210"
            [[services]]
            name = "package cache"
            unit = "cache"
            port = 3142
            [[services]]
            name = "dns"
            unit = "dns"
            port = 53
            udp = true
        "#,
        )
        .unwrap()
    }

    #[test]
    fn reports_only_unanswered_probes() {
        let cfg = config_with_probes();
        let mut runner = MockRunner::new()
            .on(
                "nc -zv 10.0.0.200 3142",
                ExecOutcome::of("Connection to 10.0.0.200 3142 port [tcp] succeeded!", 0),
            )
            .on("nc -zuv 10.0.0.210 53", ExecOutcome::of("", 1));
        let failures = probe_services(&mut runner, &cfg);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].name, "dns");
        assert_eq!(failures[0].port, 53);
    }

    #[test]
    fn udp_probe_uses_udp_flag() {
        let cfg = config_with_probes();
        let mut runner = MockRunner::new().on("nc", ExecOutcome::of("open", 0));
        let failures = probe_services(&mut runner, &cfg);
        assert!(failures.is_empty());
        assert!(runner.ran("nc -zuv 10.0.0.210 53"));
        assert!(runner.ran("nc -zv 10.0.0.200 3142"));
    }

    #[test]
    fn no_probes_configured_is_quiet() {
        let mut cfg = config_with_probes();
        cfg.services.clear();
        let mut runner = MockRunner::new();
        assert!(probe_services(&mut runner, &cfg).is_empty());
        assert_eq!(runner.count("nc"), 0);
    }
}
