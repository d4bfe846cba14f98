use super::{host_provider, EXIT_SUCCESS};
use labforge_config::LabConfig;
use labforge_core::{DeployPlan, ExecState, Executor};
use labforge_remote::SshConnector;
use tracing::info;

pub fn run(
    cfg: &LabConfig,
    start_step: usize,
    end_step: Option<usize>,
    planonly: bool,
) -> Result<u8, String> {
    let registry = labforge_actions::builtin();
    let plan =
        DeployPlan::build(cfg, registry, start_step, end_step).map_err(|e| e.to_string())?;

    println!("{}", plan.render());
    if planonly {
        println!("plan-only mode: exiting without executing deployment");
        return Ok(EXIT_SUCCESS);
    }

    let mut provider = host_provider(cfg)?;
    let connector = SshConnector {
        cfg: cfg.session.clone(),
    };
    let mut executor = Executor::new(cfg, plan, &mut provider, &connector, registry);
    let report = executor.run().map_err(|e| e.to_string())?;

    print_summary(cfg, &report.probe_failures);
    match report.state {
        ExecState::StoppedAtWindow => {
            println!("stopped at end step {}", executor.plan().window.end);
        }
        _ => println!("deploy complete"),
    }
    Ok(EXIT_SUCCESS)
}

fn print_summary(cfg: &LabConfig, probe_failures: &[labforge_core::ProbeFailure]) {
    info!("==================================================");
    info!("Deploy summary");
    info!("==================================================");
    for unit in &cfg.units {
        info!("  - {}: {} ({})", unit.id, unit.name, unit.address);
    }
    if let Some(storage) = &cfg.storage {
        info!(
            "storage volume '{}' mounted at {} on all members",
            storage.volume_name, storage.mount_point
        );
    }
    if probe_failures.is_empty() {
        if !cfg.services.is_empty() {
            info!("all service ports are responding");
        }
    } else {
        info!("ports NOT responding:");
        for failure in probe_failures {
            info!("  - {failure}");
        }
    }
}
