use super::{host_provider, spin_fail, spin_ok, spinner, EXIT_SUCCESS};
use labforge_config::LabConfig;
use labforge_remote::UnitProvider;
use std::time::Duration;
use tracing::{info, warn};

/// Destroy every configured unit and template, then remove generated
/// template archives from the host.
pub fn run(cfg: &LabConfig) -> Result<u8, String> {
    let mut provider = host_provider(cfg)?;

    let mut ids: Vec<u32> = cfg.units.iter().map(|u| u.id).collect();
    ids.extend(cfg.templates.iter().map(|t| t.id));

    info!("cleaning up {} units", ids.len());
    let pb = spinner("destroying units...");
    for id in &ids {
        if !provider.exists(*id) {
            continue;
        }
        pb.set_message(format!("destroying unit {id}..."));
        if let Err(e) = provider.destroy(*id) {
            spin_fail(&pb, &format!("failed to destroy unit {id}"));
            return Err(e.to_string());
        }
    }
    spin_ok(&pb, "units destroyed");

    // Generated template archives are rebuilt on the next deploy.
    for template in &cfg.templates {
        let archive = format!("{}/{}.tar.zst", cfg.host.template_dir, template.name);
        provider.host_runner().execute(
            &format!("rm -f {archive}"),
            Some(Duration::from_secs(30)),
            false,
        );
        info!("removed template archive {archive}");
    }

    let leftovers: Vec<u32> = provider
        .list()
        .into_iter()
        .filter(|id| ids.contains(id))
        .collect();
    if !leftovers.is_empty() {
        warn!("units still present after cleanup: {leftovers:?}");
        return Err(format!("units still present after cleanup: {leftovers:?}"));
    }

    println!("cleanup complete");
    Ok(EXIT_SUCCESS)
}
