use super::{host_provider, EXIT_SUCCESS};
use labforge_config::LabConfig;
use labforge_remote::UnitProvider;
use std::time::Duration;
use tracing::{error, info};

const RESTORE_TIMEOUT: Duration = Duration::from_secs(1800);

/// Unpack a named backup's tarballs back into their source units.
pub fn run(cfg: &LabConfig, backup_name: &str) -> Result<u8, String> {
    if backup_name.is_empty() {
        return Err("backup name is required (--backup-name <name>)".to_owned());
    }
    let Some(backup) = &cfg.backup else {
        return Err("config error: no [backup] section configured".to_owned());
    };
    let mut provider = host_provider(cfg)?;

    // Every archive must be present before anything is overwritten.
    for item in &backup.items {
        let archive = format!("{}/{backup_name}-{}.tar.gz", backup.backup_dir, item.name);
        let check = provider.exec_in(
            backup.unit_id,
            &format!("test -r {archive} && echo present || echo missing"),
            Some(Duration::from_secs(30)),
        );
        if !check.output.unwrap_or_default().contains("present") {
            return Err(format!("backup archive {archive} not found"));
        }
    }

    info!("restoring backup '{backup_name}'");
    for item in &backup.items {
        let archive = format!("{}/{backup_name}-{}.tar.gz", backup.backup_dir, item.name);
        info!("restoring '{}' into unit {}", item.name, item.unit_id);
        let outcome = provider.exec_in(
            item.unit_id,
            &format!("tar xzf {archive} -C /"),
            Some(RESTORE_TIMEOUT),
        );
        if !outcome.succeeded() {
            error!(
                "restore of '{}' failed: {}",
                item.name,
                outcome.output.unwrap_or_default()
            );
            return Err(format!("restore of '{}' failed", item.name));
        }
    }

    println!(
        "restore of '{backup_name}' complete ({} items)",
        backup.items.len()
    );
    Ok(EXIT_SUCCESS)
}
