use super::{host_provider, EXIT_SUCCESS};
use labforge_config::LabConfig;
use labforge_remote::UnitProvider;
use std::time::Duration;
use tracing::{error, info};

const BACKUP_TIMEOUT: Duration = Duration::from_secs(1800);

/// Archive every configured data root into a timestamped tarball under
/// the backup directory (expected to live on shared storage so every
/// member unit sees it).
pub fn run(cfg: &LabConfig) -> Result<u8, String> {
    let Some(backup) = &cfg.backup else {
        return Err("config error: no [backup] section configured".to_owned());
    };
    let mut provider = host_provider(cfg)?;

    let name = format!(
        "{}-{}",
        backup.name_prefix,
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    );
    info!("creating backup '{name}'");

    let ensure_dir = provider.exec_in(
        backup.unit_id,
        &format!("mkdir -p {}", backup.backup_dir),
        Some(Duration::from_secs(30)),
    );
    if !ensure_dir.succeeded() {
        return Err(format!(
            "failed to create backup dir {} in unit {}",
            backup.backup_dir, backup.unit_id
        ));
    }

    for item in &backup.items {
        let archive = format!("{}/{name}-{}.tar.gz", backup.backup_dir, item.name);
        info!(
            "archiving {} from unit {} into {archive}",
            item.path, item.unit_id
        );
        let outcome = provider.exec_in(
            item.unit_id,
            &format!("tar czf {archive} -C / {}", item.path.trim_start_matches('/')),
            Some(BACKUP_TIMEOUT),
        );
        if !outcome.succeeded() {
            error!(
                "backup of '{}' failed: {}",
                item.name,
                outcome.output.unwrap_or_default()
            );
            return Err(format!("backup of '{}' failed", item.name));
        }

        let size = provider
            .exec_in(
                backup.unit_id,
                &format!("du -h {archive} | cut -f1"),
                Some(Duration::from_secs(60)),
            )
            .output
            .unwrap_or_default();
        info!("  archived '{}' ({})", item.name, size.trim());
    }

    println!("backup '{name}' complete ({} items)", backup.items.len());
    println!("restore with: labforge restore --backup-name {name}");
    Ok(EXIT_SUCCESS)
}
