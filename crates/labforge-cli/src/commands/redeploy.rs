use super::{cleanup, deploy};
use labforge_config::LabConfig;

/// Tear the lab down and deploy it again from step one.
pub fn run(cfg: &LabConfig) -> Result<u8, String> {
    cleanup::run(cfg)?;
    deploy::run(cfg, 1, None, false)
}
