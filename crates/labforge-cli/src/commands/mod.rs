pub mod backup;
pub mod cleanup;
pub mod completions;
pub mod deploy;
pub mod redeploy;
pub mod restore;
pub mod status;

use indicatif::{ProgressBar, ProgressStyle};
use labforge_config::LabConfig;
use labforge_remote::{HostProvider, SshSession};
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;

/// Host provider over a fresh SSH session to the virtualization host.
pub fn host_provider(cfg: &LabConfig) -> Result<HostProvider, String> {
    let mut session = SshSession::new(cfg.host.address.clone(), cfg.session.clone());
    if !labforge_remote::CommandRunner::connect(&mut session) {
        return Err(format!("failed to connect to host {}", cfg.host.address));
    }
    Ok(HostProvider::new(
        Box::new(session),
        cfg.host.clone(),
        cfg.waits,
    ))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_unit_state(state: &str) -> String {
    use console::Style;
    match state {
        "running" => Style::new().green().apply_to(state).to_string(),
        "stopped" => Style::new().yellow().apply_to(state).to_string(),
        "absent" => Style::new().dim().apply_to(state).to_string(),
        other => other.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        assert_ne!(EXIT_SUCCESS, EXIT_FAILURE);
        assert_ne!(EXIT_FAILURE, EXIT_CONFIG_ERROR);
    }

    #[test]
    fn colorize_unit_state_passes_through_unknown() {
        assert_eq!(colorize_unit_state("weird"), "weird");
        assert!(colorize_unit_state("running").contains("running"));
    }

    #[test]
    fn spinner_finishes_cleanly() {
        let pb = spinner("working...");
        spin_ok(&pb, "done");
        let pb = spinner("working...");
        spin_fail(&pb, "failed");
    }
}
