//! Compute-unit lifecycle over the virtualization host's CLI.
//!
//! The host session runs `pct`-style commands; in-unit execution is
//! base64-wrapped through `pct exec` so quoting survives arbitrary scripts.
//! The trait is the seam the executor provisions through; tests drive a
//! scripted in-memory implementation instead.

use crate::classify::classify;
use crate::session::{CommandRunner, ExecOutcome};
use crate::RemoteError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use labforge_config::{HostSection, UnitConfig, UserSection, WaitSection};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Running,
    Stopped,
    Absent,
}

/// Lifecycle operations on compute units. The executor calls these; it
/// never issues host CLI commands itself.
pub trait UnitProvider {
    fn state(&mut self, id: u32) -> UnitState;

    fn exists(&mut self, id: u32) -> bool {
        self.state(id) != UnitState::Absent
    }

    /// Privilege mode of an existing unit, `None` when it cannot be
    /// determined (missing unit, failed query).
    fn is_privileged(&mut self, id: u32) -> Option<bool>;

    fn create(&mut self, unit: &UnitConfig) -> Result<(), RemoteError>;
    fn configure_features(&mut self, id: u32, nested: bool) -> Result<(), RemoteError>;
    fn set_autostart(&mut self, id: u32, autostart: bool) -> Result<(), RemoteError>;
    fn start(&mut self, id: u32) -> Result<(), RemoteError>;
    fn stop(&mut self, id: u32) -> Result<(), RemoteError>;
    /// Stop and destroy, with a forced second attempt; verifies the unit is
    /// actually gone afterwards.
    fn destroy(&mut self, id: u32) -> Result<(), RemoteError>;

    fn exec_in(&mut self, id: u32, command: &str, timeout: Option<Duration>) -> ExecOutcome;

    /// Bounded poll until the unit answers (status, ping, then an in-unit
    /// echo). Never waits past the configured attempt cap.
    fn wait_ready(&mut self, unit: &UnitConfig) -> bool;

    /// Ids of every unit present on the host.
    fn list(&mut self) -> Vec<u32>;

    /// Install users, sudoers entries, and the operator's public key so
    /// the per-unit SSH sessions can authenticate.
    fn install_access(
        &mut self,
        unit: &UnitConfig,
        users: &[UserSection],
    ) -> Result<(), RemoteError>;

    /// Make sure the unit accepts SSH logins: install the server if the
    /// template shipped without it, then enable and start it.
    fn ensure_remote_login(&mut self, unit: &UnitConfig) -> Result<(), RemoteError>;

    /// Direct access to the host session, for probes and host-side file
    /// operations that are not unit lifecycle.
    fn host_runner(&mut self) -> &mut dyn CommandRunner;
}

pub struct HostProvider {
    runner: Box<dyn CommandRunner>,
    host: HostSection,
    waits: WaitSection,
}

impl HostProvider {
    pub fn new(runner: Box<dyn CommandRunner>, host: HostSection, waits: WaitSection) -> Self {
        Self {
            runner,
            host,
            waits,
        }
    }

    /// Resolve the rootfs archive a unit is created from. Named templates
    /// map to `<template_dir>/<name>.tar.zst`; unnamed units take the
    /// newest base archive present on the host.
    fn template_path(&mut self, template: Option<&str>) -> Result<String, RemoteError> {
        let dir = self.host.template_dir.clone();
        let pattern = match template {
            Some(name) if !name.is_empty() && name != "base" => {
                format!("{dir}/{name}.tar.zst")
            }
            _ => {
                let outcome = self.runner.execute(
                    &format!("ls -1 {dir}/*.tar.* 2>/dev/null | sort | tail -1"),
                    Some(Duration::from_secs(30)),
                    false,
                );
                outcome.output.unwrap_or_default().trim().to_owned()
            }
        };
        if pattern.is_empty() {
            return Err(RemoteError::Lifecycle(
                0,
                format!("no rootfs template found under {dir}"),
            ));
        }
        // The archive must exist and be readable before pct will accept it.
        let check = self.runner.execute(
            &format!("test -r {pattern} && echo ok || echo missing"),
            Some(Duration::from_secs(10)),
            false,
        );
        if !check.output.unwrap_or_default().contains("ok") {
            return Err(RemoteError::Lifecycle(
                0,
                format!("template archive {pattern} is missing or unreadable"),
            ));
        }
        Ok(pattern)
    }

    fn run_host(&mut self, command: &str, timeout: Option<Duration>) -> ExecOutcome {
        self.runner.execute(command, timeout, false)
    }

    fn lifecycle_check(
        id: u32,
        operation: &str,
        outcome: &ExecOutcome,
    ) -> Result<(), RemoteError> {
        let report = classify(outcome.output.as_deref(), outcome.status);
        if report.success {
            return Ok(());
        }
        Err(RemoteError::Lifecycle(
            id,
            format!(
                "{operation} failed ({}): {}",
                report.kind,
                report.message.unwrap_or_default()
            ),
        ))
    }

    fn do_install_access(
        &mut self,
        unit: &UnitConfig,
        users: &[UserSection],
    ) -> Result<(), RemoteError> {
        let Some(pubkey) = find_public_key() else {
            return Err(RemoteError::Lifecycle(
                unit.id,
                "no public key under ~/.ssh to install".to_owned(),
            ));
        };
        let key_b64 = BASE64.encode(pubkey.as_bytes());

        for user in users {
            let name = &user.name;
            let ensure_user = format!(
                "id -u {name} >/dev/null 2>&1 || useradd -m -s /bin/bash -G {group} {name}",
                group = user.sudo_group
            );
            let outcome = self.exec_in(unit.id, &ensure_user, None);
            Self::lifecycle_check(unit.id, "user creation", &outcome)?;

            if let Some(password) = &user.password {
                let outcome = self.exec_in(
                    unit.id,
                    &format!("echo '{name}:{password}' | chpasswd"),
                    None,
                );
                Self::lifecycle_check(unit.id, "password setup", &outcome)?;
            }

            let sudoers = format!(
                "printf '%s ALL=(ALL) NOPASSWD: ALL\\n' {name} > /etc/sudoers.d/{name} \
                 && chmod 440 /etc/sudoers.d/{name}"
            );
            let outcome = self.exec_in(unit.id, &sudoers, None);
            Self::lifecycle_check(unit.id, "sudoers setup", &outcome)?;

            let key_install = format!(
                "mkdir -p /home/{name}/.ssh \
                 && echo {key_b64} | base64 -d > /home/{name}/.ssh/authorized_keys \
                 && chmod 600 /home/{name}/.ssh/authorized_keys \
                 && chown -R {name}:{name} /home/{name}/.ssh"
            );
            let outcome = self.exec_in(unit.id, &key_install, None);
            Self::lifecycle_check(unit.id, "authorized_keys setup", &outcome)?;
        }

        let root_key = format!(
            "mkdir -p /root/.ssh \
             && echo {key_b64} | base64 -d > /root/.ssh/authorized_keys \
             && chmod 600 /root/.ssh/authorized_keys"
        );
        let outcome = self.exec_in(unit.id, &root_key, None);
        Self::lifecycle_check(unit.id, "root authorized_keys setup", &outcome)?;

        // Stale host keys from a destroyed unit with the same address would
        // break the next connection.
        let _ = std::process::Command::new("ssh-keygen")
            .args(["-R", &unit.address])
            .output();

        Ok(())
    }

    fn do_ensure_remote_login(&mut self, unit: &UnitConfig) -> Result<(), RemoteError> {
        let check = self.exec_in(
            unit.id,
            "dpkg -l | grep -q '^ii.*openssh-server' || echo absent",
            None,
        );
        if check.output.unwrap_or_default().contains("absent") {
            info!("unit {}: installing ssh server", unit.id);
            let outcome = self.exec_in(
                unit.id,
                "apt-get update -qq && apt-get install -y -qq openssh-server",
                Some(Duration::from_secs(300)),
            );
            Self::lifecycle_check(unit.id, "ssh server install", &outcome)?;
        }
        let outcome = self.exec_in(unit.id, "systemctl enable --now ssh", None);
        // Some templates name the unit sshd; retry once before failing.
        if !outcome.succeeded() {
            let retry = self.exec_in(unit.id, "systemctl enable --now sshd", None);
            Self::lifecycle_check(unit.id, "ssh service enablement", &retry)?;
        }
        Ok(())
    }
}

impl UnitProvider for HostProvider {
    fn state(&mut self, id: u32) -> UnitState {
        let outcome = self.run_host(
            &format!("pct status {id} 2>&1"),
            Some(Duration::from_secs(30)),
        );
        let text = outcome.output.unwrap_or_default();
        if text.contains("running") {
            UnitState::Running
        } else if text.contains("stopped") {
            UnitState::Stopped
        } else {
            UnitState::Absent
        }
    }

    fn is_privileged(&mut self, id: u32) -> Option<bool> {
        let outcome = self.run_host(
            &format!("pct config {id} 2>/dev/null"),
            Some(Duration::from_secs(30)),
        );
        if !outcome.succeeded() {
            return None;
        }
        // pct omits the marker entirely for privileged units.
        Some(!outcome.output.unwrap_or_default().contains("unprivileged: 1"))
    }

    fn create(&mut self, unit: &UnitConfig) -> Result<(), RemoteError> {
        let template = self.template_path(unit.template.as_deref())?;
        let r = unit.resources;
        let cmd = format!(
            "pct create {id} {template} --hostname {hostname} --memory {memory} --swap {swap} \
             --cores {cores} --net0 name=eth0,bridge={bridge},ip={address}/24,gw={gateway} \
             --rootfs {pool}:{disk} --unprivileged {unpriv} --ostype ubuntu --arch amd64",
            id = unit.id,
            hostname = unit.hostname,
            memory = r.memory_mb,
            swap = r.swap_mb,
            cores = r.cores,
            bridge = self.host.bridge,
            address = unit.address,
            gateway = self.host.gateway,
            pool = self.host.storage_pool,
            disk = r.disk_gb,
            unpriv = u8::from(!unit.privileged),
        );
        info!("creating unit {} from {template}", unit.id);
        let outcome = self.run_host(&cmd, Some(Duration::from_secs(600)));
        Self::lifecycle_check(unit.id, "create", &outcome)
    }

    fn configure_features(&mut self, id: u32, nested: bool) -> Result<(), RemoteError> {
        let cmd = format!(
            "pct set {id} --features nesting={},keyctl=1,fuse=1",
            u8::from(nested)
        );
        let outcome = self.run_host(&cmd, Some(Duration::from_secs(60)));
        Self::lifecycle_check(id, "feature configuration", &outcome)
    }

    fn set_autostart(&mut self, id: u32, autostart: bool) -> Result<(), RemoteError> {
        let cmd = format!("pct set {id} --onboot {}", u8::from(autostart));
        let outcome = self.run_host(&cmd, Some(Duration::from_secs(60)));
        Self::lifecycle_check(id, "autostart configuration", &outcome)
    }

    fn start(&mut self, id: u32) -> Result<(), RemoteError> {
        let outcome = self.run_host(&format!("pct start {id}"), Some(Duration::from_secs(120)));
        Self::lifecycle_check(id, "start", &outcome)
    }

    fn stop(&mut self, id: u32) -> Result<(), RemoteError> {
        let outcome = self.run_host(
            &format!("pct stop {id} 2>/dev/null || true"),
            Some(Duration::from_secs(120)),
        );
        Self::lifecycle_check(id, "stop", &outcome)
    }

    fn destroy(&mut self, id: u32) -> Result<(), RemoteError> {
        if !self.exists(id) {
            debug!("unit {id} does not exist, nothing to destroy");
            return Ok(());
        }
        let outcome = self.run_host(
            &format!("pct stop {id} 2>/dev/null || true; sleep 2; pct destroy {id} 2>&1"),
            Some(Duration::from_secs(180)),
        );
        if !outcome.succeeded() {
            warn!("destroy of unit {id} failed, retrying with --force");
            self.run_host(
                &format!("pct destroy {id} --force 2>&1 || true"),
                Some(Duration::from_secs(180)),
            );
        }
        if self.exists(id) {
            return Err(RemoteError::Lifecycle(
                id,
                "unit still exists after destruction attempt".to_owned(),
            ));
        }
        Ok(())
    }

    fn exec_in(&mut self, id: u32, command: &str, timeout: Option<Duration>) -> ExecOutcome {
        debug!("running in unit {id}: {command}");
        let encoded = BASE64.encode(command.as_bytes());
        let wrapped = format!("pct exec {id} -- bash -c \"echo {encoded} | base64 -d | bash\"");
        self.runner.execute(&wrapped, timeout, false)
    }

    fn wait_ready(&mut self, unit: &UnitConfig) -> bool {
        let attempts = self.waits.unit_ready_attempts.max(1);
        let interval = Duration::from_secs(self.waits.unit_ready_interval_secs);
        for attempt in 1..=attempts {
            if self.state(unit.id) == UnitState::Running {
                let ping = self.run_host(
                    &format!("ping -c 1 -W 2 {} 2>&1", unit.address),
                    Some(Duration::from_secs(10)),
                );
                if ping.succeeded() {
                    info!("unit {} is up", unit.id);
                    return true;
                }
                let echo = self.exec_in(unit.id, "echo ready", Some(Duration::from_secs(5)));
                if echo.succeeded() && echo.output.unwrap_or_default().contains("ready") {
                    info!("unit {} is up (exec path)", unit.id);
                    return true;
                }
            }
            debug!("waiting for unit {}... ({attempt}/{attempts})", unit.id);
            std::thread::sleep(interval);
        }
        warn!(
            "unit {} may not be fully ready after {attempts} attempts, continuing",
            unit.id
        );
        true
    }

    fn list(&mut self) -> Vec<u32> {
        let outcome = self.run_host("pct list 2>/dev/null", Some(Duration::from_secs(30)));
        let Some(text) = outcome.output else {
            return Vec::new();
        };
        text.lines()
            .skip(1)
            .filter_map(|line| line.split_whitespace().next())
            .filter_map(|id| id.parse().ok())
            .collect()
    }

    fn install_access(
        &mut self,
        unit: &UnitConfig,
        users: &[UserSection],
    ) -> Result<(), RemoteError> {
        self.do_install_access(unit, users)
    }

    fn ensure_remote_login(&mut self, unit: &UnitConfig) -> Result<(), RemoteError> {
        self.do_ensure_remote_login(unit)
    }

    fn host_runner(&mut self) -> &mut dyn CommandRunner {
        self.runner.as_mut()
    }
}

/// The operator's public key, installed into every fresh unit.
fn find_public_key() -> Option<String> {
    let home = std::env::var("HOME").ok()?;
    ["id_rsa.pub", "id_ed25519.pub"]
        .iter()
        .map(|name| PathBuf::from(&home).join(".ssh").join(name))
        .find_map(|p| std::fs::read_to_string(p).ok())
        .map(|key| key.trim().to_owned())
}
