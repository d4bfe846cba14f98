//! Persistent SSH sessions with idle-timeout output capture.
//!
//! A command is only declared dead after a configurable period with zero
//! new output, measured from the last received byte rather than from call
//! start. Long-running installs that keep printing are never killed; a
//! wedged command that goes silent is. Output is drained non-blockingly in
//! a poll loop so it can be captured and optionally echoed live at the
//! same time.

use crate::RemoteError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use labforge_config::SessionSection;
use ssh2::Session;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Raw result of one remote command execution.
///
/// `status: None` always means undetermined: the command idle-timed out or
/// the transport died before an exit status arrived. It never means the
/// command succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    pub output: Option<String>,
    pub status: Option<i32>,
}

impl ExecOutcome {
    pub fn timed_out() -> Self {
        Self {
            output: None,
            status: None,
        }
    }

    pub fn of(output: impl Into<String>, status: i32) -> Self {
        Self {
            output: Some(output.into()),
            status: Some(status),
        }
    }

    /// True only on an explicit zero exit status.
    pub fn succeeded(&self) -> bool {
        self.status == Some(0)
    }
}

/// The seam between everything that runs remote commands and the transport
/// that carries them. Production code uses [`SshSession`]; tests use the
/// scripted mock.
pub trait CommandRunner {
    fn connect(&mut self) -> bool;
    fn execute(&mut self, command: &str, timeout: Option<Duration>, elevated: bool)
        -> ExecOutcome;
    fn disconnect(&mut self);
    /// Human-readable `user@host` target, for diagnostics.
    fn target(&self) -> &str;
}

/// Single-quote a command for `bash -c`.
pub fn shell_quote(command: &str) -> String {
    format!("'{}'", command.replace('\'', r#"'"'"'"#))
}

/// Wrap a command for non-interactive privileged execution.
///
/// Multi-line scripts and commands containing single quotes go through
/// base64 so embedded newlines and quotes cannot break the outer shell.
pub fn elevate(command: &str) -> String {
    if command.contains('\n') || command.contains('\'') {
        let encoded = BASE64.encode(command.as_bytes());
        format!("sudo -n bash -c 'echo {encoded} | base64 -d | bash'")
    } else {
        format!("sudo -n bash -c {}", shell_quote(command))
    }
}

pub struct SshSession {
    target: String,
    username: String,
    hostname: String,
    cfg: SessionSection,
    session: Option<Session>,
}

impl SshSession {
    /// `target` is `user@host` or a bare host; a bare host uses the
    /// configured default username.
    pub fn new(target: impl Into<String>, cfg: SessionSection) -> Self {
        let target = target.into();
        let (username, hostname) = match target.split_once('@') {
            Some((user, host)) => (user.to_owned(), host.to_owned()),
            None => (cfg.username.clone(), target.clone()),
        };
        Self {
            target,
            username,
            hostname,
            cfg,
            session: None,
        }
    }

    fn is_alive(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.keepalive_send().is_ok())
    }

    fn find_private_key() -> Option<PathBuf> {
        let home = std::env::var("HOME").ok()?;
        ["id_rsa", "id_ed25519"]
            .iter()
            .map(|name| PathBuf::from(&home).join(".ssh").join(name))
            .find(|p| p.exists())
    }

    fn try_connect(&mut self) -> Result<(), RemoteError> {
        let key = Self::find_private_key()
            .ok_or_else(|| RemoteError::NoPrivateKey("~/.ssh".to_owned()))?;

        let addr = (self.hostname.as_str(), 22)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| RemoteError::ConnectFailed(self.target.clone()))?;
        let tcp =
            TcpStream::connect_timeout(&addr, Duration::from_secs(self.cfg.connect_timeout_secs))?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.handshake()?;
        session.userauth_pubkey_file(&self.username, None, &key, None)?;
        if !session.authenticated() {
            return Err(RemoteError::ConnectFailed(self.target.clone()));
        }

        info!("ssh connection established to {}", self.target);
        self.session = Some(session);
        Ok(())
    }

    /// Poll the channel until the remote side closes it or the idle
    /// deadline expires. Returns `None` on idle expiry.
    fn drain_channel(
        &self,
        session: &Session,
        channel: &mut ssh2::Channel,
        idle_timeout: Duration,
    ) -> Option<(String, String)> {
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut buf = vec![0_u8; self.cfg.read_buffer];
        let poll_interval = Duration::from_millis(self.cfg.poll_interval_ms);
        let mut last_byte = Instant::now();

        session.set_blocking(false);
        loop {
            let mut received = false;
            // stdout first, then stderr, every round.
            match channel.read(&mut buf) {
                Ok(n) if n > 0 => {
                    received = true;
                    self.capture(&mut stdout, &buf[..n], false);
                }
                _ => {}
            }
            match channel.stderr().read(&mut buf) {
                Ok(n) if n > 0 => {
                    received = true;
                    self.capture(&mut stderr, &buf[..n], true);
                }
                _ => {}
            }

            if received {
                last_byte = Instant::now();
            } else if channel.eof() {
                break;
            } else if last_byte.elapsed() > idle_timeout {
                session.set_blocking(true);
                let _ = channel.close();
                return None;
            } else {
                std::thread::sleep(poll_interval);
            }
        }
        session.set_blocking(true);

        // Pick up anything buffered between the last poll and EOF.
        let mut rest = String::new();
        if channel.read_to_string(&mut rest).is_ok() && !rest.is_empty() {
            self.capture(&mut stdout, rest.as_bytes(), false);
        }
        rest.clear();
        if channel.stderr().read_to_string(&mut rest).is_ok() && !rest.is_empty() {
            self.capture(&mut stderr, rest.as_bytes(), true);
        }

        Some((stdout, stderr))
    }

    fn capture(&self, sink: &mut String, bytes: &[u8], is_err: bool) {
        let chunk = String::from_utf8_lossy(bytes);
        if self.cfg.verbose {
            if is_err {
                let _ = std::io::stderr().write_all(chunk.as_bytes());
                let _ = std::io::stderr().flush();
            } else {
                let _ = std::io::stdout().write_all(chunk.as_bytes());
                let _ = std::io::stdout().flush();
            }
        }
        sink.push_str(&chunk);
    }
}

impl CommandRunner for SshSession {
    fn connect(&mut self) -> bool {
        if self.is_alive() {
            return true;
        }
        self.session = None;
        match self.try_connect() {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to establish ssh connection to {}: {e}", self.target);
                false
            }
        }
    }

    fn execute(
        &mut self,
        command: &str,
        timeout: Option<Duration>,
        elevated: bool,
    ) -> ExecOutcome {
        // The channel may have died since the last call; reconnect
        // transparently before giving up.
        if !self.connect() {
            warn!("cannot execute command: no connection to {}", self.target);
            return ExecOutcome::timed_out();
        }

        let command = if elevated {
            elevate(command)
        } else {
            command.to_owned()
        };
        debug!("running on {}: {}", self.target, command);

        let idle_timeout =
            timeout.unwrap_or_else(|| Duration::from_secs(self.cfg.exec_timeout_secs));

        let opened = {
            let session = self.session.as_ref().expect("connected session");
            session.channel_session()
        };
        let mut channel = match opened {
            Ok(c) => c,
            Err(e) => {
                warn!("failed to open channel to {}: {e}", self.target);
                self.session = None;
                return ExecOutcome::timed_out();
            }
        };
        let session = self.session.as_ref().expect("connected session");
        // A pty coaxes line-buffered output out of tools that would
        // otherwise buffer until exit.
        if let Err(e) = channel.request_pty("xterm", None, None) {
            debug!("pty request failed on {}: {e}", self.target);
        }
        if let Err(e) = channel.exec(&command) {
            warn!("exec failed on {}: {e}", self.target);
            session.set_blocking(true);
            return ExecOutcome::timed_out();
        }

        let Some((stdout, stderr)) = self.drain_channel(session, &mut channel, idle_timeout)
        else {
            warn!(
                "command idle for {}s on {} - declaring it dead",
                idle_timeout.as_secs(),
                self.target
            );
            return ExecOutcome::timed_out();
        };

        let _ = channel.wait_close();
        let status = channel.exit_status().ok();

        let stdout = stdout.trim().to_owned();
        let stderr = stderr.trim().to_owned();
        let combined = if stderr.is_empty() {
            stdout
        } else if stdout.is_empty() {
            stderr
        } else {
            format!("{stdout}\n{stderr}")
        };
        ExecOutcome {
            output: Some(combined),
            status,
        }
    }

    fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.disconnect(None, "closing", None);
            debug!("ssh connection closed to {}", self.target);
        }
    }

    fn target(&self) -> &str {
        &self.target
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Opens sessions to provisioned units. The executor asks for one lazily,
/// only when an action inside the execution window actually runs.
pub trait Connector {
    fn open(&self, target: &str) -> Result<Box<dyn CommandRunner>, RemoteError>;
}

/// Production connector: a fresh [`SshSession`] per target.
pub struct SshConnector {
    pub cfg: SessionSection,
}

impl Connector for SshConnector {
    fn open(&self, target: &str) -> Result<Box<dyn CommandRunner>, RemoteError> {
        let mut session = SshSession::new(target, self.cfg.clone());
        if !session.connect() {
            return Err(RemoteError::ConnectFailed(target.to_owned()));
        }
        Ok(Box::new(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_parsing_splits_user() {
        let s = SshSession::new("ops@10.0.0.7", SessionSection::default());
        assert_eq!(s.username, "ops");
        assert_eq!(s.hostname, "10.0.0.7");
    }

    #[test]
    fn target_parsing_uses_default_username() {
        let s = SshSession::new("virt.lab", SessionSection::default());
        assert_eq!(s.username, "root");
        assert_eq!(s.hostname, "virt.lab");
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("echo hi"), "'echo hi'");
        assert_eq!(shell_quote("it's"), r#"'it'"'"'s'"#);
    }

    #[test]
    fn elevate_single_line_quotes() {
        let cmd = elevate("systemctl restart dnsd");
        assert_eq!(cmd, "sudo -n bash -c 'systemctl restart dnsd'");
    }

    #[test]
    fn elevate_multiline_uses_base64() {
        let script = "set -e\napt-get update\n";
        let cmd = elevate(script);
        assert!(cmd.starts_with("sudo -n bash -c 'echo "));
        assert!(cmd.contains("| base64 -d | bash"));
        let encoded = cmd
            .strip_prefix("sudo -n bash -c 'echo ")
            .unwrap()
            .split_whitespace()
            .next()
            .unwrap();
        let decoded = BASE64.decode(encoded).unwrap();
        assert_eq!(decoded, script.as_bytes());
    }

    #[test]
    fn elevate_single_quote_command_uses_base64() {
        let cmd = elevate("echo 'hi'");
        assert!(cmd.contains("base64 -d"));
    }

    #[test]
    fn outcome_absent_status_is_not_success() {
        assert!(!ExecOutcome::timed_out().succeeded());
        assert!(!ExecOutcome::of("out", 1).succeeded());
        assert!(ExecOutcome::of("out", 0).succeeded());
    }
}
