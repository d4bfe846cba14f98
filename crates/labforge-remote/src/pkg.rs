//! Package-manager coordination.
//!
//! The remote package database is a shared, contention-prone resource:
//! unattended upgrades, periodic index refreshes, and our own actions all
//! compete for the same dpkg/apt locks. The coordinator observes lock-file
//! state, waits within a bounded budget, terminates holders it can
//! identify, and retries guarded commands a fixed number of times. Lock
//! and repository-definition failures are resolved internally; anything
//! else aborts immediately.

use crate::classify::classify;
use crate::session::CommandRunner;
use crate::RemoteError;
use labforge_config::{PackageSection, WaitSection};
use std::time::Duration;
use tracing::{debug, info, warn};

const PKG_LOCK_PATTERNS: &[&str] = &[
    "could not get lock",
    "unable to lock",
    "resource temporarily unavailable",
    "is another process using it",
];

const PKG_REPOSITORY_PATTERNS: &[&str] = &[
    "no longer has a release file",
    "404  not found",
    "release' no longer has",
];

const SHORT_TIMEOUT: Duration = Duration::from_secs(5);
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);
const LONG_TIMEOUT: Duration = Duration::from_secs(600);

/// A process observed holding a package lock file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub path: String,
    pub pid: u32,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PkgFailure {
    Lock,
    Repository,
    Other,
}

pub struct PkgCoordinator {
    packages: PackageSection,
    waits: WaitSection,
    cached_refresh: Option<String>,
    sources_fixed: bool,
}

impl PkgCoordinator {
    pub fn new(packages: &PackageSection, waits: &WaitSection) -> Self {
        Self {
            packages: packages.clone(),
            waits: *waits,
            cached_refresh: None,
            sources_fixed: false,
        }
    }

    /// Inspect every known lock file and resolve the holder of each one
    /// that exists, pid-lookup via lsof with a fuser fallback.
    pub fn check_locks(&self, runner: &mut dyn CommandRunner) -> Vec<LockHolder> {
        let mut holders = Vec::new();
        for path in &self.packages.lock_files {
            let exists = runner.execute(
                &format!("test -e {path} && echo held || echo clear"),
                Some(SHORT_TIMEOUT),
                true,
            );
            if !exists.output.unwrap_or_default().contains("held") {
                continue;
            }

            let pid = self
                .resolve_pid(runner, &format!("lsof -t {path} 2>/dev/null"))
                .or_else(|| self.resolve_pid(runner, &format!("fuser {path} 2>/dev/null")));
            let Some(pid) = pid else {
                debug!("lock file {path} exists but no holder pid resolved");
                continue;
            };

            let alive = runner.execute(
                &format!("kill -0 {pid} 2>/dev/null && echo alive || echo gone"),
                Some(SHORT_TIMEOUT),
                true,
            );
            if !alive.output.unwrap_or_default().contains("alive") {
                continue;
            }

            let name = runner
                .execute(
                    &format!("ps -p {pid} -o comm= 2>/dev/null"),
                    Some(SHORT_TIMEOUT),
                    true,
                )
                .output
                .map(|o| o.trim().to_owned())
                .filter(|o| !o.is_empty())
                .unwrap_or_else(|| "unknown".to_owned());

            if holders.iter().all(|h: &LockHolder| h.pid != pid) {
                holders.push(LockHolder {
                    path: path.clone(),
                    pid,
                    name,
                });
            }
        }
        holders
    }

    fn resolve_pid(&self, runner: &mut dyn CommandRunner, command: &str) -> Option<u32> {
        let outcome = runner.execute(command, Some(SHORT_TIMEOUT), true);
        if !outcome.succeeded() {
            return None;
        }
        outcome
            .output?
            .split_whitespace()
            .next()?
            .parse::<u32>()
            .ok()
    }

    /// Poll until the locks clear, within the configured budget. On budget
    /// exhaustion, terminate every resolved holder and re-check once; a
    /// lock that survives termination is a hard failure.
    pub fn wait_for_release(
        &self,
        runner: &mut dyn CommandRunner,
        budget: Duration,
    ) -> Result<(), RemoteError> {
        let interval = Duration::from_secs(self.waits.lock_poll_secs.max(1));
        let attempts = (budget.as_secs() / interval.as_secs()) as u32;

        for _ in 0..attempts {
            let holders = self.check_locks(runner);
            if holders.is_empty() {
                return Ok(());
            }
            info!(
                "waiting for package locks: {}",
                describe_holders(&holders)
            );
            std::thread::sleep(interval);
        }

        let holders = self.check_locks(runner);
        if holders.is_empty() {
            return Ok(());
        }

        warn!(
            "lock wait budget exhausted, terminating holders: {}",
            describe_holders(&holders)
        );
        for holder in &holders {
            runner.execute(
                &format!("kill -9 {} 2>/dev/null || true", holder.pid),
                Some(Duration::from_secs(10)),
                true,
            );
            info!("terminated lock holder pid {} ({})", holder.pid, holder.name);
        }
        std::thread::sleep(Duration::from_secs(2));

        let holders = self.check_locks(runner);
        if holders.is_empty() {
            Ok(())
        } else {
            Err(RemoteError::LocksHeld(describe_holders(&holders)))
        }
    }

    /// Kill known package processes, remove stale lock files, and finish
    /// any half-configured packages.
    fn cleanup(&self, runner: &mut dyn CommandRunner) {
        let mut parts: Vec<String> = self
            .packages
            .cleanup_processes
            .iter()
            .map(|name| format!("pkill -9 -x {name} 2>/dev/null || true"))
            .collect();
        parts.extend(
            self.packages
                .cleanup_patterns
                .iter()
                .map(|pattern| format!("pkill -9 -f {pattern} 2>/dev/null || true")),
        );
        parts.extend(
            self.packages
                .lock_files
                .iter()
                .map(|path| format!("rm -f {path}")),
        );
        parts.push("dpkg --configure -a > /tmp/dpkg-configure.log 2>&1 || true".to_owned());
        parts.push("echo pkg_cleanup_done".to_owned());
        runner.execute(&parts.join(" && "), Some(CLEANUP_TIMEOUT), true);
    }

    /// Rewrite known-bad codenames and archive hosts in the source list.
    pub fn apply_source_fixes(&self, runner: &mut dyn CommandRunner) {
        info!("applying one-time package source corrections");
        for fix in &self.packages.codename_fixes {
            runner.execute(
                &format!(
                    "sed -i 's/{}/{}/g' /etc/apt/sources.list",
                    fix.from, fix.to
                ),
                Some(Duration::from_secs(30)),
                true,
            );
        }
        for fix in &self.packages.host_fixes {
            runner.execute(
                &format!(
                    "sed -i 's|{}|{}|g' /etc/apt/sources.list",
                    fix.from, fix.to
                ),
                Some(Duration::from_secs(30)),
                true,
            );
        }
    }

    fn detect_failure(&self, output: Option<&str>, status: Option<i32>) -> PkgFailure {
        let Some(output) = output else {
            return PkgFailure::Other;
        };
        let lowered = output.to_lowercase();
        if PKG_LOCK_PATTERNS.iter().any(|p| lowered.contains(p)) {
            return PkgFailure::Lock;
        }
        if PKG_REPOSITORY_PATTERNS.iter().any(|p| lowered.contains(p))
            || self
                .packages
                .codename_fixes
                .iter()
                .any(|f| lowered.contains(&f.from.to_lowercase()))
        {
            return PkgFailure::Repository;
        }
        // apt reserves 100 for index/repository trouble.
        if status == Some(100) {
            return PkgFailure::Repository;
        }
        PkgFailure::Other
    }

    /// Refresh the package index. The result is cached and reused by an
    /// immediately-following install in the same coordinator, saving a
    /// redundant remote round-trip.
    pub fn refresh(&mut self, runner: &mut dyn CommandRunner) -> Result<String, RemoteError> {
        if let Some(cached) = &self.cached_refresh {
            debug!("reusing cached package index refresh");
            return Ok(cached.clone());
        }
        let output = self.run(runner, "apt-get update -y < /dev/null", Some(LONG_TIMEOUT))?;
        self.cached_refresh = Some(output.clone());
        Ok(output)
    }

    pub fn install(
        &mut self,
        runner: &mut dyn CommandRunner,
        packages: &[String],
    ) -> Result<String, RemoteError> {
        self.refresh(runner)?;
        let cmd = format!(
            "DEBIAN_FRONTEND=noninteractive apt-get install -y -qq {}",
            packages.join(" ")
        );
        self.run(runner, &cmd, Some(LONG_TIMEOUT))
    }

    pub fn upgrade(&mut self, runner: &mut dyn CommandRunner) -> Result<String, RemoteError> {
        self.refresh(runner)?;
        self.run(
            runner,
            "DEBIAN_FRONTEND=noninteractive apt-get dist-upgrade -y",
            Some(LONG_TIMEOUT),
        )
    }

    /// Guarded execution of one package command: pre-flight lock
    /// resolution, then bounded retries. Lock failures trigger cleanup and
    /// retry; a repository failure triggers the one-time source fix and a
    /// single retry; any other failure aborts immediately.
    pub fn run(
        &mut self,
        runner: &mut dyn CommandRunner,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<String, RemoteError> {
        if !self.check_locks(runner).is_empty() {
            self.wait_for_release(runner, Duration::from_secs(self.waits.lock_wait_secs))?;
        }

        let attempts = self.waits.pkg_attempts.max(1);
        let delay = Duration::from_secs(self.waits.pkg_retry_delay_secs);
        let mut last_message = String::new();

        for attempt in 1..=attempts {
            let outcome = runner.execute(command, timeout, true);
            let report = classify(outcome.output.as_deref(), outcome.status);
            if report.success {
                return Ok(outcome.output.unwrap_or_default());
            }

            last_message = report.message.clone().unwrap_or_default();
            match self.detect_failure(outcome.output.as_deref(), outcome.status) {
                PkgFailure::Lock => {
                    warn!(
                        "package command hit lock contention (attempt {attempt}/{attempts}), \
                         cleaning up and retrying"
                    );
                    self.cleanup(runner);
                    std::thread::sleep(delay);
                }
                PkgFailure::Repository if !self.sources_fixed => {
                    warn!(
                        "package command hit a repository error (attempt {attempt}/{attempts}), \
                         fixing sources and retrying once"
                    );
                    self.apply_source_fixes(runner);
                    self.sources_fixed = true;
                    std::thread::sleep(Duration::from_secs(2));
                }
                PkgFailure::Repository => {
                    return Err(RemoteError::PackageFailed {
                        kind: "repository".to_owned(),
                        message: last_message,
                    });
                }
                PkgFailure::Other => {
                    return Err(RemoteError::PackageFailed {
                        kind: report.kind.to_string(),
                        message: last_message,
                    });
                }
            }
        }

        Err(RemoteError::PackageFailed {
            kind: "lock".to_owned(),
            message: format!("retries exhausted after {attempts} attempts: {last_message}"),
        })
    }
}

fn describe_holders(holders: &[LockHolder]) -> String {
    holders
        .iter()
        .map(|h| format!("{}: pid {} ({})", h.path, h.pid, h.name))
        .collect::<Vec<_>>()
        .join("; ")
}
