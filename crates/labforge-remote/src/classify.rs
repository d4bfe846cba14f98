//! Command result classification.
//!
//! Raw remote output is noisy: tools print "error" in benign contexts,
//! syslog warnings leak into captured streams, and plenty of commands exit
//! zero while reporting a failure in text. The classifier first sanitizes
//! the output, then walks an ordered rule list where the first match wins.

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Error taxonomy shared by every component that inspects command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No error detected.
    None,
    Timeout,
    ConnectionError,
    PermissionDenied,
    NotFound,
    /// The resource already exists; tolerated as success-equivalent.
    AlreadyExists,
    InvalidArgument,
    ResourceExhausted,
    ServiceError,
    PackageError,
    NetworkError,
    CommandFailed,
    Unknown,
}

impl ErrorKind {
    /// Whether a report carrying this kind counts as success.
    pub fn tolerated(self) -> bool {
        matches!(self, Self::None | Self::AlreadyExists)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Timeout => "timeout",
            Self::ConnectionError => "connection_error",
            Self::PermissionDenied => "permission_denied",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::InvalidArgument => "invalid_argument",
            Self::ResourceExhausted => "resource_exhausted",
            Self::ServiceError => "service_error",
            Self::PackageError => "package_error",
            Self::NetworkError => "network_error",
            Self::CommandFailed => "command_failed",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Structured outcome of classifying one command execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReport {
    pub success: bool,
    pub kind: ErrorKind,
    pub message: Option<String>,
    pub status: Option<i32>,
}

impl CommandReport {
    fn success(status: Option<i32>) -> Self {
        Self {
            success: true,
            kind: ErrorKind::None,
            message: None,
            status,
        }
    }

    fn failure(kind: ErrorKind, message: impl Into<String>, status: Option<i32>) -> Self {
        Self {
            success: kind.tolerated(),
            kind,
            message: Some(message.into()),
            status,
        }
    }
}

struct Rule {
    pattern: Regex,
    kind: ErrorKind,
    description: &'static str,
}

fn rule(pattern: &str, kind: ErrorKind, description: &'static str) -> Rule {
    Rule {
        pattern: Regex::new(pattern).expect("static classification pattern"),
        kind,
        description,
    }
}

/// Ordered first-match-wins rules, applied to lowercased sanitized output.
fn rules() -> &'static [Rule] {
    static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
    RULES.get_or_init(|| {
        vec![
            rule(r"timeout|timed out|time out", ErrorKind::Timeout, "command timed out"),
            rule(
                r"connection (?:refused|reset|closed|failed)|unable to connect|cannot connect|connection error",
                ErrorKind::ConnectionError,
                "connection error",
            ),
            rule(
                r"ssh.*connection.*(?:refused|closed)",
                ErrorKind::ConnectionError,
                "ssh connection error",
            ),
            rule(
                r"permission denied|access denied|operation not permitted|eacces",
                ErrorKind::PermissionDenied,
                "permission denied",
            ),
            rule(
                r"not found|no such file|no such directory|command not found|file not found",
                ErrorKind::NotFound,
                "resource not found",
            ),
            rule(
                r"container.*(?:not found|does not exist)",
                ErrorKind::NotFound,
                "container not found",
            ),
            rule(
                r"already exists|already in use|already running|already part",
                ErrorKind::AlreadyExists,
                "resource already exists",
            ),
            rule(
                r"invalid (?:argument|option|parameter)|bad argument|unknown option",
                ErrorKind::InvalidArgument,
                "invalid argument",
            ),
            rule(
                r"no space left|disk full|out of memory|resource.*unavailable",
                ErrorKind::ResourceExhausted,
                "resource exhausted",
            ),
            rule(
                r"service.*(?:failed|error)|systemctl.*failed|failed to start.*service",
                ErrorKind::ServiceError,
                "service error",
            ),
            rule(
                r"failed to (?:start|stop|restart)",
                ErrorKind::ServiceError,
                "service operation failed",
            ),
            rule(
                r"package.*not found|unable to locate package|package.*unavailable",
                ErrorKind::PackageError,
                "package error",
            ),
            rule(
                r"e:\s*(?:unable to|package|error)",
                ErrorKind::PackageError,
                "package manager error",
            ),
            rule(
                r"failed to fetch|unable to fetch|404 not found.*package",
                ErrorKind::PackageError,
                "package fetch error",
            ),
            rule(
                r"network.*(?:error|unreachable)|no route to host",
                ErrorKind::NetworkError,
                "network error",
            ),
            // Bare failure tokens, guarded against hyphenated package names
            // such as libgpg-error-l10n.
            rule(
                r"(?:^|[^a-z0-9-])(?:error|failed|failure|fatal)(?:$|[^a-z0-9-])",
                ErrorKind::CommandFailed,
                "command failed",
            ),
        ]
    })
}

fn ansi_pattern() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| Regex::new(r"\x1b[@-_][0-?]*[ -/]*[@-~]").expect("static ansi pattern"))
}

const NOISE_PREFIXES: &[&str] = &[
    "logger: socket /dev/log",
    "logging to syslog failed",
    "locale:",
    "perl: warning:",
    "apparmor_parser:",
    "libgpg-error-l10n",
    "ssl-cert",
];

const NOISE_FRAGMENTS: &[&str] = &[
    "error: at least one profile failed to load",
    "setting locale failed",
    "pg_lsclusters: not found",
];

const NOISE_PACKAGES: &[&str] = &["libgpg-error-l10n", "ssl-cert", "rsyslog"];

/// Strip ANSI escapes and drop lines known to be benign noise that would
/// otherwise trip the failure-token rules.
pub fn sanitize(output: &str) -> String {
    let mut kept = Vec::new();
    for raw_line in output.lines() {
        let line = ansi_pattern().replace_all(raw_line, "");
        let stripped = line.trim();
        let lower = stripped.to_lowercase();
        if NOISE_PREFIXES.iter().any(|p| lower.starts_with(p)) {
            continue;
        }
        if NOISE_FRAGMENTS.iter().any(|f| lower.contains(f)) {
            continue;
        }
        // Package listings print names like libgpg-error-l10n that contain
        // a bare "error" token.
        if !stripped.is_empty() && !stripped.contains([':', '(', ')', '[', ']', '{', '}']) {
            let words: Vec<&str> = stripped.split_whitespace().collect();
            if words.len() <= 5 && words.iter().any(|w| NOISE_PACKAGES.contains(w)) {
                continue;
            }
        }
        kept.push(line.into_owned());
    }
    kept.join("\n")
}

fn first_matching_line(sanitized: &str, pattern: &Regex) -> Option<String> {
    for line in sanitized.lines() {
        if pattern.is_match(&line.to_lowercase()) {
            return Some(truncate(line.trim(), 200));
        }
    }
    None
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_owned();
    }
    let cut: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{cut}...")
}

/// Classify captured output plus exit status into a [`CommandReport`].
///
/// `output = None` with `status = None` always means the command timed out
/// or the transport died; an absent exit status never means success.
pub fn classify(output: Option<&str>, status: Option<i32>) -> CommandReport {
    let Some(output) = output else {
        return match status {
            None => CommandReport::failure(
                ErrorKind::Timeout,
                "command produced no output (possible timeout)",
                None,
            ),
            Some(0) => {
                CommandReport::failure(ErrorKind::Unknown, "command produced no output", Some(0))
            }
            Some(code) => CommandReport::failure(
                ErrorKind::CommandFailed,
                "command failed with no output",
                Some(code),
            ),
        };
    };

    // Empty output with a present status is a plain success.
    if output.is_empty() {
        return CommandReport::success(status);
    }

    let sanitized = sanitize(output);
    let lowered = sanitized.to_lowercase();

    for r in rules() {
        if r.pattern.is_match(&lowered) {
            let message = first_matching_line(&sanitized, &r.pattern)
                .unwrap_or_else(|| r.description.to_owned());
            return CommandReport::failure(r.kind, message, status);
        }
    }

    match status {
        Some(code) if code != 0 => CommandReport::failure(
            ErrorKind::CommandFailed,
            format!("command failed with exit code {code}"),
            status,
        ),
        _ => CommandReport::success(status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_output_is_success() {
        let report = classify(Some(""), Some(0));
        assert!(report.success);
        assert_eq!(report.kind, ErrorKind::None);
    }

    #[test]
    fn absent_output_and_status_is_timeout() {
        let report = classify(None, None);
        assert!(!report.success);
        assert_eq!(report.kind, ErrorKind::Timeout);
    }

    #[test]
    fn absent_output_with_nonzero_status() {
        let report = classify(None, Some(2));
        assert!(!report.success);
        assert_eq!(report.kind, ErrorKind::CommandFailed);
        assert_eq!(report.status, Some(2));
    }

    #[test]
    fn absent_output_with_zero_status_is_unknown() {
        let report = classify(None, Some(0));
        assert!(!report.success);
        assert_eq!(report.kind, ErrorKind::Unknown);
    }

    #[test]
    fn benign_warning_classifies_as_success() {
        let out = "logger: socket /dev/log: No such file or directory\nSetting up curl\n";
        let report = classify(Some(out), Some(0));
        assert!(report.success, "benign noise must not fail: {report:?}");
    }

    #[test]
    fn locale_and_apparmor_noise_dropped() {
        let out = "perl: warning: Setting locale failed.\n\
                   apparmor_parser: Unable to replace \"profile\"\n\
                   done\n";
        let report = classify(Some(out), Some(0));
        assert!(report.success);
    }

    #[test]
    fn exit_zero_with_error_token_fails() {
        let report = classify(Some("error: could not apply patch"), Some(0));
        assert!(!report.success);
        assert_eq!(report.kind, ErrorKind::CommandFailed);
    }

    #[test]
    fn already_exists_is_success_equivalent_on_nonzero_exit() {
        let report = classify(Some("volume create: vol0: failed: Volume vol0 already exists"), Some(1));
        assert!(report.success);
        assert_eq!(report.kind, ErrorKind::AlreadyExists);
    }

    #[test]
    fn package_name_with_error_token_is_not_a_failure() {
        let report = classify(Some("libgpg-error-l10n rsyslog\n"), Some(0));
        assert!(report.success, "{report:?}");
    }

    #[test]
    fn connection_refused_categorized() {
        let report = classify(Some("ssh: connect to host 10.0.0.5 port 22: Connection refused"), Some(255));
        assert!(!report.success);
        assert_eq!(report.kind, ErrorKind::ConnectionError);
    }

    #[test]
    fn permission_denied_categorized() {
        let report = classify(Some("bash: /etc/shadow: Permission denied"), Some(1));
        assert_eq!(report.kind, ErrorKind::PermissionDenied);
    }

    #[test]
    fn package_fetch_error_categorized() {
        let report = classify(
            Some("E: Failed to fetch http://archive.ubuntu.com/dists/foo/Release"),
            Some(100),
        );
        // Fetch failures hit the package rules before the generic token rule.
        assert_eq!(report.kind, ErrorKind::PackageError);
    }

    #[test]
    fn no_space_left_categorized() {
        let report = classify(Some("tar: /backup: No space left on device"), Some(2));
        assert_eq!(report.kind, ErrorKind::ResourceExhausted);
    }

    #[test]
    fn unmatched_nonzero_exit_is_command_failed() {
        let report = classify(Some("some unrecognized situation"), Some(3));
        assert_eq!(report.kind, ErrorKind::CommandFailed);
        assert!(report.message.unwrap().contains("exit code 3"));
    }

    #[test]
    fn ansi_sequences_stripped_before_matching() {
        let out = "\x1b[32mok\x1b[0m installed cleanly";
        let report = classify(Some(out), Some(0));
        assert!(report.success);
        assert_eq!(sanitize(out), "ok installed cleanly");
    }

    #[test]
    fn message_is_first_matching_line() {
        let out = "fetching index\nE: Unable to locate package weirdtool\nexiting";
        let report = classify(Some(out), Some(100));
        assert_eq!(report.kind, ErrorKind::PackageError);
        assert!(report.message.unwrap().contains("weirdtool"));
    }
}
