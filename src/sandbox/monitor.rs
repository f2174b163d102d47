//! Violation detection and reporting.
//!
//! Two checks: `screen_command` runs before any environment is created and
//! rejects commands that plainly ask for a disallowed capability;
//! `detect_violation` runs on captured output and recognises the errors the
//! isolation layer produces when a command hits a denied capability.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, warn};

use super::limits::SandboxLimits;

/// Destructive patterns refused regardless of limits (whitespace-normalized).
const DESTRUCTIVE_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    "rm -fr /",
    ":(){ :|:& };:",
    ":(){:|:&};:",
];

/// Programs refused at command position (basename match).
const DESTRUCTIVE_PROGRAMS: &[&str] = &["mkfs", "shutdown", "reboot", "halt"];

/// Network clients refused at command position when network is disallowed.
const NETWORK_PROGRAMS: &[&str] = &[
    "curl", "wget", "nc", "ncat", "netcat", "ssh", "scp", "sftp", "telnet", "ftp", "rsync",
];

/// Error text produced when a process tries to reach a disabled network.
const NETWORK_DENIAL_SIGNATURES: &[&str] = &[
    "Network is unreachable",
    "Could not resolve host",
    "Temporary failure in name resolution",
    "Name or service not known",
    "No address associated with hostname",
];

/// Error text produced when a process writes to a read-only root.
const READ_ONLY_SIGNATURES: &[&str] = &["Read-only file system"];

/// Checks a command before execution. Returns the violation detail if the
/// command must not run.
pub fn screen_command(command: &str, limits: &SandboxLimits) -> Option<String> {
    let normalized = command.split_whitespace().collect::<Vec<_>>().join(" ");
    for pattern in DESTRUCTIVE_PATTERNS {
        let matched = normalized == *pattern
            || normalized.starts_with(&format!("{pattern} "))
            || normalized.contains(&format!("{pattern} "))
            || normalized.ends_with(pattern);
        if matched {
            return Some(format!("destructive command pattern `{pattern}`"));
        }
    }

    for program in command_programs(command) {
        if DESTRUCTIVE_PROGRAMS.contains(&program) || program.starts_with("mkfs.") {
            return Some(format!("destructive program `{program}`"));
        }
        if program == "dd" && command.contains("of=/dev/") {
            return Some("raw device write via `dd`".to_string());
        }
        if limits.disallow_network() && NETWORK_PROGRAMS.contains(&program) {
            return Some(format!(
                "network egress attempted via `{program}` while network is disallowed"
            ));
        }
    }
    None
}

/// Basenames of the programs at command position in a shell command line.
fn command_programs(command: &str) -> Vec<&str> {
    command
        .split(|c: char| matches!(c, ';' | '|' | '&' | '\n' | '(' | ')' | '`'))
        .filter_map(|segment| {
            segment
                .split_whitespace()
                .find(|word| !word.contains('=') && !matches!(*word, "sudo" | "exec" | "env" | "nohup" | "time"))
        })
        .map(|word| word.rsplit('/').next().unwrap_or(word))
        .collect()
}

/// Scans captured output for signs of a denied capability.
pub fn detect_violation(output: &str, limits: &SandboxLimits) -> Option<String> {
    if limits.disallow_network() {
        if let Some(sig) = NETWORK_DENIAL_SIGNATURES.iter().find(|s| output.contains(*s)) {
            return Some(format!("network egress attempted while network is disallowed ({sig})"));
        }
    }
    if limits.read_only_root() {
        if let Some(sig) = READ_ONLY_SIGNATURES.iter().find(|s| output.contains(*s)) {
            return Some(format!("write outside the scratch area ({sig})"));
        }
    }
    None
}

/// A detected attempt to exceed the sandbox's granted capabilities.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViolationReport {
    /// Isolated environment the command ran in; `None` if it was rejected
    /// before one was created.
    pub env_id: Option<String>,
    pub command: String,
    pub detail: String,
    pub exit_code: Option<i32>,
    pub detected_at: String,
}

/// Receives every violation, independently of the caller of `run`.
pub trait ViolationObserver: Send + Sync {
    fn report(&self, report: &ViolationReport);
}

/// Logs violations as security events.
pub struct TracingObserver;

impl ViolationObserver for TracingObserver {
    fn report(&self, report: &ViolationReport) {
        error!(
            target: "sprint_ledger::security",
            env_id = report.env_id.as_deref().unwrap_or("-"),
            exit_code = ?report.exit_code,
            "Sandbox violation: {} (command: {})",
            report.detail,
            report.command
        );
    }
}

/// Forwards violations to a channel (e.g. an audit writer task).
pub struct ChannelObserver {
    tx: mpsc::Sender<ViolationReport>,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::Sender<ViolationReport>) -> Self {
        Self { tx }
    }
}

impl ViolationObserver for ChannelObserver {
    fn report(&self, report: &ViolationReport) {
        if let Err(e) = self.tx.try_send(report.clone()) {
            // Never drop a violation silently
            warn!("Violation channel unavailable ({e}), logging instead");
            TracingObserver.report(report);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strict() -> SandboxLimits {
        SandboxLimits::default()
    }

    #[test]
    fn test_screen_allows_ordinary_commands() {
        assert_eq!(screen_command("python -m pytest tests/ -v", &strict()), None);
        assert_eq!(screen_command("ls -la /workspace && cat setup.cfg", &strict()), None);
        assert_eq!(screen_command("rm -rf /workspace/build", &strict()), None);
        assert_eq!(screen_command("echo curl is a tool", &strict()), None);
    }

    #[test]
    fn test_screen_rejects_destructive_patterns() {
        assert!(screen_command("rm -rf /", &strict()).is_some());
        assert!(screen_command("cd /tmp;   rm  -rf  /", &strict()).is_some());
        assert!(screen_command(":(){ :|:& };:", &strict()).is_some());
        assert!(screen_command("mkfs.ext4 /dev/sda1", &strict()).is_some());
        assert!(screen_command("dd if=/dev/zero of=/dev/sda", &strict()).is_some());
    }

    #[test]
    fn test_screen_rejects_network_clients_only_when_disallowed() {
        let detail = screen_command("curl https://example.com", &strict()).unwrap();
        assert!(detail.contains("curl"));
        assert!(screen_command("echo hi | /usr/bin/wget -qO- http://x", &strict()).is_some());
        assert!(screen_command("FOO=1 nc -z 10.0.0.1 22", &strict()).is_some());

        let open = SandboxLimits::default().allow_network();
        assert_eq!(screen_command("curl https://example.com", &open), None);
    }

    #[test]
    fn test_detect_network_denial() {
        let out = "curl: (6) Could not resolve host: example.com";
        assert!(detect_violation(out, &strict()).unwrap().contains("network"));
        assert_eq!(detect_violation(out, &SandboxLimits::default().allow_network()), None);
    }

    #[test]
    fn test_detect_read_only_write() {
        let out = "touch: cannot touch '/etc/x': Read-only file system";
        assert!(detect_violation(out, &strict()).unwrap().contains("scratch"));
        assert_eq!(detect_violation(out, &SandboxLimits::default().writable_root()), None);
        assert_eq!(detect_violation("all good", &strict()), None);
    }

    #[tokio::test]
    async fn test_channel_observer_forwards() {
        let (tx, mut rx) = mpsc::channel(4);
        let observer = ChannelObserver::new(tx);
        let report = ViolationReport {
            env_id: None,
            command: "curl x".into(),
            detail: "network".into(),
            exit_code: None,
            detected_at: "2026-01-01T00:00:00Z".into(),
        };
        observer.report(&report);
        assert_eq!(rx.recv().await, Some(report));
    }
}
