//! Sandboxed execution of externally-triggered commands.
//!
//! Every run acquires its own isolated environment from an
//! [`IsolationBackend`] and releases it on every exit path. The security
//! model is layered:
//!
//! 1. Command screening: obvious destructive or egress commands never start
//! 2. Fail-closed setup: no backend, no execution (never falls back to host)
//! 3. Container isolation: no network, read-only root, no capabilities,
//!    unprivileged user, memory/pid limits
//! 4. Wall-clock timeout: the environment is torn down when it elapses
//! 5. Output monitoring: denied-capability errors are reported as violations

pub mod backend;
pub mod limits;
pub mod monitor;
pub mod output;

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::manifest::Manifest;

pub use backend::{ContainerBackend, IsolationBackend};
pub use limits::{ExecIdentity, SandboxLimits};
pub use monitor::{ChannelObserver, TracingObserver, ViolationObserver, ViolationReport};
pub use output::{OutputBuffer, TRUNCATION_MARKER};

/// Default number of concurrent sandbox runs.
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxOutcome {
    Completed,
    TimedOut,
    ViolationDetected,
    SetupFailed,
}

/// Structured result of one sandbox run.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxResult {
    pub outcome: SandboxOutcome,
    /// Real exit code; `None` for timeouts, setup failures and
    /// pre-execution rejections.
    pub exit_code: Option<i32>,
    /// Combined stdout/stderr, size-bounded.
    pub output: String,
    pub output_truncated: bool,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    /// Present only for `ViolationDetected`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violation_detail: Option<String>,
    /// Present only for `SetupFailed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_error: Option<String>,
    /// The isolated environment was confirmed gone after the run
    /// (trivially true when none was created).
    pub environment_released: bool,
}

fn serialize_millis<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(duration.as_millis() as u64)
}

impl SandboxResult {
    fn setup_failed(reason: String, duration: Duration) -> Self {
        Self {
            outcome: SandboxOutcome::SetupFailed,
            exit_code: None,
            output: String::new(),
            output_truncated: false,
            duration,
            violation_detail: None,
            setup_error: Some(reason),
            environment_released: true,
        }
    }

    fn rejected(detail: String, duration: Duration) -> Self {
        Self {
            outcome: SandboxOutcome::ViolationDetected,
            exit_code: None,
            output: String::new(),
            output_truncated: false,
            duration,
            violation_detail: Some(detail),
            setup_error: None,
            environment_released: true,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == SandboxOutcome::Completed && self.exit_code == Some(0)
    }

    /// Summary suitable for attesting the run: outcome, exit code, duration
    /// and the SHA-256 of the captured output (not the output itself).
    pub fn to_manifest(&self, command: &str) -> Manifest {
        use sha2::{Digest, Sha256};

        let mut m = Manifest::new();
        m.insert("command", command);
        m.insert(
            "outcome",
            serde_json::to_value(self.outcome)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
        );
        match self.exit_code {
            Some(code) => m.insert("exit_code", i64::from(code)),
            None => m.insert("exit_code", crate::manifest::ManifestValue::Null),
        }
        m.insert("duration_ms", self.duration.as_millis() as i64);
        m.insert("output_sha256", hex::encode(Sha256::digest(self.output.as_bytes())));
        m.insert("output_truncated", self.output_truncated);
        if let Some(ref detail) = self.violation_detail {
            m.insert("violation_detail", detail.as_str());
        }
        m
    }
}

/// Builds the shell command line for argv-style input.
///
/// A single argument is taken as a complete command line. Several
/// arguments are quoted word by word, so `["python", "-c", "print(1)"]`
/// reaches the shell as three words.
pub fn command_line<S: AsRef<str>>(args: &[S]) -> String {
    match args {
        [single] => single.as_ref().to_string(),
        _ => shell_words::join(args),
    }
}

/// Runs commands through an isolation backend with a bounded number of
/// concurrent runs.
pub struct SandboxEnforcer {
    backend: Arc<dyn IsolationBackend>,
    observer: Arc<dyn ViolationObserver>,
    semaphore: Arc<Semaphore>,
}

impl SandboxEnforcer {
    pub fn new(
        backend: Arc<dyn IsolationBackend>,
        observer: Arc<dyn ViolationObserver>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            backend,
            observer,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Executes `command` in a fresh isolated environment under `limits`.
    ///
    /// Never returns an error: every failure is classified in the result.
    /// Violations are also sent to the configured observer.
    pub async fn run(&self, command: &str, limits: &SandboxLimits) -> SandboxResult {
        let started = Instant::now();

        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                return SandboxResult::setup_failed(format!("worker pool closed: {e}"), started.elapsed())
            }
        };

        if let Some(detail) = monitor::screen_command(command, limits) {
            let result = SandboxResult::rejected(detail, started.elapsed());
            self.report(None, command, &result);
            return result;
        }

        if let Err(e) = self.backend.probe().await {
            error!("Sandbox backend {} unavailable: {e:#}", self.backend.name());
            return SandboxResult::setup_failed(
                format!("{} unavailable: {e:#}", self.backend.name()),
                started.elapsed(),
            );
        }

        let env_id = format!("sprint-sbx-{}", uuid::Uuid::new_v4().simple());
        info!(
            "Sandbox {env_id} starting via {} (timeout {}s, network {})",
            self.backend.name(),
            limits.timeout().as_secs(),
            if limits.disallow_network() { "off" } else { "on" }
        );

        let mut guard = EnvironmentGuard {
            backend: Arc::clone(&self.backend),
            env_id: env_id.clone(),
            armed: true,
        };
        let mut result = self.execute(&env_id, command, limits, started).await;
        result.environment_released = self.release(&env_id).await;
        guard.armed = false;
        result.duration = started.elapsed();

        if result.outcome == SandboxOutcome::Completed {
            if let Some(detail) = monitor::detect_violation(&result.output, limits) {
                result.outcome = SandboxOutcome::ViolationDetected;
                result.violation_detail = Some(detail);
            }
        }
        if result.outcome == SandboxOutcome::ViolationDetected {
            self.report(Some(&env_id), command, &result);
        }

        info!(
            "Sandbox {env_id} finished: {:?} (exit {:?}, {}ms)",
            result.outcome,
            result.exit_code,
            result.duration.as_millis()
        );
        result
    }

    async fn execute(
        &self,
        env_id: &str,
        command: &str,
        limits: &SandboxLimits,
        started: Instant,
    ) -> SandboxResult {
        let mut cmd = match self.backend.launch(env_id, command, limits) {
            Ok(cmd) => cmd,
            Err(e) => return SandboxResult::setup_failed(format!("{e:#}"), started.elapsed()),
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return SandboxResult::setup_failed(
                    format!("cannot start {}: {e}", self.backend.name()),
                    started.elapsed(),
                )
            }
        };

        let buffer = Arc::new(Mutex::new(OutputBuffer::new(limits.max_output_bytes())));
        let stdout_task = tokio::spawn(drain(child.stdout.take(), Arc::clone(&buffer)));
        let stderr_task = tokio::spawn(drain(child.stderr.take(), Arc::clone(&buffer)));
        let stdout_abort = stdout_task.abort_handle();
        let stderr_abort = stderr_task.abort_handle();

        let waited = tokio::time::timeout(limits.timeout(), async {
            let status = child.wait().await;
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            status
        })
        .await;

        let (outcome, exit_code, setup_error) = match waited {
            Ok(Ok(status)) => (SandboxOutcome::Completed, status.code(), None),
            Ok(Err(e)) => {
                warn!("Sandbox {env_id}: lost track of the launcher process: {e}");
                (SandboxOutcome::SetupFailed, None, Some(format!("wait failed: {e}")))
            }
            Err(_) => {
                warn!(
                    "Sandbox {env_id} exceeded {}s, tearing down",
                    limits.timeout().as_secs()
                );
                if let Err(e) = child.kill().await {
                    debug!("Sandbox {env_id}: kill after timeout: {e}");
                }
                stdout_abort.abort();
                stderr_abort.abort();
                (SandboxOutcome::TimedOut, None, None)
            }
        };

        let (output, output_truncated) = match buffer.lock() {
            Ok(buf) => (buf.render(), buf.is_truncated()),
            Err(_) => (String::new(), false),
        };

        SandboxResult {
            outcome,
            exit_code,
            output,
            output_truncated,
            duration: started.elapsed(),
            violation_detail: None,
            setup_error,
            environment_released: false,
        }
    }

    /// Tears the environment down and confirms it is gone.
    async fn release(&self, env_id: &str) -> bool {
        if let Err(e) = self.backend.teardown(env_id).await {
            error!("Sandbox {env_id}: teardown failed: {e:#}");
        }
        match self.backend.exists(env_id).await {
            Ok(false) => {
                debug!("Sandbox {env_id} released");
                true
            }
            Ok(true) => {
                error!("Sandbox {env_id} still present after teardown");
                false
            }
            Err(e) => {
                error!("Sandbox {env_id}: cannot confirm teardown: {e:#}");
                false
            }
        }
    }

    fn report(&self, env_id: Option<&str>, command: &str, result: &SandboxResult) {
        let report = ViolationReport {
            env_id: env_id.map(str::to_string),
            command: command.to_string(),
            detail: result.violation_detail.clone().unwrap_or_default(),
            exit_code: result.exit_code,
            detected_at: chrono::Utc::now().to_rfc3339(),
        };
        self.observer.report(&report);
    }
}

/// Tears the environment down in the background if a run is dropped
/// before it reaches its own release step.
struct EnvironmentGuard {
    backend: Arc<dyn IsolationBackend>,
    env_id: String,
    armed: bool,
}

impl Drop for EnvironmentGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let backend = Arc::clone(&self.backend);
        let env_id = std::mem::take(&mut self.env_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Sandbox {env_id} abandoned mid-run, tearing down");
                handle.spawn(async move {
                    if let Err(e) = backend.teardown(&env_id).await {
                        error!("Sandbox {env_id}: teardown after abandon failed: {e:#}");
                    }
                });
            }
            Err(_) => error!("Sandbox {env_id} abandoned outside a runtime, cannot tear down"),
        }
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<R>, buffer: Arc<Mutex<OutputBuffer>>) {
    let Some(mut reader) = reader else {
        return;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut buf) = buffer.lock() {
                    buf.push(&chunk[..n]);
                }
            }
        }
    }
}
