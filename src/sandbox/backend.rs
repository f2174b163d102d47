//! Isolation backends.
//!
//! A backend turns a command into a process that runs inside a freshly
//! created isolated environment, and destroys that environment afterwards.
//! The enforcer never runs anything on the host directly: if the backend
//! is unavailable the run fails closed.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::limits::{ExecIdentity, SandboxLimits};

/// Bound on backend housekeeping calls (probe, teardown, inspect).
const CONTROL_TIMEOUT: Duration = Duration::from_secs(15);

pub const DEFAULT_RUNTIME: &str = "docker";
pub const DEFAULT_IMAGE: &str = "python:3.12-slim";
pub const DEFAULT_MEMORY_LIMIT: &str = "512m";
pub const DEFAULT_PIDS_LIMIT: u32 = 256;

/// An isolation mechanism the enforcer can acquire per run.
///
/// All environments are identified by the `env_id` the enforcer picks.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Short name for logs, e.g. `"docker"`.
    fn name(&self) -> &str;

    /// Confirms environments can be created right now.
    async fn probe(&self) -> Result<()>;

    /// Builds the process that creates environment `env_id` and runs
    /// `command` in it under `limits`. Stdio is configured by the caller.
    fn launch(&self, env_id: &str, command: &str, limits: &SandboxLimits) -> Result<Command>;

    /// Destroys environment `env_id`. Succeeds if it is already gone.
    async fn teardown(&self, env_id: &str) -> Result<()>;

    /// Whether environment `env_id` still exists.
    async fn exists(&self, env_id: &str) -> Result<bool>;
}

/// OCI container backend driven through a Docker-compatible CLI.
#[derive(Debug, Clone)]
pub struct ContainerBackend {
    runtime: String,
    image: String,
    memory_limit: String,
    pids_limit: u32,
}

impl Default for ContainerBackend {
    fn default() -> Self {
        Self::new(DEFAULT_RUNTIME, DEFAULT_IMAGE)
    }
}

impl ContainerBackend {
    pub fn new(runtime: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            image: image.into(),
            memory_limit: DEFAULT_MEMORY_LIMIT.to_string(),
            pids_limit: DEFAULT_PIDS_LIMIT,
        }
    }

    pub fn with_resource_limits(mut self, memory_limit: impl Into<String>, pids_limit: u32) -> Self {
        self.memory_limit = memory_limit.into();
        self.pids_limit = pids_limit;
        self
    }

    /// Arguments for `<runtime> run ...`.
    pub fn run_args(&self, env_id: &str, command: &str, limits: &SandboxLimits) -> Result<Vec<String>> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "--name".into(),
            env_id.into(),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges:true".into(),
            "--memory".into(),
            self.memory_limit.clone(),
            "--pids-limit".into(),
            self.pids_limit.to_string(),
            "--tmpfs".into(),
            "/tmp:rw,noexec,nosuid,size=64m".into(),
        ];
        if limits.disallow_network() {
            args.extend(["--network", "none"].map(String::from));
        }
        if limits.read_only_root() {
            args.push("--read-only".into());
        }
        if let ExecIdentity::Unprivileged { uid, gid } = limits.identity() {
            args.extend([String::from("--user"), format!("{uid}:{gid}")]);
        }
        match limits.scratch_dir() {
            Some(dir) => {
                let host = absolute(dir)?;
                args.extend([
                    String::from("--volume"),
                    format!("{}:/workspace:rw", host.display()),
                    String::from("--workdir"),
                    String::from("/workspace"),
                ]);
            }
            None => args.extend(["--workdir", "/tmp"].map(String::from)),
        }
        args.extend([
            self.image.clone(),
            String::from("/bin/sh"),
            String::from("-c"),
            command.to_string(),
        ]);
        Ok(args)
    }

    async fn control(&self, args: &[&str]) -> Result<std::process::Output> {
        let mut cmd = Command::new(&self.runtime);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let output = tokio::time::timeout(CONTROL_TIMEOUT, cmd.output())
            .await
            .map_err(|_| anyhow!("{} {} timed out", self.runtime, args.join(" ")))?
            .map_err(|e| anyhow!("cannot run {}: {e}", self.runtime))?;
        Ok(output)
    }
}

fn absolute(dir: &Path) -> Result<std::path::PathBuf> {
    dir.canonicalize()
        .map_err(|e| anyhow!("scratch dir {} unusable: {e}", dir.display()))
}

#[async_trait]
impl IsolationBackend for ContainerBackend {
    fn name(&self) -> &str {
        &self.runtime
    }

    async fn probe(&self) -> Result<()> {
        let output = self.control(&["version", "--format", "{{.Server.Version}}"]).await?;
        if !output.status.success() {
            return Err(anyhow!(
                "{} daemon unavailable: {}",
                self.runtime,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        debug!(
            "{} server {} available",
            self.runtime,
            String::from_utf8_lossy(&output.stdout).trim()
        );
        Ok(())
    }

    fn launch(&self, env_id: &str, command: &str, limits: &SandboxLimits) -> Result<Command> {
        let mut cmd = Command::new(&self.runtime);
        cmd.args(self.run_args(env_id, command, limits)?);
        Ok(cmd)
    }

    async fn teardown(&self, env_id: &str) -> Result<()> {
        let output = self.control(&["rm", "--force", env_id]).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() || stderr.contains("No such container") {
            Ok(())
        } else {
            Err(anyhow!("{} rm {env_id} failed: {}", self.runtime, stderr.trim()))
        }
    }

    async fn exists(&self, env_id: &str) -> Result<bool> {
        let output = self.control(&["container", "inspect", "--format", "{{.Id}}", env_id]).await?;
        Ok(output.status.success())
    }
}
