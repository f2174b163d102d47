use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use crate::sandbox::backend::{DEFAULT_IMAGE, DEFAULT_MEMORY_LIMIT, DEFAULT_PIDS_LIMIT, DEFAULT_RUNTIME};
use crate::sandbox::limits::DEFAULT_MAX_OUTPUT_BYTES;
use crate::sandbox::{ContainerBackend, SandboxLimits, DEFAULT_MAX_CONCURRENT};

pub const DEFAULT_CONFIG_PATH: &str = "config/ledger.toml";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub ledger: LedgerConfig,
    pub keys: KeysConfig,
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
    /// Upper bound on waiting for the database write lock
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

#[derive(Deserialize, Clone)]
pub struct KeysConfig {
    /// Holds `private.key` and `public.key`
    #[serde(default = "default_keys_dir")]
    pub dir: PathBuf,
    /// Hex Ed25519 seed supplied by the deployment, usually
    /// `"${LEDGER_SIGNING_KEY}"`. When set it is the signing key and no
    /// `private.key` is read or generated.
    #[serde(default)]
    pub private_key: Option<String>,
    /// Public key files of retired signing keys whose entries must still verify
    #[serde(default)]
    pub trusted_public_keys: Vec<PathBuf>,
}

impl fmt::Debug for KeysConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeysConfig")
            .field("dir", &self.dir)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("trusted_public_keys", &self.trusted_public_keys)
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    /// Docker-compatible CLI, e.g. "docker" or "podman"
    #[serde(default = "default_runtime")]
    pub runtime: String,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: u32,
    #[serde(default)]
    pub allow_network: bool,
    #[serde(default)]
    pub writable_root: bool,
    #[serde(default)]
    pub run_as_root: bool,
    /// Mounted read-write at /workspace inside the container
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("./data/ledger.db")
}

fn default_busy_timeout_secs() -> u64 {
    30
}

fn default_keys_dir() -> PathBuf {
    PathBuf::from("./keys")
}

fn default_runtime() -> String {
    DEFAULT_RUNTIME.to_string()
}

fn default_image() -> String {
    DEFAULT_IMAGE.to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_output_bytes() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}

fn default_memory_limit() -> String {
    DEFAULT_MEMORY_LIMIT.to_string()
}

fn default_pids_limit() -> u32 {
    DEFAULT_PIDS_LIMIT
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
            busy_timeout_secs: default_busy_timeout_secs(),
        }
    }
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            dir: default_keys_dir(),
            private_key: None,
            trusted_public_keys: Vec::new(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            image: default_image(),
            timeout_secs: default_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            max_concurrent: default_max_concurrent(),
            memory_limit: default_memory_limit(),
            pids_limit: default_pids_limit(),
            allow_network: false,
            writable_root: false,
            run_as_root: false,
            scratch_dir: None,
        }
    }
}

impl LedgerConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }
}

impl SandboxConfig {
    /// Limits for a run: the restrictive default, loosened only where the
    /// config explicitly says so.
    pub fn limits(&self) -> SandboxLimits {
        let mut limits = SandboxLimits::default()
            .with_timeout(Duration::from_secs(self.timeout_secs))
            .with_max_output_bytes(self.max_output_bytes);
        if let Some(ref dir) = self.scratch_dir {
            limits = limits.with_scratch_dir(dir);
        }
        if self.allow_network {
            limits = limits.allow_network();
        }
        if self.writable_root {
            limits = limits.writable_root();
        }
        if self.run_as_root {
            limits = limits.run_as_root();
        }
        limits
    }

    pub fn backend(&self) -> ContainerBackend {
        ContainerBackend::new(&self.runtime, &self.image)
            .with_resource_limits(&self.memory_limit, self.pids_limit)
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${LEDGER_HOME}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }

    /// Loads `path`, or falls back to defaults if it does not exist.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            info!("No configuration at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::ExecIdentity;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.ledger.path, PathBuf::from("./data/ledger.db"));
        assert_eq!(config.ledger.busy_timeout(), Duration::from_secs(30));
        assert_eq!(config.keys.dir, PathBuf::from("./keys"));
        assert!(config.keys.trusted_public_keys.is_empty());
        assert_eq!(config.sandbox.runtime, "docker");
        assert_eq!(config.sandbox.max_concurrent, 4);
        assert!(!config.sandbox.allow_network);
    }

    #[test]
    fn test_partial_sections_keep_field_defaults() {
        let config = Config::parse(
            r#"
[sandbox]
image = "alpine:3"
timeout_secs = 5
"#,
        )
        .unwrap();
        assert_eq!(config.sandbox.image, "alpine:3");
        assert_eq!(config.sandbox.timeout_secs, 5);
        assert_eq!(config.sandbox.memory_limit, "512m");
        assert_eq!(config.ledger.path, PathBuf::from("./data/ledger.db"));
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("SPRINT_LEDGER_TEST_HOME", "/srv/ledger");
        let config = Config::parse(
            r#"
[ledger]
path = "${SPRINT_LEDGER_TEST_HOME}/ledger.db"

[keys]
dir = "${SPRINT_LEDGER_TEST_HOME}/keys"
trusted_public_keys = ["${SPRINT_LEDGER_TEST_HOME}/old.pub"]
"#,
        )
        .unwrap();
        assert_eq!(config.ledger.path, PathBuf::from("/srv/ledger/ledger.db"));
        assert_eq!(config.keys.dir, PathBuf::from("/srv/ledger/keys"));
        assert_eq!(
            config.keys.trusted_public_keys,
            vec![PathBuf::from("/srv/ledger/old.pub")]
        );
    }

    #[test]
    fn test_injected_private_key_from_env() {
        let seed = "11".repeat(32);
        std::env::set_var("SPRINT_LEDGER_TEST_SIGNING_KEY", &seed);
        let config = Config::parse(
            r#"
[keys]
private_key = "${SPRINT_LEDGER_TEST_SIGNING_KEY}"
"#,
        )
        .unwrap();
        assert_eq!(config.keys.private_key.as_deref(), Some(seed.as_str()));
        assert!(!format!("{:?}", config.keys).contains(&seed));
        assert_eq!(Config::parse("").unwrap().keys.private_key, None);
    }

    #[test]
    fn test_undefined_env_var_is_an_error() {
        let result = Config::parse("[ledger]\npath = \"${SPRINT_LEDGER_SURELY_UNSET_VAR}\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_default_sandbox_limits_are_restrictive() {
        let limits = SandboxConfig::default().limits();
        assert_eq!(limits, SandboxLimits::default());
    }

    #[test]
    fn test_sandbox_relaxations_from_config() {
        let config = Config::parse(
            r#"
[sandbox]
allow_network = true
run_as_root = true
scratch_dir = "/srv/scratch"
timeout_secs = 10
"#,
        )
        .unwrap();
        let limits = config.sandbox.limits();
        assert!(!limits.disallow_network());
        assert_eq!(limits.identity(), &ExecIdentity::Root);
        assert!(limits.read_only_root());
        assert_eq!(limits.scratch_dir(), Some(Path::new("/srv/scratch")));
        assert_eq!(limits.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.sandbox.pids_limit, 256);
    }

    #[test]
    fn test_unknown_types_rejected() {
        assert!(Config::parse("[sandbox]\ntimeout_secs = \"soon\"\n").is_err());
    }
}
