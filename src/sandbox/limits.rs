//! Per-run sandbox restrictions.
//!
//! Every field starts at its most restrictive value. Loosening one takes a
//! dedicated method, so a relaxation is always visible at the call site.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ProvenanceError, Result};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Output captured per run: 64 KiB
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// `nobody:nogroup` on most distributions
pub const UNPRIVILEGED_UID: u32 = 65534;
pub const UNPRIVILEGED_GID: u32 = 65534;

/// Identity the command runs as inside the isolated environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecIdentity {
    Unprivileged { uid: u32, gid: u32 },
    Root,
}

impl Default for ExecIdentity {
    fn default() -> Self {
        Self::Unprivileged {
            uid: UNPRIVILEGED_UID,
            gid: UNPRIVILEGED_GID,
        }
    }
}

/// Restrictions for one sandbox run.
///
/// `Default` is the most restrictive setting: no network, unprivileged
/// user, read-only root filesystem, no scratch area. Each restriction can
/// only be loosened through its own explicit method.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxLimits {
    timeout: Duration,
    disallow_network: bool,
    identity: ExecIdentity,
    read_only_root: bool,
    scratch_dir: Option<PathBuf>,
    max_output_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            disallow_network: true,
            identity: ExecIdentity::default(),
            read_only_root: true,
            scratch_dir: None,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl SandboxLimits {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs as a specific non-root uid/gid. Root (uid or gid 0) is only
    /// reachable through [`run_as_root`](Self::run_as_root).
    pub fn with_unprivileged_user(mut self, uid: u32, gid: u32) -> Result<Self> {
        if uid == 0 || gid == 0 {
            return Err(ProvenanceError::InvalidInput(format!(
                "{uid}:{gid} is not an unprivileged identity"
            )));
        }
        self.identity = ExecIdentity::Unprivileged { uid, gid };
        Ok(self)
    }

    /// The only writable location besides the container's private `/tmp`.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn allow_network(mut self) -> Self {
        self.disallow_network = false;
        self
    }

    pub fn run_as_root(mut self) -> Self {
        self.identity = ExecIdentity::Root;
        self
    }

    pub fn writable_root(mut self) -> Self {
        self.read_only_root = false;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn disallow_network(&self) -> bool {
        self.disallow_network
    }

    pub fn identity(&self) -> &ExecIdentity {
        &self.identity
    }

    pub fn read_only_root(&self) -> bool {
        self.read_only_root
    }

    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch_dir.as_deref()
    }

    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_most_restrictive() {
        let limits = SandboxLimits::default();
        assert!(limits.disallow_network());
        assert!(limits.read_only_root());
        assert_eq!(
            limits.identity(),
            &ExecIdentity::Unprivileged { uid: 65534, gid: 65534 }
        );
        assert!(limits.scratch_dir().is_none());
        assert_eq!(limits.timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_relaxations_are_explicit_and_independent() {
        let limits = SandboxLimits::default().allow_network();
        assert!(!limits.disallow_network());
        assert!(limits.read_only_root());
        assert_ne!(limits.identity(), &ExecIdentity::Root);

        let limits = SandboxLimits::default().run_as_root().writable_root();
        assert!(limits.disallow_network());
        assert!(!limits.read_only_root());
        assert_eq!(limits.identity(), &ExecIdentity::Root);
    }

    #[test]
    fn test_tightening_settings_keep_restrictions() {
        let limits = SandboxLimits::default()
            .with_timeout(Duration::from_secs(5))
            .with_scratch_dir("/srv/scratch")
            .with_unprivileged_user(1000, 1000)
            .unwrap()
            .with_max_output_bytes(1024);
        assert!(limits.disallow_network());
        assert!(limits.read_only_root());
        assert_eq!(limits.scratch_dir(), Some(Path::new("/srv/scratch")));
        assert_eq!(limits.max_output_bytes(), 1024);
    }

    #[test]
    fn test_unprivileged_user_cannot_be_root() {
        for (uid, gid) in [(0, 0), (0, 1000), (1000, 0)] {
            assert!(matches!(
                SandboxLimits::default().with_unprivileged_user(uid, gid),
                Err(ProvenanceError::InvalidInput(_))
            ));
        }
        assert_eq!(
            SandboxLimits::default().identity(),
            &ExecIdentity::Unprivileged { uid: 65534, gid: 65534 }
        );
    }
}
