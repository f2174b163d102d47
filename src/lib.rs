//! Tamper-evident provenance for sprint manifests, and sandboxed execution
//! of the commands they trigger.

pub mod attestation;
pub mod config;
pub mod error;
pub mod keys;
pub mod ledger;
pub mod manifest;
pub mod provenance;
pub mod sandbox;
pub mod validator;

pub use attestation::{Attestation, AttestationService, VerificationResult};
pub use config::Config;
pub use error::{ProvenanceError, Result};
pub use keys::KeyManager;
pub use ledger::{LedgerEntry, LedgerFilter, LedgerStore};
pub use manifest::{canonicalize, digest, CanonicalBytes, Manifest, ManifestValue};
pub use provenance::Provenance;
pub use sandbox::{SandboxEnforcer, SandboxLimits, SandboxOutcome, SandboxResult};
pub use validator::{content_digest, seal, ManifestHashRecord, ManifestValidator};

/// Seconds since the Unix epoch, microsecond resolution.
pub(crate) fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
