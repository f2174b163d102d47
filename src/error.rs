//! Error taxonomy shared by the ledger, key store and validator.
//!
//! Verification failures (`HashMismatch`, `SignatureInvalid`, `UnknownKey`)
//! and sandbox failures (`TimedOut`, `ViolationDetected`, `SetupFailed`) are
//! not errors: they are returned as classified values by
//! [`crate::attestation::VerificationResult`] and
//! [`crate::sandbox::SandboxOutcome`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvenanceError {
    /// A manifest value has no canonical byte form (e.g. NaN).
    #[error("manifest value at {path} has no canonical representation: {reason}")]
    UnserializableValue { path: String, reason: String },

    /// Persisted key material is missing, unreadable or inconsistent.
    /// Fatal for the process instance; never retried automatically.
    #[error("key store unavailable: {0}")]
    KeyStoreUnavailable(String),

    #[error("{0} not found")]
    NotFound(String),

    /// The ledger database could not be read or written.
    #[error("ledger storage failure: {0}")]
    Storage(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ProvenanceError {
    /// Returns true for errors that leave this process unable to
    /// produce or record attestations.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::KeyStoreUnavailable(_) | Self::Storage(_))
    }
}

impl From<rusqlite::Error> for ProvenanceError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

pub type Result<T, E = ProvenanceError> = std::result::Result<T, E>;
