//! Signed, fingerprinted statements binding a manifest digest to a sprint.
//!
//! The signature covers the canonical form of
//! `{manifest_hash, sprint_id, timestamp, version}`, so any later change to
//! one of those fields, or to the signature itself, is detected separately
//! from a change to the manifest content.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ProvenanceError, Result};
use crate::keys::{KeyManager, PublicKey, Signature};
use crate::manifest::{canonicalize, digest, Manifest, ManifestValue};

pub const ATTESTATION_VERSION: &str = "v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attestation {
    /// Hex SHA-256 of the manifest's canonical bytes.
    pub manifest_hash: String,
    /// Base64 Ed25519 signature over the signing payload.
    pub signature: String,
    pub public_key_fingerprint: String,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub sprint_id: String,
    pub version: String,
}

impl Attestation {
    /// The exact bytes the signature was produced over.
    pub fn signing_payload(&self) -> Result<Vec<u8>> {
        signing_payload(&self.manifest_hash, &self.sprint_id, self.timestamp, &self.version)
    }
}

/// Outcome of re-checking a manifest against an attestation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationResult {
    Valid,
    /// The manifest content no longer matches the attested digest.
    HashMismatch,
    /// The digest matches but the attestation itself was forged or corrupted.
    SignatureInvalid,
    /// No known public key has the attestation's fingerprint.
    UnknownKey,
}

impl VerificationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

fn signing_payload(
    manifest_hash: &str,
    sprint_id: &str,
    timestamp: f64,
    version: &str,
) -> Result<Vec<u8>> {
    let mut payload = Manifest::new();
    payload.insert("manifest_hash", manifest_hash);
    payload.insert("sprint_id", sprint_id);
    payload.insert("timestamp", ManifestValue::Float(timestamp));
    payload.insert("version", version);
    Ok(canonicalize(&payload)?.into_vec())
}

/// Turns manifests into attestations and checks them back.
pub struct AttestationService {
    keys: Arc<KeyManager>,
    trusted: HashMap<String, PublicKey>,
}

impl AttestationService {
    pub fn new(keys: Arc<KeyManager>) -> Self {
        Self {
            keys,
            trusted: HashMap::new(),
        }
    }

    /// Adds public keys, besides the current one, whose signatures are
    /// accepted (keys retired by an operator rotation).
    pub fn with_trusted_keys(mut self, keys: impl IntoIterator<Item = PublicKey>) -> Self {
        for key in keys {
            self.trusted.insert(key.fingerprint(), key);
        }
        self
    }

    pub fn attest(&self, manifest: &Manifest, sprint_id: &str) -> Result<Attestation> {
        if sprint_id.trim().is_empty() {
            return Err(ProvenanceError::InvalidInput("sprint id must not be empty".into()));
        }
        let manifest_hash = digest(manifest)?;
        let pair = self.keys.ensure_keypair()?;
        let timestamp = crate::unix_now();
        let payload = signing_payload(&manifest_hash, sprint_id, timestamp, ATTESTATION_VERSION)?;
        let signature = pair.sign(&payload);

        debug!("Attested sprint {sprint_id} (hash {manifest_hash})");
        Ok(Attestation {
            manifest_hash,
            signature: signature.to_base64(),
            public_key_fingerprint: pair.fingerprint(),
            timestamp,
            sprint_id: sprint_id.to_string(),
            version: ATTESTATION_VERSION.to_string(),
        })
    }

    /// Hash check first, then key lookup, then signature check.
    pub fn verify_attestation(
        &self,
        manifest: &Manifest,
        attestation: &Attestation,
    ) -> Result<VerificationResult> {
        if digest(manifest)? != attestation.manifest_hash {
            warn!(
                "Manifest for sprint {} no longer matches attested hash {}",
                attestation.sprint_id, attestation.manifest_hash
            );
            return Ok(VerificationResult::HashMismatch);
        }

        let Some(public_key) = self.known_key(&attestation.public_key_fingerprint)? else {
            warn!(
                "Attestation for sprint {} signed by unknown key {}",
                attestation.sprint_id, attestation.public_key_fingerprint
            );
            return Ok(VerificationResult::UnknownKey);
        };

        let signature = match Signature::from_base64(&attestation.signature) {
            Ok(sig) => sig,
            Err(e) => {
                warn!("Attestation for sprint {}: {e}", attestation.sprint_id);
                return Ok(VerificationResult::SignatureInvalid);
            }
        };

        if public_key.verify(&attestation.signing_payload()?, &signature) {
            Ok(VerificationResult::Valid)
        } else {
            warn!(
                "Signature check failed for sprint {} (key {})",
                attestation.sprint_id, attestation.public_key_fingerprint
            );
            Ok(VerificationResult::SignatureInvalid)
        }
    }

    fn known_key(&self, fingerprint: &str) -> Result<Option<PublicKey>> {
        let current = self.keys.public_key()?;
        if current.fingerprint() == fingerprint {
            return Ok(Some(current));
        }
        Ok(self.trusted.get(fingerprint).cloned())
    }
}
