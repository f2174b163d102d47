//! Drift detection: the current expected hash per sprint versus a freshly
//! recomputed one.
//!
//! Unlike the ledger (full history, many entries per sprint), this keeps a
//! single mutable "current belief" row per sprint in `manifest_hashes`.

use std::sync::Arc;

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ProvenanceError, Result};
use crate::ledger::Database;
use crate::manifest::{digest, Manifest, ManifestValue, META_FIELDS};

pub const HASH_ALGORITHM: &str = "SHA-256";
pub const MANIFEST_VERSION: &str = "v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestHashRecord {
    pub sprint_id: String,
    pub expected_sha256: String,
    /// Absent until the first validation after an expectation is recorded.
    pub actual_sha256: Option<String>,
    pub match_status: Option<bool>,
    pub validated_at: Option<f64>,
}

impl ManifestHashRecord {
    pub fn is_drifted(&self) -> bool {
        self.match_status == Some(false)
    }
}

/// The embedded expected hash, if `manifest` carries a complete seal
/// (`expected_sha256`, `version` and `hash_algorithm = "SHA-256"`).
fn seal_of(manifest: &Manifest) -> Option<&str> {
    let algorithm = matches!(
        manifest.get("hash_algorithm"),
        Some(ManifestValue::String(a)) if a == HASH_ALGORITHM
    );
    let version = matches!(manifest.get("version"), Some(ManifestValue::String(_)));
    match manifest.get("expected_sha256") {
        Some(ManifestValue::String(expected)) if algorithm && version => Some(expected.as_str()),
        _ => None,
    }
}

/// Hash used for drift detection: the digest of the manifest body, with the
/// seal removed only when a complete one is present.
pub fn content_digest(manifest: &Manifest) -> Result<String> {
    if seal_of(manifest).is_some() {
        digest(&manifest.without_meta())
    } else {
        digest(manifest)
    }
}

/// Returns a copy of `manifest` stamped with its own expected hash,
/// `version` and `hash_algorithm`. Re-sealing replaces an existing seal;
/// a manifest that uses those keys for its own data cannot be sealed.
pub fn seal(manifest: &Manifest) -> Result<Manifest> {
    let body = if seal_of(manifest).is_some() {
        manifest.without_meta()
    } else if let Some(key) = META_FIELDS.iter().find(|k| manifest.get(k).is_some()) {
        return Err(ProvenanceError::InvalidInput(format!(
            "manifest key `{key}` is reserved for the seal"
        )));
    } else {
        manifest.clone()
    };
    let expected = digest(&body)?;
    let mut sealed = body;
    sealed.insert("expected_sha256", expected);
    sealed.insert("version", MANIFEST_VERSION);
    sealed.insert("hash_algorithm", HASH_ALGORITHM);
    Ok(sealed)
}

fn check_hash(hash: &str) -> Result<()> {
    if hash.len() == 64 && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        Ok(())
    } else {
        Err(ProvenanceError::InvalidInput(format!(
            "expected a lowercase hex SHA-256 digest, got {hash:?}"
        )))
    }
}

pub struct ManifestValidator {
    db: Arc<Database>,
}

impl ManifestValidator {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Establishes or replaces the expectation for a sprint. A replaced
    /// expectation clears the previous validation outcome.
    pub fn record_expected(&self, sprint_id: &str, expected_hash: &str) -> Result<()> {
        if sprint_id.trim().is_empty() {
            return Err(ProvenanceError::InvalidInput("sprint id must not be empty".into()));
        }
        check_hash(expected_hash)?;
        self.db.write(|tx| {
            tx.execute(
                "INSERT INTO manifest_hashes (sprint_id, expected_sha256)
                 VALUES (?1, ?2)
                 ON CONFLICT(sprint_id) DO UPDATE SET
                    expected_sha256 = excluded.expected_sha256,
                    actual_sha256 = NULL,
                    match_status = NULL,
                    validated_at = NULL",
                params![sprint_id, expected_hash],
            )?;
            Ok(())
        })?;
        info!("Expected hash for sprint {sprint_id} set to {expected_hash}");
        Ok(())
    }

    /// Recomputes the manifest digest and compares it with the stored
    /// expectation.
    ///
    /// With no stored expectation, the baseline is the expected hash of a
    /// complete seal (see [`seal`]) if present, else the manifest's own
    /// digest. A seal whose hash is not a SHA-256 digest is rejected.
    pub fn validate(&self, sprint_id: &str, manifest: &Manifest) -> Result<ManifestHashRecord> {
        if sprint_id.trim().is_empty() {
            return Err(ProvenanceError::InvalidInput("sprint id must not be empty".into()));
        }
        let actual = content_digest(manifest)?;
        let embedded = seal_of(manifest);
        if let Some(expected) = embedded {
            check_hash(expected)?;
        }
        let validated_at = crate::unix_now();

        let record = self.db.write(|tx| {
            let stored: Option<String> = tx
                .query_row(
                    "SELECT expected_sha256 FROM manifest_hashes WHERE sprint_id = ?1",
                    [sprint_id],
                    |row| row.get(0),
                )
                .optional()?;

            let expected = match stored {
                Some(expected) => expected,
                None => {
                    let baseline = embedded.unwrap_or(actual.as_str()).to_string();
                    info!("Sprint {sprint_id}: no expectation recorded, baseline {baseline}");
                    baseline
                }
            };
            let matched = expected == actual;

            tx.execute(
                "INSERT INTO manifest_hashes
                    (sprint_id, expected_sha256, actual_sha256, match_status, validated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(sprint_id) DO UPDATE SET
                    actual_sha256 = excluded.actual_sha256,
                    match_status = excluded.match_status,
                    validated_at = excluded.validated_at",
                params![sprint_id, expected, actual, matched, validated_at],
            )?;

            Ok(ManifestHashRecord {
                sprint_id: sprint_id.to_string(),
                expected_sha256: expected,
                actual_sha256: Some(actual.clone()),
                match_status: Some(matched),
                validated_at: Some(validated_at),
            })
        })?;

        if record.is_drifted() {
            warn!(
                "Drift detected for sprint {sprint_id}: expected {}, got {}",
                record.expected_sha256, actual
            );
        }
        Ok(record)
    }

    pub fn get(&self, sprint_id: &str) -> Result<ManifestHashRecord> {
        self.db
            .read(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT sprint_id, expected_sha256, actual_sha256, match_status, validated_at
                         FROM manifest_hashes WHERE sprint_id = ?1",
                        [sprint_id],
                        |row| {
                            Ok(ManifestHashRecord {
                                sprint_id: row.get(0)?,
                                expected_sha256: row.get(1)?,
                                actual_sha256: row.get(2)?,
                                match_status: row.get(3)?,
                                validated_at: row.get(4)?,
                            })
                        },
                    )
                    .optional()?)
            })?
            .ok_or_else(|| ProvenanceError::NotFound(format!("hash record for sprint {sprint_id}")))
    }
}
