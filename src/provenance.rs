//! The four operations external collaborators use: write a ledger entry,
//! list entries, validate a manifest, and run a command under sandbox
//! policy. Nothing here updates or deletes ledger data.

use std::sync::Arc;

use tracing::info;

use crate::attestation::{AttestationService, VerificationResult};
use crate::config::Config;
use crate::error::{ProvenanceError, Result};
use crate::keys::KeyManager;
use crate::ledger::{Database, LedgerEntry, LedgerFilter, LedgerStore};
use crate::manifest::Manifest;
use crate::sandbox::{
    IsolationBackend, SandboxEnforcer, SandboxLimits, SandboxResult, TracingObserver,
    ViolationObserver,
};
use crate::validator::{content_digest, ManifestHashRecord, ManifestValidator};

pub struct Provenance {
    attestation: AttestationService,
    ledger: LedgerStore,
    validator: ManifestValidator,
    enforcer: SandboxEnforcer,
    default_limits: SandboxLimits,
}

impl Provenance {
    /// Opens the ledger database, the key store and the configured container
    /// backend. Violations are logged through `tracing`.
    pub fn open(config: &Config) -> Result<Self> {
        Self::open_with(
            config,
            Arc::new(config.sandbox.backend()),
            Arc::new(TracingObserver),
        )
    }

    pub fn open_with(
        config: &Config,
        backend: Arc<dyn IsolationBackend>,
        observer: Arc<dyn ViolationObserver>,
    ) -> Result<Self> {
        let db = Arc::new(Database::open(&config.ledger.path, config.ledger.busy_timeout())?);

        let keys = Arc::new(match &config.keys.private_key {
            Some(seed) => KeyManager::with_private_key(&config.keys.dir, seed)?,
            None => KeyManager::new(&config.keys.dir),
        });
        let trusted = config
            .keys
            .trusted_public_keys
            .iter()
            .map(|path| KeyManager::load_public_key(path))
            .collect::<Result<Vec<_>>>()?;
        if !trusted.is_empty() {
            info!("Trusting {} additional public key(s)", trusted.len());
        }
        let attestation = AttestationService::new(keys).with_trusted_keys(trusted);

        let enforcer = SandboxEnforcer::new(backend, observer, config.sandbox.max_concurrent);

        Ok(Self::new(
            attestation,
            db,
            enforcer,
            config.sandbox.limits(),
        ))
    }

    pub fn new(
        attestation: AttestationService,
        db: Arc<Database>,
        enforcer: SandboxEnforcer,
        default_limits: SandboxLimits,
    ) -> Self {
        Self {
            attestation,
            ledger: LedgerStore::new(Arc::clone(&db)),
            validator: ManifestValidator::new(db),
            enforcer,
            default_limits,
        }
    }

    /// Attests `manifest` and appends it to the ledger. The manifest's
    /// content hash also becomes the sprint's current expectation.
    pub fn record(&self, sprint_id: &str, manifest: &Manifest) -> Result<LedgerEntry> {
        let attestation = self.attestation.attest(manifest, sprint_id)?;
        let entry = self.ledger.append(&attestation, manifest)?;
        self.validator
            .record_expected(sprint_id, &content_digest(manifest)?)?;
        Ok(entry)
    }

    pub fn list(&self, filter: &LedgerFilter) -> Result<Vec<LedgerEntry>> {
        self.ledger.list(filter)
    }

    pub fn entry(&self, id: i64) -> Result<LedgerEntry> {
        self.ledger.get_by_id(id)
    }

    /// Re-checks a stored entry against its own stored manifest.
    pub fn verify_entry(&self, id: i64) -> Result<VerificationResult> {
        let entry = self.ledger.get_by_id(id)?;
        let manifest = entry.manifest()?;
        self.attestation
            .verify_attestation(&manifest, &entry.attestation)
    }

    pub fn expect(&self, sprint_id: &str, expected_hash: &str) -> Result<()> {
        self.validator.record_expected(sprint_id, expected_hash)
    }

    pub fn validate(&self, sprint_id: &str, manifest: &Manifest) -> Result<ManifestHashRecord> {
        self.validator.validate(sprint_id, manifest)
    }

    pub fn validation(&self, sprint_id: &str) -> Result<ManifestHashRecord> {
        self.validator.get(sprint_id)
    }

    pub fn default_limits(&self) -> &SandboxLimits {
        &self.default_limits
    }

    pub async fn run(&self, command: &str, limits: Option<&SandboxLimits>) -> SandboxResult {
        self.enforcer
            .run(command, limits.unwrap_or(&self.default_limits))
            .await
    }

    /// Attests a sandbox result summary under `sprint_id`.
    pub fn attest_run(
        &self,
        sprint_id: &str,
        command: &str,
        result: &SandboxResult,
    ) -> Result<LedgerEntry> {
        if command.trim().is_empty() {
            return Err(ProvenanceError::InvalidInput("empty command".into()));
        }
        self.record(sprint_id, &result.to_manifest(command))
    }

    pub fn attestation(&self) -> &AttestationService {
        &self.attestation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::digest;
    use crate::validator::seal;

    fn config_in(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.ledger.path = dir.join("ledger.db");
        config.keys.dir = dir.join("keys");
        config.sandbox.runtime = "/nonexistent/sprint-ledger-runtime".into();
        config
    }

    fn manifest(risk: &str) -> Manifest {
        let mut m = Manifest::new();
        m.insert("goal", "build-x");
        m.insert("risk", risk);
        m
    }

    #[test]
    fn test_record_sets_expectation() {
        let dir = tempfile::tempdir().unwrap();
        let prov = Provenance::open(&config_in(dir.path())).unwrap();

        let entry = prov.record("S-7", &manifest("low")).unwrap();
        let record = prov.validation("S-7").unwrap();
        assert_eq!(record.expected_sha256, entry.attestation.manifest_hash);
        assert_eq!(record.match_status, None);

        assert_eq!(prov.verify_entry(entry.id).unwrap(), VerificationResult::Valid);
    }

    #[test]
    fn test_recorded_sealed_manifest_validates_clean() {
        let dir = tempfile::tempdir().unwrap();
        let prov = Provenance::open(&config_in(dir.path())).unwrap();
        let sealed = seal(&manifest("low")).unwrap();

        let entry = prov.record("S-3", &sealed).unwrap();
        assert_eq!(entry.attestation.manifest_hash, digest(&sealed).unwrap());
        assert_eq!(prov.validate("S-3", &sealed).unwrap().match_status, Some(true));
    }

    #[test]
    fn test_injected_key_signs_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.keys.private_key = Some("5c".repeat(32));

        let id = Provenance::open(&config)
            .unwrap()
            .record("S-4", &manifest("low"))
            .unwrap()
            .id;
        assert!(!dir.path().join("keys").join("private.key").exists());

        let prov = Provenance::open(&config).unwrap();
        assert_eq!(prov.verify_entry(id).unwrap(), VerificationResult::Valid);

        config.keys.private_key = Some(String::new());
        assert!(Provenance::open(&config).err().unwrap().is_fatal());
    }

    #[test]
    fn test_verify_entry_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let prov = Provenance::open(&config_in(dir.path())).unwrap();
        assert!(matches!(prov.verify_entry(99), Err(ProvenanceError::NotFound(_))));
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let id = {
            let prov = Provenance::open(&config).unwrap();
            prov.record("S-1", &manifest("low")).unwrap().id
        };
        let prov = Provenance::open(&config).unwrap();
        assert_eq!(prov.verify_entry(id).unwrap(), VerificationResult::Valid);
        assert_eq!(
            prov.list(&LedgerFilter::default().sprint("S-1")).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_rotated_key_needs_trust() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        let old_id = Provenance::open(&config)
            .unwrap()
            .record("S-1", &manifest("low"))
            .unwrap()
            .id;

        // Operator rotation: keep the old public key aside, start a new key dir
        let retired = dir.path().join("retired.pub");
        std::fs::copy(dir.path().join("keys").join("public.key"), &retired).unwrap();
        config.keys.dir = dir.path().join("keys-2");

        let prov = Provenance::open(&config).unwrap();
        assert_eq!(prov.verify_entry(old_id).unwrap(), VerificationResult::UnknownKey);

        config.keys.trusted_public_keys = vec![retired];
        let prov = Provenance::open(&config).unwrap();
        assert_eq!(prov.verify_entry(old_id).unwrap(), VerificationResult::Valid);
    }

    #[test]
    fn test_missing_trusted_key_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.keys.trusted_public_keys = vec![dir.path().join("nope.pub")];
        let err = Provenance::open(&config).err().unwrap();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_run_without_backend_fails_closed_and_can_be_attested() {
        let dir = tempfile::tempdir().unwrap();
        let prov = Provenance::open(&config_in(dir.path())).unwrap();

        let result = prov.run("echo hi", None).await;
        assert_eq!(result.outcome, crate::sandbox::SandboxOutcome::SetupFailed);

        let entry = prov.attest_run("S-9", "echo hi", &result).unwrap();
        let stored = entry.manifest().unwrap();
        assert_eq!(entry.attestation.manifest_hash, digest(&stored).unwrap());
        assert!(prov.attest_run("S-9", "  ", &result).is_err());
    }
}
