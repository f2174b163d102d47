use sha2::{Digest, Sha256};

use sprint_ledger::{
    canonicalize, Config, LedgerFilter, Manifest, Provenance, SandboxOutcome, VerificationResult,
};

fn provenance(dir: &std::path::Path) -> Provenance {
    let mut config = Config::default();
    config.ledger.path = dir.join("data").join("ledger.db");
    config.keys.dir = dir.join("keys");
    config.sandbox.runtime = "/nonexistent/sprint-ledger-runtime".into();
    Provenance::open(&config).unwrap()
}

fn manifest(json: &str) -> Manifest {
    Manifest::from_json_str(json).unwrap()
}

#[test]
fn sprint_attest_validate_and_drift() {
    let dir = tempfile::tempdir().unwrap();
    let prov = provenance(dir.path());

    let original = manifest(r#"{"goal":"build-x","risk":"low"}"#);
    let entry = prov.record("S-1", &original).unwrap();

    let entries = prov.list(&LedgerFilter::default().sprint("S-1")).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0], entry);
    assert_eq!(entry.attestation.sprint_id, "S-1");

    let canonical = canonicalize(&original).unwrap();
    assert_eq!(canonical.as_bytes(), br#"{"goal":"build-x","risk":"low"}"#);
    assert_eq!(
        entry.attestation.manifest_hash,
        hex::encode(Sha256::digest(canonical.as_bytes()))
    );

    let record = prov.validate("S-1", &original).unwrap();
    assert_eq!(record.match_status, Some(true));

    let mutated = manifest(r#"{"goal":"build-x","risk":"high"}"#);
    let record = prov.validate("S-1", &mutated).unwrap();
    assert_eq!(record.match_status, Some(false));
    assert_eq!(record.expected_sha256, entry.attestation.manifest_hash);
    assert_eq!(
        record.actual_sha256.as_deref(),
        Some(hex::encode(Sha256::digest(br#"{"goal":"build-x","risk":"high"}"#)).as_str())
    );

    // History is untouched by drift
    assert_eq!(prov.entry(entry.id).unwrap(), entry);
    assert_eq!(prov.verify_entry(entry.id).unwrap(), VerificationResult::Valid);
}

#[test]
fn tampered_manifest_and_signature_are_distinguished() {
    let dir = tempfile::tempdir().unwrap();
    let prov = provenance(dir.path());
    let entry = prov
        .record("S-2", &manifest(r#"{"steps":[1,2,3],"target":"x86_64"}"#))
        .unwrap();

    let tampered = manifest(r#"{"steps":[1,2,4],"target":"x86_64"}"#);
    assert_eq!(
        prov.attestation()
            .verify_attestation(&tampered, &entry.attestation)
            .unwrap(),
        VerificationResult::HashMismatch
    );

    let mut forged = entry.attestation.clone();
    forged.signature = {
        let mut chars: Vec<char> = forged.signature.chars().collect();
        chars[0] = if chars[0] == 'A' { 'B' } else { 'A' };
        chars.into_iter().collect()
    };
    assert_eq!(
        prov.attestation()
            .verify_attestation(&entry.manifest().unwrap(), &forged)
            .unwrap(),
        VerificationResult::SignatureInvalid
    );
}

#[tokio::test]
async fn sandbox_without_runtime_never_executes() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");
    let prov = provenance(dir.path());

    let result = prov
        .run(&format!("touch {}", marker.display()), None)
        .await;

    assert_eq!(result.outcome, SandboxOutcome::SetupFailed);
    assert_eq!(result.exit_code, None);
    assert!(!marker.exists());
}
