//! Signing key store.
//!
//! One Ed25519 keypair per deployment, created on first use and reused
//! forever after. Layout:
//!   {dir}/private.key   hex-encoded 32-byte secret seed (mode 0600)
//!   {dir}/public.key    hex-encoded 32-byte verifying key
//!
//! A deployment may instead inject the seed (`keys.private_key` in the
//! config). That key is used as given: `private.key` is neither read nor
//! created, and `public.key` must match it.
//!
//! Once `private.key` exists the key is never regenerated. Rotation is an
//! operator action outside this module; older public keys are kept around
//! as trusted verifiers (see `keys.trusted_public_keys` in the config).

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use base64::Engine;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{ProvenanceError, Result};

pub const PRIVATE_KEY_FILE: &str = "private.key";
pub const PUBLIC_KEY_FILE: &str = "public.key";

/// Hex characters kept from the SHA-256 of the public key.
pub const FINGERPRINT_LEN: usize = 16;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Verifying half of a keypair. Safe to hand to any verifier.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = hex::decode(text.trim())
            .map_err(|e| ProvenanceError::InvalidInput(format!("public key is not hex: {e}")))?;
        let raw: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            ProvenanceError::InvalidInput(format!(
                "public key must be 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        VerifyingKey::from_bytes(&raw)
            .map(Self)
            .map_err(|e| ProvenanceError::InvalidInput(format!("invalid public key: {e}")))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    /// Short stable identifier: first 16 hex chars of SHA-256(public key).
    pub fn fingerprint(&self) -> String {
        let mut fp = hex::encode(Sha256::digest(self.0.as_bytes()));
        fp.truncate(FINGERPRINT_LEN);
        fp
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.0.verify_strict(message, &signature.0).is_ok()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.fingerprint())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature(ed25519_dalek::Signature);

impl Signature {
    pub fn to_base64(&self) -> String {
        B64.encode(self.0.to_bytes())
    }

    pub fn from_base64(text: &str) -> Result<Self> {
        let bytes = B64
            .decode(text.trim())
            .map_err(|e| ProvenanceError::InvalidInput(format!("signature is not base64: {e}")))?;
        ed25519_dalek::Signature::from_slice(&bytes)
            .map(Self)
            .map_err(|e| ProvenanceError::InvalidInput(format!("malformed signature: {e}")))
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        self.0.to_bytes()
    }
}

/// The deployment keypair. The secret half never leaves this type.
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing.sign(message))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key())
    }

    pub fn fingerprint(&self) -> String {
        self.public_key().fingerprint()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPair({})", self.fingerprint())
    }
}

/// Verifies `signature` over `message` with `public_key`.
pub fn verify(message: &[u8], signature: &Signature, public_key: &PublicKey) -> bool {
    public_key.verify(message, signature)
}

/// Owner of the deployment keypair.
///
/// `ensure_keypair` is serialized in-process by a mutex and across
/// processes by an atomic create-if-absent on `private.key` (the secret is
/// written to a temp file and hard-linked into place, which fails if
/// another creator got there first).
pub struct KeyManager {
    dir: PathBuf,
    injected: Option<SigningKey>,
    cached: Mutex<Option<Arc<KeyPair>>>,
}

impl KeyManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            injected: None,
            cached: Mutex::new(None),
        }
    }

    /// Uses `seed_hex` as the signing key instead of the one under `dir`.
    pub fn with_private_key(dir: impl Into<PathBuf>, seed_hex: &str) -> Result<Self> {
        let signing = parse_seed(seed_hex, "injected private key")?;
        Ok(Self {
            injected: Some(signing),
            ..Self::new(dir)
        })
    }

    pub fn is_injected(&self) -> bool {
        self.injected.is_some()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.dir.join(PRIVATE_KEY_FILE)
    }

    pub fn public_key_path(&self) -> PathBuf {
        self.dir.join(PUBLIC_KEY_FILE)
    }

    /// Loads the keypair, creating and persisting it on first use.
    pub fn ensure_keypair(&self) -> Result<Arc<KeyPair>> {
        let mut cached = self
            .cached
            .lock()
            .map_err(|_| ProvenanceError::KeyStoreUnavailable("key cache lock poisoned".into()))?;
        if let Some(pair) = cached.as_ref() {
            return Ok(Arc::clone(pair));
        }
        let pair = Arc::new(self.load_or_create()?);
        *cached = Some(Arc::clone(&pair));
        Ok(pair)
    }

    pub fn sign(&self, message: &[u8]) -> Result<Signature> {
        Ok(self.ensure_keypair()?.sign(message))
    }

    pub fn public_key(&self) -> Result<PublicKey> {
        Ok(self.ensure_keypair()?.public_key())
    }

    /// Reads a standalone public key file (e.g. a retired deployment key).
    pub fn load_public_key(path: &Path) -> Result<PublicKey> {
        let text = fs::read_to_string(path).map_err(|e| {
            ProvenanceError::KeyStoreUnavailable(format!("read {}: {e}", path.display()))
        })?;
        PublicKey::from_hex(&text).map_err(|e| {
            ProvenanceError::KeyStoreUnavailable(format!("{}: {e}", path.display()))
        })
    }

    fn load_or_create(&self) -> Result<KeyPair> {
        if let Some(signing) = &self.injected {
            return self.adopt(signing.clone());
        }
        let private_path = self.private_key_path();
        // public.key is only ever written after private.key is in place
        let public_present = self.public_key_path().exists();
        if private_path.exists() {
            return self.load();
        }
        if public_present {
            return Err(ProvenanceError::KeyStoreUnavailable(format!(
                "{} exists without {}; refusing to generate a replacement key",
                self.public_key_path().display(),
                private_path.display()
            )));
        }

        fs::create_dir_all(&self.dir).map_err(|e| {
            ProvenanceError::KeyStoreUnavailable(format!("create {}: {e}", self.dir.display()))
        })?;

        let signing = SigningKey::generate(&mut OsRng);
        let tmp = self
            .dir
            .join(format!(".{PRIVATE_KEY_FILE}.{}", uuid::Uuid::new_v4().simple()));
        write_secret(&tmp, &hex::encode(signing.to_bytes()))?;
        let linked = fs::hard_link(&tmp, &private_path);
        let _ = fs::remove_file(&tmp);

        match linked {
            Ok(()) => {
                let pair = KeyPair { signing };
                self.write_public(&pair.public_key())?;
                info!(
                    "Generated signing keypair in {} (fingerprint {})",
                    self.dir.display(),
                    pair.fingerprint()
                );
                Ok(pair)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("Another writer created the keypair first, loading it");
                self.load()
            }
            Err(e) => Err(ProvenanceError::KeyStoreUnavailable(format!(
                "persist {}: {e}",
                private_path.display()
            ))),
        }
    }

    fn load(&self) -> Result<KeyPair> {
        let private_path = self.private_key_path();
        let text = fs::read_to_string(&private_path).map_err(|e| {
            ProvenanceError::KeyStoreUnavailable(format!("read {}: {e}", private_path.display()))
        })?;
        let signing = parse_seed(&text, &private_path.display().to_string())?;
        let pair = KeyPair { signing };
        self.reconcile_public(&pair, &private_path.display().to_string())?;
        info!("Loaded signing keypair (fingerprint {})", pair.fingerprint());
        Ok(pair)
    }

    fn adopt(&self, signing: SigningKey) -> Result<KeyPair> {
        if self.private_key_path().exists() {
            warn!(
                "Ignoring {} in favour of the injected private key",
                self.private_key_path().display()
            );
        }
        fs::create_dir_all(&self.dir).map_err(|e| {
            ProvenanceError::KeyStoreUnavailable(format!("create {}: {e}", self.dir.display()))
        })?;
        let pair = KeyPair { signing };
        self.reconcile_public(&pair, "the injected private key")?;
        info!("Using injected signing key (fingerprint {})", pair.fingerprint());
        Ok(pair)
    }

    /// Checks `public.key` against `pair`, writing it when absent.
    fn reconcile_public(&self, pair: &KeyPair, origin: &str) -> Result<()> {
        let public_path = self.public_key_path();
        match fs::read_to_string(&public_path) {
            Ok(text) => {
                let stored = PublicKey::from_hex(&text).map_err(|e| {
                    ProvenanceError::KeyStoreUnavailable(format!("{}: {e}", public_path.display()))
                })?;
                if stored != pair.public_key() {
                    return Err(ProvenanceError::KeyStoreUnavailable(format!(
                        "{} does not match {origin}",
                        public_path.display()
                    )));
                }
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(
                    "{} missing, deriving it from {origin}",
                    public_path.display()
                );
                self.write_public(&pair.public_key())
            }
            Err(e) => Err(ProvenanceError::KeyStoreUnavailable(format!(
                "read {}: {e}",
                public_path.display()
            ))),
        }
    }

    /// Writes the public key via temp file + rename so readers never see
    /// a partial file.
    fn write_public(&self, key: &PublicKey) -> Result<()> {
        let path = self.public_key_path();
        let tmp = self
            .dir
            .join(format!(".{PUBLIC_KEY_FILE}.{}", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, format!("{}\n", key.to_hex()))
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|e| {
                let _ = fs::remove_file(&tmp);
                ProvenanceError::KeyStoreUnavailable(format!("write {}: {e}", path.display()))
            })
    }
}

/// Decodes a hex 32-byte seed. `origin` names the source in errors and
/// never echoes the text itself.
fn parse_seed(text: &str, origin: &str) -> Result<SigningKey> {
    let bytes = hex::decode(text.trim()).map_err(|_| {
        ProvenanceError::KeyStoreUnavailable(format!("{origin} is corrupted (not hex)"))
    })?;
    let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
        ProvenanceError::KeyStoreUnavailable(format!(
            "{origin} is corrupted ({} bytes, expected 32)",
            bytes.len()
        ))
    })?;
    Ok(SigningKey::from_bytes(&seed))
}

fn write_secret(path: &Path, contents: &str) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
        .open(path)
        .and_then(|mut file| {
            file.write_all(contents.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()
        })
        .map_err(|e| ProvenanceError::KeyStoreUnavailable(format!("write {}: {e}", path.display())))
}
