//! Node key material: Ed25519 signing and Curve25519 (X25519) key agreement,
//! with timed rotation and a bounded retention ring of retired keys.
//!
//! [`KeyPair`] holds one side's long-term asymmetric material. [`KeyStore`]
//! owns the active pair plus the retention ring, and is the only thing that
//! touches the key files on disk.

#![forbid(unsafe_code)]

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::RwLock;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// Number of retired keys kept in the retention ring for verifying
/// still-in-flight messages signed under a previous key.
pub const RETENTION_WINDOW: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed key file: {0}")]
    Corrupt(String),
    #[error("rotation aborted: {0}")]
    RotationFailed(String),
}

/// One side's long-term identity: a signing keypair and a key-agreement
/// keypair, addressed by an opaque key-id.
#[derive(Clone)]
pub struct KeyPair {
    pub key_id: String,
    pub created_at: DateTime<Utc>,
    signing_key: SigningKey,
    agreement_secret: StaticSecret,
    agreement_public: X25519Public,
}

/// On-disk representation. Private halves are stored as raw bytes; the file
/// itself is restricted to 0600 by the caller.
#[derive(Debug, Serialize, Deserialize)]
struct StoredKeyPair {
    version: u8,
    key_id: String,
    created_at: DateTime<Utc>,
    signing_seed: String,
    agreement_secret: String,
}

/// The publishable view returned by `/public-key` — no private material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyView {
    pub key_id: String,
    pub public_key: String,
    pub sign_public: String,
}

impl KeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let agreement_secret = StaticSecret::random_from_rng(OsRng);
        let agreement_public = X25519Public::from(&agreement_secret);
        let key_id = uuid::Uuid::new_v4().to_string();
        Self {
            key_id,
            created_at: Utc::now(),
            signing_key,
            agreement_secret,
            agreement_public,
        }
    }

    /// SHA-256 hex of the key-agreement public key, the stable identity
    /// fingerprint used throughout TrustStore/Identity.
    pub fn fingerprint(&self) -> String {
        fingerprint_of(self.agreement_public.as_bytes())
    }

    pub fn sign(&self, bytes: &[u8]) -> Signature {
        self.signing_key.sign(bytes)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn agreement_public(&self) -> X25519Public {
        self.agreement_public
    }

    pub fn agreement_secret(&self) -> &StaticSecret {
        &self.agreement_secret
    }

    pub fn signing_public_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.signing_key.verifying_key().to_bytes())
    }

    pub fn agreement_public_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.agreement_public.as_bytes())
    }

    pub fn public_view(&self) -> PublicKeyView {
        PublicKeyView {
            key_id: self.key_id.clone(),
            public_key: self.agreement_public_base64(),
            sign_public: self.signing_public_base64(),
        }
    }

    fn to_stored(&self) -> StoredKeyPair {
        StoredKeyPair {
            version: 1,
            key_id: self.key_id.clone(),
            created_at: self.created_at,
            signing_seed: URL_SAFE_NO_PAD.encode(self.signing_key.to_bytes()),
            agreement_secret: URL_SAFE_NO_PAD.encode(self.agreement_secret.to_bytes()),
        }
    }

    fn from_stored(stored: StoredKeyPair) -> Result<Self, KeyStoreError> {
        if stored.version != 1 {
            return Err(KeyStoreError::Corrupt(format!(
                "unsupported key version {}",
                stored.version
            )));
        }
        let seed_bytes = URL_SAFE_NO_PAD
            .decode(&stored.signing_seed)
            .map_err(|e| KeyStoreError::Corrupt(e.to_string()))?;
        let seed: [u8; 32] = seed_bytes
            .try_into()
            .map_err(|_| KeyStoreError::Corrupt("signing seed wrong length".into()))?;
        let signing_key = SigningKey::from_bytes(&seed);

        let secret_bytes = URL_SAFE_NO_PAD
            .decode(&stored.agreement_secret)
            .map_err(|e| KeyStoreError::Corrupt(e.to_string()))?;
        let secret_arr: [u8; 32] = secret_bytes
            .try_into()
            .map_err(|_| KeyStoreError::Corrupt("agreement secret wrong length".into()))?;
        let agreement_secret = StaticSecret::from(secret_arr);
        let agreement_public = X25519Public::from(&agreement_secret);

        Ok(Self {
            key_id: stored.key_id,
            created_at: stored.created_at,
            signing_key,
            agreement_secret,
            agreement_public,
        })
    }
}

pub fn fingerprint_of(agreement_public_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(agreement_public_bytes);
    hex::encode(hasher.finalize())
}

/// Verify a detached Ed25519 signature against a base64url-encoded public
/// key. Used by the codec layer and AuthGate for signature checks against
/// both the agent's own historical keys and any counterpart's signing key.
pub fn verify_detached(signing_public_b64: &str, bytes: &[u8], signature: &[u8]) -> bool {
    let Ok(raw) = URL_SAFE_NO_PAD.decode(signing_public_b64) else {
        return false;
    };
    let Ok(raw32): Result<[u8; 32], _> = raw.try_into() else {
        return false;
    };
    let Ok(vk) = VerifyingKey::from_bytes(&raw32) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    vk.verify(bytes, &sig).is_ok()
}

/// Owns the active key and the retention ring, and persists both atomically.
///
/// Reads take a shared lock; `rotate` takes an exclusive one — mirrors the
/// lock discipline the spec requires for every persistent store.
pub struct KeyStore {
    state_path: PathBuf,
    current: RwLock<KeyPair>,
    history: RwLock<VecDeque<KeyPair>>,
}

impl KeyStore {
    /// Load the current key and its history ring from disk, generating a
    /// fresh key if the current-key file is absent. A corrupt current-key
    /// file is fatal: the daemon must refuse to start rather than silently
    /// mint a new identity (this is the one place nc-persist's
    /// lenient-on-corruption `JsonStore::load` is deliberately bypassed).
    pub fn load_or_create(state_path: &Path) -> Result<Self, KeyStoreError> {
        let current_path = state_path.join("keys").join("current_key.json");
        let current = match std::fs::read_to_string(&current_path) {
            Ok(content) => {
                let stored: StoredKeyPair = serde_json::from_str(&content)
                    .map_err(|e| KeyStoreError::Corrupt(e.to_string()))?;
                let key = KeyPair::from_stored(stored)?;
                info!(key_id = %key.key_id, "loaded node key");
                key
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let key = KeyPair::generate();
                info!(key_id = %key.key_id, "generated new node key");
                persist_key(&current_path, &key)?;
                key
            }
            Err(e) => return Err(KeyStoreError::Io(e)),
        };

        let history_dir = state_path.join("keys").join("history");
        let mut history = VecDeque::new();
        if history_dir.is_dir() {
            let mut entries: Vec<_> = std::fs::read_dir(&history_dir)?
                .filter_map(|e| e.ok())
                .collect();
            entries.sort_by_key(|e| e.file_name());
            for entry in entries {
                let content = std::fs::read_to_string(entry.path())?;
                let stored: StoredKeyPair = serde_json::from_str(&content)
                    .map_err(|e| KeyStoreError::Corrupt(e.to_string()))?;
                history.push_back(KeyPair::from_stored(stored)?);
            }
            while history.len() > RETENTION_WINDOW {
                history.pop_front();
            }
        }

        Ok(Self {
            state_path: state_path.to_path_buf(),
            current: RwLock::new(current),
            history: RwLock::new(history),
        })
    }

    /// Returns a clone of the currently active key pair.
    pub fn current_key(&self) -> KeyPair {
        self.current.read().clone()
    }

    /// Returns a retired pair if it is still within the retention window.
    pub fn lookup_key(&self, key_id: &str) -> Option<KeyPair> {
        if self.current.read().key_id == key_id {
            return Some(self.current.read().clone());
        }
        self.history
            .read()
            .iter()
            .find(|k| k.key_id == key_id)
            .cloned()
    }

    pub fn public(&self) -> PublicKeyView {
        self.current.read().public_view()
    }

    /// Generate a fresh key pair, persist it, and demote the previous active
    /// pair into the history ring. If persistence fails the previous key
    /// remains active — rotation is aborted rather than left half-applied.
    pub fn rotate(&self) -> Result<String, KeyStoreError> {
        let new_key = KeyPair::generate();
        let current_path = self.state_path.join("keys").join("current_key.json");

        if let Err(e) = persist_key(&current_path, &new_key) {
            error!(error = %e, "key rotation aborted: failed to persist new key");
            return Err(KeyStoreError::RotationFailed(e.to_string()));
        }

        let previous = {
            let mut current = self.current.write();
            std::mem::replace(&mut *current, new_key.clone())
        };

        let history_path = self
            .state_path
            .join("keys")
            .join("history")
            .join(format!("{}.json", previous.key_id));
        if let Err(e) = persist_key(&history_path, &previous) {
            warn!(error = %e, key_id = %previous.key_id, "failed to archive retired key, continuing with rotation");
        }

        let mut history = self.history.write();
        history.push_back(previous);
        while history.len() > RETENTION_WINDOW {
            if let Some(oldest) = history.pop_front() {
                let path = self
                    .state_path
                    .join("keys")
                    .join("history")
                    .join(format!("{}.json", oldest.key_id));
                let _ = std::fs::remove_file(path);
                // `oldest` drops here; SigningKey/StaticSecret zeroize their
                // private bytes on drop.
            }
        }

        info!(key_id = %new_key.key_id, "rotated node key");
        Ok(new_key.key_id)
    }
}

fn persist_key(path: &Path, key: &KeyPair) -> std::io::Result<()> {
    let stored = key.to_stored();
    let bytes = serde_json::to_vec_pretty(&stored).map_err(std::io::Error::other)?;
    nc_persist::atomic_write(path, &bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_has_both_key_families() {
        let kp = KeyPair::generate();
        assert_eq!(kp.fingerprint().len(), 64);
        assert!(!kp.signing_public_base64().is_empty());
        assert!(!kp.agreement_public_base64().is_empty());
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let kp = KeyPair::generate();
        let msg = b"hello world";
        let sig = kp.sign(msg);
        assert!(verify_detached(
            &kp.signing_public_base64(),
            msg,
            &sig.to_bytes()
        ));
        assert!(!verify_detached(
            &kp.signing_public_base64(),
            b"tampered",
            &sig.to_bytes()
        ));
    }

    #[test]
    fn load_or_create_generates_then_reloads_identically() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store1 = KeyStore::load_or_create(dir.path()).expect("create");
        let key1 = store1.current_key();

        let store2 = KeyStore::load_or_create(dir.path()).expect("reload");
        let key2 = store2.current_key();

        assert_eq!(key1.key_id, key2.key_id);
        assert_eq!(key1.fingerprint(), key2.fingerprint());
    }

    #[test]
    fn load_or_create_fatal_on_corrupt_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let keys_dir = dir.path().join("keys");
        std::fs::create_dir_all(&keys_dir).unwrap();
        std::fs::write(keys_dir.join("current_key.json"), "not json").unwrap();

        let result = KeyStore::load_or_create(dir.path());
        assert!(result.is_err());
    }

    #[test]
    fn rotate_demotes_previous_into_history_and_lookup_finds_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = KeyStore::load_or_create(dir.path()).expect("create");
        let original_id = store.current_key().key_id;

        let new_id = store.rotate().expect("rotate");
        assert_ne!(new_id, original_id);
        assert_eq!(store.current_key().key_id, new_id);

        let retired = store.lookup_key(&original_id);
        assert!(retired.is_some());
        assert_eq!(retired.unwrap().key_id, original_id);
    }

    #[test]
    fn retention_ring_bounded_at_five() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = KeyStore::load_or_create(dir.path()).expect("create");
        // ids[i] is the key that becomes current at rotation i; the key
        // active *before* rotation i (ids[i-1], or the original for i=0)
        // is what gets retired by that rotation.
        let mut ids = Vec::new();
        for _ in 0..7 {
            ids.push(store.rotate().expect("rotate"));
        }
        assert_eq!(store.history.read().len(), RETENTION_WINDOW);

        // Retirees in age order are [original, ids[0], .., ids[5]] (7 total);
        // only the 5 most recent survive, i.e. ids[1]..=ids[5].
        assert!(store.lookup_key(&ids[0]).is_none());
        for id in &ids[1..6] {
            assert!(store.lookup_key(id).is_some());
        }
        assert_eq!(store.current_key().key_id, ids[6]);
    }

    #[test]
    fn lookup_unknown_key_id_returns_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = KeyStore::load_or_create(dir.path()).expect("create");
        assert!(store.lookup_key("does-not-exist").is_none());
    }
}
