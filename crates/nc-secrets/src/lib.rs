//! Agent-side store for secret envelopes pushed by the CLI.
//!
//! Each accepted [`EncryptedEnvelope`] is decrypted with the node's own
//! key-agreement secret and the plaintext is persisted as a `.env` file
//! under `received-env/`, named `<unix-timestamp>_<key-id>.env` so that
//! repeated pushes under key rotation never collide and the newest file
//! sorts last.

#![forbid(unsafe_code)]

use nc_identity::KeyPair;
use nc_persist::atomic_write;
use nc_proto::EncryptedEnvelope;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("envelope decryption failed: {0}")]
    Decrypt(#[from] nc_codec::CodecError),
}

/// Directory-backed store of decrypted secret envelopes.
pub struct ReceivedSecretStore {
    dir: PathBuf,
}

impl ReceivedSecretStore {
    /// `{state_path}/received-env/`.
    pub fn new(state_path: &Path) -> Self {
        Self {
            dir: state_path.join("received-env"),
        }
    }

    /// Decrypt `envelope` with `node_key` and persist the resulting `.env`
    /// blob to disk. Returns the path written.
    pub fn store(
        &self,
        node_key: &KeyPair,
        envelope: &EncryptedEnvelope,
    ) -> Result<PathBuf, SecretsError> {
        let (blob, variables) = nc_codec::decrypt_envelope(node_key, envelope)?;
        let path = self
            .dir
            .join(format!("{}_{}.env", envelope.timestamp.timestamp(), envelope.key_id));
        atomic_write(&path, &blob)?;
        debug!(
            path = %path.display(),
            variables = variables.len(),
            "stored decrypted secret envelope"
        );
        Ok(path)
    }

    /// List stored envelope files, oldest first (filename-sorted, which is
    /// timestamp-sorted since the prefix is a Unix timestamp).
    pub fn list(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(paths),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            if entry.path().extension().is_some_and(|ext| ext == "env") {
                paths.push(entry.path());
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// The most recently stored envelope file, if any.
    pub fn latest(&self) -> std::io::Result<Option<PathBuf>> {
        Ok(self.list()?.pop())
    }

    /// Read back the plaintext contents of a previously stored `.env` file.
    pub fn read(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    /// Remove every stored envelope except the `keep` most recent ones.
    pub fn prune(&self, keep: usize) -> std::io::Result<()> {
        let paths = self.list()?;
        if paths.len() <= keep {
            return Ok(());
        }
        for path in &paths[..paths.len() - keep] {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "failed to prune old secret envelope");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn store_decrypts_and_writes_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let node_key = KeyPair::generate();
        let mut vars = BTreeMap::new();
        vars.insert("API_KEY".to_string(), b"secret".to_vec());
        let envelope =
            nc_codec::encrypt_envelope(&node_key.key_id, &node_key.agreement_public(), b"API_KEY=secret\n", &vars)
                .unwrap();

        let store = ReceivedSecretStore::new(dir.path());
        let path = store.store(&node_key, &envelope).unwrap();
        assert!(path.exists());
        assert_eq!(store.read(&path).unwrap(), b"API_KEY=secret\n");
    }

    #[test]
    fn store_rejects_envelope_it_cannot_decrypt() {
        let dir = tempfile::tempdir().unwrap();
        let node_key = KeyPair::generate();
        let wrong_key = KeyPair::generate();
        let envelope = nc_codec::encrypt_envelope(
            &wrong_key.key_id,
            &wrong_key.agreement_public(),
            b"X=1\n",
            &BTreeMap::new(),
        )
        .unwrap();

        let store = ReceivedSecretStore::new(dir.path());
        assert!(store.store(&node_key, &envelope).is_err());
    }

    #[test]
    fn list_is_empty_when_directory_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReceivedSecretStore::new(dir.path());
        assert!(store.list().unwrap().is_empty());
        assert!(store.latest().unwrap().is_none());
    }

    #[test]
    fn prune_keeps_only_the_newest_n() {
        let dir = tempfile::tempdir().unwrap();
        let node_key = KeyPair::generate();
        let store = ReceivedSecretStore::new(dir.path());
        for i in 0..4 {
            let mut envelope = nc_codec::encrypt_envelope(
                &node_key.key_id,
                &node_key.agreement_public(),
                b"X=1\n",
                &BTreeMap::new(),
            )
            .unwrap();
            envelope.timestamp = chrono::Utc::now() + chrono::Duration::seconds(i);
            store.store(&node_key, &envelope).unwrap();
        }
        assert_eq!(store.list().unwrap().len(), 4);
        store.prune(2).unwrap();
        assert_eq!(store.list().unwrap().len(), 2);
    }
}
