//! TrustStore: the set of identities the agent trusts, gated by role.
//!
//! Persisted atomically under `truststore.json`. Reads are lock-free snapshots
//! under a shared lock; mutations take the exclusive half of the same lock.

#![forbid(unsafe_code)]

use nc_persist::JsonStore;
use nc_proto::{Identity, Role};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TrustStoreError {
    #[error("removing this identity would leave no owner identity")]
    WouldOrphan,
}

/// Persisted set of trusted identities, keyed by fingerprint.
pub struct TrustStore {
    identities: RwLock<HashMap<String, Identity>>,
    store: JsonStore,
}

impl TrustStore {
    /// Load from `{state_path}/truststore.json`. Returns an empty store if the
    /// file is absent (bootstrap state).
    pub fn new(state_path: &Path) -> Self {
        let store = JsonStore::at_path(state_path.join("truststore.json"));
        let identities: HashMap<String, Identity> = store.load();
        debug!(count = identities.len(), "loaded trust store from disk");
        Self {
            identities: RwLock::new(identities),
            store,
        }
    }

    /// True once at least one identity has been added — gates the
    /// unauthenticated `/bootstrap` path, which is only open while this is
    /// false.
    pub fn is_empty(&self) -> bool {
        self.identities.read().is_empty()
    }

    /// Add an identity. No-op (returns `Ok` without mutation) if the
    /// fingerprint is already present, matching the spec's idempotent-Add
    /// invariant.
    pub fn add(&self, identity: Identity) {
        let mut identities = self.identities.write();
        if identities.contains_key(&identity.fingerprint) {
            return;
        }
        identities.insert(identity.fingerprint.clone(), identity);
        self.snapshot(&identities);
    }

    /// Remove by fingerprint. Fails with `WouldOrphan` if this removal would
    /// leave the store with no `owner`-role identity.
    pub fn remove(&self, fingerprint: &str) -> Result<(), TrustStoreError> {
        let mut identities = self.identities.write();
        if !identities.contains_key(fingerprint) {
            return Ok(());
        }
        let remaining_owners = identities
            .values()
            .filter(|i| i.fingerprint != fingerprint && i.role == Role::Owner)
            .count();
        let removing_an_owner = identities
            .get(fingerprint)
            .is_some_and(|i| i.role == Role::Owner);
        if removing_an_owner && remaining_owners == 0 {
            return Err(TrustStoreError::WouldOrphan);
        }
        identities.remove(fingerprint);
        self.snapshot(&identities);
        Ok(())
    }

    pub fn find(&self, fingerprint: &str) -> Option<Identity> {
        self.identities.read().get(fingerprint).cloned()
    }

    pub fn list(&self) -> Vec<Identity> {
        self.identities.read().values().cloned().collect()
    }

    fn snapshot(&self, identities: &HashMap<String, Identity>) {
        if let Err(e) = self.store.save(identities) {
            warn!(error = %e, "failed to persist trust store");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nc_proto::Role;

    fn identity(fp: &str, role: Role) -> Identity {
        Identity::new(fp, "agpub", "signpub", role, "a@x.com", "bootstrap")
    }

    #[test]
    fn empty_store_reports_empty_and_bootstrap_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::new(dir.path());
        assert!(store.is_empty());
        assert!(store.find("nope").is_none());
    }

    #[test]
    fn add_is_idempotent_on_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::new(dir.path());
        store.add(identity("fp1", Role::Owner));
        store.add(identity("fp1", Role::Reader)); // ignored: fp1 already present
        assert_eq!(store.list().len(), 1);
        assert_eq!(store.find("fp1").unwrap().role, Role::Owner);
    }

    #[test]
    fn remove_unknown_is_ok_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::new(dir.path());
        assert!(store.remove("nope").is_ok());
    }

    #[test]
    fn remove_last_owner_fails_would_orphan() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::new(dir.path());
        store.add(identity("owner1", Role::Owner));
        let err = store.remove("owner1").unwrap_err();
        assert_eq!(err, TrustStoreError::WouldOrphan);
        assert!(store.find("owner1").is_some());
    }

    #[test]
    fn remove_non_owner_always_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::new(dir.path());
        store.add(identity("owner1", Role::Owner));
        store.add(identity("reader1", Role::Reader));
        assert!(store.remove("reader1").is_ok());
        assert!(store.find("reader1").is_none());
    }

    #[test]
    fn remove_one_of_two_owners_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::new(dir.path());
        store.add(identity("owner1", Role::Owner));
        store.add(identity("owner2", Role::Owner));
        assert!(store.remove("owner1").is_ok());
        assert!(store.find("owner2").is_some());
    }

    #[test]
    fn persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = TrustStore::new(dir.path());
            store.add(identity("owner1", Role::Owner));
        }
        let reloaded = TrustStore::new(dir.path());
        assert!(reloaded.find("owner1").is_some());
        assert!(!reloaded.is_empty());
    }

    #[test]
    fn fingerprint_invariant_holds_for_every_stored_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::new(dir.path());
        store.add(identity("fp-a", Role::Owner));
        store.add(identity("fp-b", Role::Reader));
        for i in store.list() {
            assert_eq!(store.find(&i.fingerprint).unwrap().fingerprint, i.fingerprint);
        }
    }
}
