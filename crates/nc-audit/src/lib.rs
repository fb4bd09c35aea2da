//! Append-only audit trail of privileged actions.
//!
//! Entries are appended as JSON-lines (one signed record per line) under
//! `audit/audit.log`. A single writer lock serializes appends; readers may
//! run concurrently and must tolerate a truncated trailing record, which
//! `nc_persist::AppendLog` already guarantees by skipping unreadable lines.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use nc_identity::KeyPair;
use nc_persist::AppendLog;
use nc_proto::AuditLogEntry;
use parking_lot::Mutex;
use std::path::Path;
use tracing::debug;

/// Append-only signed audit trail.
pub struct AuditLog {
    log: AppendLog,
    write_lock: Mutex<()>,
}

impl AuditLog {
    /// Open (or create on first append) `{state_path}/audit/audit.log`.
    pub fn new(state_path: &Path) -> Self {
        Self {
            log: AppendLog::new(state_path.join("audit").join("audit.log")),
            write_lock: Mutex::new(()),
        }
    }

    /// Append one entry, signed by the agent's current key over the
    /// canonical `action|actor|target|timestamp` tuple. Appends are
    /// serialized so the on-disk order matches completion order of the
    /// authenticated handler, per the spec's ordering guarantee.
    pub fn append(
        &self,
        signer: &KeyPair,
        action: impl Into<String>,
        actor: impl Into<String>,
        target: impl Into<String>,
        remote_address: impl Into<String>,
    ) -> std::io::Result<AuditLogEntry> {
        let _guard = self.write_lock.lock();
        let action = action.into();
        let actor = actor.into();
        let target = target.into();
        let timestamp = Utc::now();

        let signing_bytes = canonical_record_bytes(&action, &actor, &target, timestamp);
        let signature = hex::encode(signer.sign(&signing_bytes).to_bytes());

        let entry = AuditLogEntry {
            action,
            actor,
            target,
            timestamp,
            signature,
            remote_address: remote_address.into(),
        };
        self.log.append(&entry)?;
        debug!(action = %entry.action, actor = %entry.actor, "audit entry appended");
        Ok(entry)
    }

    /// All entries with `timestamp >= since`, oldest first.
    pub fn query_since(&self, since: DateTime<Utc>) -> std::io::Result<Vec<AuditLogEntry>> {
        let all: Vec<AuditLogEntry> = self.log.read_all()?;
        Ok(all.into_iter().filter(|e| e.timestamp >= since).collect())
    }

    pub fn query(
        &self,
        actor: Option<&str>,
        action: Option<&str>,
        limit: usize,
    ) -> std::io::Result<Vec<AuditLogEntry>> {
        let all: Vec<AuditLogEntry> = self.log.read_all()?;
        let mut filtered: Vec<_> = all
            .into_iter()
            .filter(|e| actor.is_none_or(|a| e.actor == a))
            .filter(|e| action.is_none_or(|a| e.action == a))
            .collect();
        filtered.sort_by_key(|e| std::cmp::Reverse(e.timestamp));
        filtered.truncate(limit);
        Ok(filtered)
    }

    /// Rotate the log file by renaming to `.N` and starting fresh.
    pub fn rotate(&self, n: u32) -> std::io::Result<()> {
        let _guard = self.write_lock.lock();
        self.log.rotate(n)
    }
}

fn canonical_record_bytes(
    action: &str,
    actor: &str,
    target: &str,
    timestamp: DateTime<Utc>,
) -> Vec<u8> {
    format!("{action}|{actor}|{target}|{}", timestamp.timestamp()).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::new(dir.path());
        let key = KeyPair::generate();

        audit
            .append(&key, "deploy", "fp-1", "app:foo", "127.0.0.1")
            .unwrap();
        audit
            .append(&key, "status", "fp-2", "app:foo", "127.0.0.1")
            .unwrap();

        let all = audit.query(None, None, 10).unwrap();
        assert_eq!(all.len(), 2);

        let filtered = audit.query(Some("fp-1"), None, 10).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].action, "deploy");
    }

    #[test]
    fn every_authenticated_action_has_an_entry_with_actor_and_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::new(dir.path());
        let key = KeyPair::generate();
        let before = Utc::now();

        let entry = audit
            .append(&key, "add-identity", "fp-owner", "fp-new", "10.0.0.1")
            .unwrap();

        assert_eq!(entry.actor, "fp-owner");
        assert!(entry.timestamp >= before);
        assert!(!entry.signature.is_empty());
    }

    #[test]
    fn survives_truncated_trailing_record() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::new(dir.path());
        let key = KeyPair::generate();
        audit
            .append(&key, "deploy", "fp-1", "app:foo", "127.0.0.1")
            .unwrap();

        use std::io::Write;
        let path = dir.path().join("audit").join("audit.log");
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"action\": \"trunc").unwrap();

        let all = audit.query(None, None, 10).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn query_since_filters_by_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let audit = AuditLog::new(dir.path());
        let key = KeyPair::generate();
        let marker = Utc::now();
        audit
            .append(&key, "deploy", "fp-1", "app:foo", "127.0.0.1")
            .unwrap();

        let since_future = audit.query_since(marker + chrono::Duration::hours(1)).unwrap();
        assert!(since_future.is_empty());

        let since_past = audit.query_since(marker - chrono::Duration::hours(1)).unwrap();
        assert_eq!(since_past.len(), 1);
    }
}
