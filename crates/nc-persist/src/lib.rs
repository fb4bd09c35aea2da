//! JSON file-backed persistence for node agent state.
//!
//! Provides [`JsonStore`], a generic snapshot store that keeps data in memory
//! and atomically persists it to a JSON file (write-temp, then rename), and
//! [`AppendLog`], a JSON-lines append-only log tolerant of a truncated
//! trailing record.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A JSON file-backed store for a single domain of data (a map, a list, or a
/// single struct — anything `Serialize`/`Deserialize`).
///
/// Snapshots to `{state_path}/state/{domain}.json`. Every `save` writes a
/// sibling temp file and renames it into place, so a crash mid-write never
/// leaves a partially-written file behind.
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    /// Create a new store for the given domain under `state_path`.
    pub fn new(state_path: &Path, domain: &str) -> Self {
        let path = state_path.join("state").join(format!("{domain}.json"));
        Self { path }
    }

    /// Create a store at an exact path, bypassing the `state/{domain}.json`
    /// convention — used where the persisted layout names a literal file
    /// (e.g. `keys/current_key.json`, `truststore.json`).
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load data from disk, returning `T::default()` if the file is absent or
    /// corrupt (a corrupt file is logged and treated as empty, never fatal —
    /// callers that must treat corruption as fatal, like KeyStore, read the
    /// file directly instead of going through this helper).
    pub fn load<T: Default + for<'de> Deserialize<'de>>(&self) -> T {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "corrupt state file, starting fresh");
                T::default()
            }),
            Err(_) => {
                debug!(path = %self.path.display(), "no state file, starting fresh");
                T::default()
            }
        }
    }

    /// Load data from disk, returning `None` if the file is absent. A corrupt
    /// file still surfaces as an error so fatal-on-corrupt callers can abort.
    pub fn load_opt<T: for<'de> Deserialize<'de>>(&self) -> std::io::Result<Option<T>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                let value = serde_json::from_str(&content).map_err(std::io::Error::other)?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Persist data to disk via write-temp-then-rename. Creates parent
    /// directories as needed.
    pub fn save<T: Serialize>(&self, data: &T) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(data).map_err(std::io::Error::other)?;
        atomic_write(&self.path, content.as_bytes())
    }

    /// Same as [`save`](Self::save) but restricts the resulting file to
    /// owner read/write (0600) once the rename completes. Used for key
    /// material.
    #[cfg(unix)]
    pub fn save_private<T: Serialize>(&self, data: &T) -> std::io::Result<()> {
        self.save(data)?;
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
    }

    #[cfg(not(unix))]
    pub fn save_private<T: Serialize>(&self, data: &T) -> std::io::Result<()> {
        self.save(data)
    }
}

/// Write `bytes` to `path` atomically: write to a sibling temp file, `fsync`,
/// then rename over the destination. Rename is atomic on the same filesystem,
/// which is the primitive every store in this crate relies on for crash
/// safety.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let tmp_name = format!(
        ".{}.tmp-{}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("state"),
        std::process::id()
    );
    let tmp_path = parent.join(tmp_name);
    {
        let mut f = std::fs::File::create(&tmp_path)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)
}

// ─── AppendLog ────────────────────────────────────────────────────────────────

/// An append-only JSON-lines file. Each record is one JSON value on its own
/// line. A reader tolerates a truncated trailing record (e.g. a crash mid
/// `write`): it is skipped rather than treated as a fatal parse error.
pub struct AppendLog {
    path: PathBuf,
}

impl AppendLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a single line. Opens in append mode so
    /// concurrent-process appends never truncate each other; ordering across
    /// appends from a single process is serialized by the caller's lock.
    pub fn append<T: Serialize>(&self, record: &T) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(record).map_err(std::io::Error::other)?;
        line.push('\n');
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        f.write_all(line.as_bytes())?;
        f.sync_all()
    }

    /// Read every well-formed record in order. A truncated or corrupt final
    /// line is dropped silently (logged at `warn`); a corrupt line in the
    /// middle of the file is also skipped rather than aborting the whole
    /// read, since a reader must tolerate partial writes from any crash
    /// point, not only the very last one.
    pub fn read_all<T: for<'de> Deserialize<'de>>(&self) -> std::io::Result<Vec<T>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let reader = std::io::BufReader::new(file);
        let mut out = Vec::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(&line) {
                Ok(record) => out.push(record),
                Err(e) => warn!(path = %self.path.display(), line = i, error = %e, "skipping unreadable audit record"),
            }
        }
        Ok(out)
    }

    /// Rotate the log by renaming it to `<path>.<n>` and starting fresh.
    pub fn rotate(&self, n: u32) -> std::io::Result<()> {
        let rotated = self.path.with_extension(format!("log.{n}"));
        if self.path.exists() {
            std::fs::rename(&self.path, rotated)?;
        }
        Ok(())
    }
}
