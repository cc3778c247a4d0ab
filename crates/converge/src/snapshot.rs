//! State snapshot: last-known remote objects, keyed by instance name.
//!
//! The snapshot is the only state shared across instances during a pass.
//! The driver reads an entry when planning an instance and writes it only
//! after a remote operation on that instance succeeded. A store bound to a
//! file with [`SnapshotStore::persist_to`] rewrites it on every change, so
//! an interrupted pass keeps what it committed.

use crate::types::Attributes;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Recorded state of one instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Resource kind
    pub kind: String,
    /// Remote identity
    pub identity: String,
    /// Full remote payload as last observed
    #[serde(default)]
    pub observed: Attributes,
    /// Declared attributes as of the last successful create/update
    #[serde(default)]
    pub last_applied: Attributes,
    /// Content hash of `last_applied`
    #[serde(default)]
    pub last_applied_hash: String,
    /// Instances this one depended on when committed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Attributes whose diff is suppressed (import placeholders)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suppressed: Vec<String>,
    /// Hash of the declaration an import was bound to. `suppressed` holds
    /// only while the declaration still hashes to this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_hash: Option<String>,
    /// Bound to a pre-existing remote object
    #[serde(default)]
    pub imported: bool,
}

/// Persisted snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    /// Incremented on every commit or removal
    #[serde(default)]
    pub serial: u64,
    #[serde(default)]
    pub entries: BTreeMap<String, Entry>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            serial: 0,
            entries: BTreeMap::new(),
        }
    }
}

/// Lock-guarded snapshot injected into the driver
#[derive(Debug, Default)]
pub struct SnapshotStore {
    inner: Mutex<Snapshot>,
    /// Rewritten after every commit and removal
    journal: Option<PathBuf>,
}

impl SnapshotStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing snapshot
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            inner: Mutex::new(snapshot),
            journal: None,
        }
    }

    /// Write the snapshot to `path` after every commit and removal
    pub fn persist_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.journal = Some(path.into());
        self
    }

    /// Called with the lock held so writes land in commit order
    fn persist(&self, snapshot: &Snapshot) {
        if let Some(path) = &self.journal
            && let Err(e) = write_snapshot(path, snapshot)
        {
            log::error!("{e:#}");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Snapshot> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Get a copy of an entry
    pub fn get(&self, name: &str) -> Option<Entry> {
        self.lock().entries.get(name).cloned()
    }

    /// Get the recorded identity of an instance
    pub fn identity(&self, name: &str) -> Option<String> {
        self.lock().entries.get(name).map(|e| e.identity.clone())
    }

    /// Record the outcome of a successful operation
    pub fn commit(&self, name: &str, entry: Entry) {
        let mut snapshot = self.lock();
        snapshot.serial += 1;
        snapshot.entries.insert(name.to_string(), entry);
        log::debug!("Committed {name} (serial {})", snapshot.serial);
        self.persist(&snapshot);
    }

    /// Forget an instance
    pub fn remove(&self, name: &str) -> Option<Entry> {
        let mut snapshot = self.lock();
        let removed = snapshot.entries.remove(name);
        if removed.is_some() {
            snapshot.serial += 1;
            log::debug!("Removed {name} (serial {})", snapshot.serial);
            self.persist(&snapshot);
        }
        removed
    }

    /// Names of all recorded instances
    pub fn names(&self) -> Vec<String> {
        self.lock().entries.keys().cloned().collect()
    }

    /// Check if the store has no entries
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Get a copy of the whole snapshot
    pub fn snapshot(&self) -> Snapshot {
        self.lock().clone()
    }

    /// Load a snapshot from disk, or an empty one if the file doesn't exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("Snapshot {} does not exist, starting empty", path.display());
            return Ok(Self::new());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read snapshot: {}", path.display()))?;
        let snapshot: Snapshot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse snapshot: {}", path.display()))?;

        if snapshot.version > SNAPSHOT_VERSION {
            anyhow::bail!(
                "Snapshot {} has version {}, newer than supported version {}",
                path.display(),
                snapshot.version,
                SNAPSHOT_VERSION
            );
        }

        log::debug!(
            "Loaded {} entries from {}",
            snapshot.entries.len(),
            path.display()
        );
        Ok(Self::from_snapshot(snapshot))
    }

    /// Save the snapshot to disk, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        write_snapshot(path, &self.lock())
    }
}

fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;
    }

    let content = serde_json::to_string_pretty(snapshot).context("Failed to serialize snapshot")?;

    // Write to a sibling file first so a crash never truncates the snapshot
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content)
        .with_context(|| format!("Failed to write snapshot: {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace snapshot: {}", path.display()))?;

    log::debug!("Saved snapshot to {}", path.display());
    Ok(())
}
