//! # engine
//!
//! why: the replicated state machine; committed entries become versioned key-value state
//! relations: fed by the node worker in commit order, read by the client service
//! what: KvEngine with mvcc revisions, bounded history, wal + snapshot durability
//!
//! Every applied entry goes through the WAL first, then into the in-memory
//! version map. `snapshot` folds the WAL into an atomically written image.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use kvraft_core::{Command, LogEntry};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use crate::wal::{write_atomic, FsyncPolicy, SyncHandle, Wal};

const SNAPSHOT_FILE: &str = "snapshot.json";
const WAL_FILE: &str = "apply.wal";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOptions {
    pub fsync: FsyncPolicy,
    /// How many revisions of history stay readable; 0 keeps everything
    pub history_revisions: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            fsync: FsyncPolicy::Batch,
            history_revisions: 1000,
        }
    }
}

/// A key as it stood at some revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// revision of the put that created the key (since its last delete)
    pub create_revision: u64,
    /// revision of the last modification
    pub mod_revision: u64,
    /// number of puts since creation
    pub version: u64,
}

/// Where the state machine stood when an image was taken
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub applied_index: u64,
    pub applied_term: u64,
    pub revision: u64,
}

/// One step in a key's history; `value: None` is a tombstone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Version {
    revision: u64,
    create_revision: u64,
    version: u64,
    value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyHistory {
    key: Vec<u8>,
    versions: Vec<Version>,
}

/// Serialized form used both on disk and for transfer to lagging followers
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotImage {
    meta: SnapshotMeta,
    compacted_revision: u64,
    keys: Vec<KeyHistory>,
}

#[derive(Debug)]
struct EngineFiles {
    dir: PathBuf,
    wal: Wal,
}

impl EngineFiles {
    fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }
}

/// The mvcc key-value state machine. All operations are synchronous;
/// the async boundary is at the caller.
#[derive(Debug)]
pub struct KvEngine {
    keys: BTreeMap<Vec<u8>, Vec<Version>>,
    applied_index: u64,
    applied_term: u64,
    revision: u64,
    compacted_revision: u64,
    history_revisions: u64,
    files: Option<EngineFiles>,
}

impl KvEngine {
    /// Engine with no durability, for tests
    pub fn in_memory() -> Self {
        Self::empty(EngineOptions::default().history_revisions)
    }

    fn empty(history_revisions: u64) -> Self {
        Self {
            keys: BTreeMap::new(),
            applied_index: 0,
            applied_term: 0,
            revision: 0,
            compacted_revision: 0,
            history_revisions,
            files: None,
        }
    }

    /// Open or create an engine at `dir`: load the snapshot image, then replay the wal.
    pub fn open(dir: &Path, options: EngineOptions) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let mut engine = Self::empty(options.history_revisions);

        let snapshot_path = dir.join(SNAPSHOT_FILE);
        match fs::read(&snapshot_path) {
            Ok(bytes) => {
                let image: SnapshotImage = serde_json::from_slice(&bytes).map_err(|e| {
                    StorageError::corrupt(&snapshot_path, format!("unreadable snapshot: {e}"))
                })?;
                engine.load_image(image);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let wal_path = dir.join(WAL_FILE);
        let mut replayed = 0;
        for entry in Wal::replay::<LogEntry>(&wal_path)? {
            if entry.index <= engine.applied_index {
                continue;
            }
            if entry.index != engine.applied_index + 1 {
                return Err(StorageError::corrupt(
                    &wal_path,
                    format!(
                        "entry {} follows applied index {}",
                        entry.index, engine.applied_index
                    ),
                ));
            }
            engine.apply_in_memory(&entry);
            replayed += 1;
        }

        engine.files = Some(EngineFiles {
            dir: dir.to_path_buf(),
            wal: Wal::open(&wal_path, options.fsync)?,
        });

        tracing::info!(
            dir = ?dir,
            keys = engine.len(),
            applied_index = engine.applied_index,
            revision = engine.revision,
            replayed,
            "storage engine opened"
        );
        Ok(engine)
    }

    /// Apply a committed entry and return the store revision after it.
    ///
    /// Entries must arrive in index order. An index that was already applied
    /// is ignored and answered with the current revision.
    pub fn apply(&mut self, entry: &LogEntry) -> Result<u64> {
        if entry.index <= self.applied_index {
            return Ok(self.revision);
        }
        if entry.index != self.applied_index + 1 {
            return Err(StorageError::OutOfOrderApply {
                expected: self.applied_index + 1,
                got: entry.index,
            });
        }
        if let Some(files) = &mut self.files {
            files.wal.append(entry)?;
        }
        Ok(self.apply_in_memory(entry))
    }

    fn apply_in_memory(&mut self, entry: &LogEntry) -> u64 {
        match &entry.command {
            Command::Noop => {}
            Command::Put { key, value } => {
                self.revision += 1;
                let revision = self.revision;
                let versions = self.keys.entry(key.clone()).or_default();
                let (create_revision, version) = match versions.last() {
                    Some(last) if last.value.is_some() => (last.create_revision, last.version + 1),
                    _ => (revision, 1),
                };
                versions.push(Version {
                    revision,
                    create_revision,
                    version,
                    value: Some(value.clone()),
                });
            }
            Command::Delete { key } => {
                self.revision += 1;
                let revision = self.revision;
                if let Some(versions) = self.keys.get_mut(key) {
                    if versions.last().is_some_and(|v| v.value.is_some()) {
                        versions.push(Version {
                            revision,
                            create_revision: 0,
                            version: 0,
                            value: None,
                        });
                    }
                }
            }
        }
        self.applied_index = entry.index;
        self.applied_term = entry.term;
        self.prune_history();
        self.revision
    }

    /// Drop versions that fell out of the retention window, keeping the
    /// newest version at or below the floor so reads there stay exact.
    fn prune_history(&mut self) {
        let window = self.history_revisions;
        if window == 0 || self.revision - self.compacted_revision <= 2 * window {
            return;
        }
        let floor = self.revision - window;
        self.keys.retain(|_, versions| {
            let below = versions.iter().take_while(|v| v.revision <= floor).count();
            if below > 1 {
                versions.drain(..below - 1);
            }
            if versions.first().is_some_and(|v| v.revision <= floor && v.value.is_none()) {
                versions.remove(0);
            }
            !versions.is_empty()
        });
        self.compacted_revision = floor;
        tracing::debug!(floor, keys = self.keys.len(), "pruned key history");
    }

    /// The value of `key` now, or as of `revision`
    pub fn get(&self, key: &[u8], revision: Option<u64>) -> Result<Option<KeyValue>> {
        let at = revision.unwrap_or(self.revision);
        if at > self.revision {
            return Err(StorageError::FutureRevision {
                requested: at,
                current: self.revision,
            });
        }
        if at < self.compacted_revision {
            return Err(StorageError::Compacted {
                requested: at,
                compacted: self.compacted_revision,
            });
        }
        let Some(versions) = self.keys.get(key) else {
            return Ok(None);
        };
        let found = versions.iter().rev().find(|v| v.revision <= at);
        Ok(found.and_then(|v| {
            v.value.as_ref().map(|value| KeyValue {
                key: key.to_vec(),
                value: value.clone(),
                create_revision: v.create_revision,
                mod_revision: v.revision,
                version: v.version,
            })
        }))
    }

    /// Hand out the fsync for applied entries so it can run after the
    /// caller releases its lock on the engine. `None` when nothing is on disk.
    pub fn sync_handle(&mut self) -> Result<Option<SyncHandle>> {
        match &mut self.files {
            Some(files) => Ok(Some(files.wal.sync_handle()?)),
            None => Ok(None),
        }
    }

    /// Flush wal frames buffered under the batch policy
    pub fn sync(&mut self) -> Result<()> {
        match &mut self.files {
            Some(files) => files.wal.sync(),
            None => Ok(()),
        }
    }

    pub fn meta(&self) -> SnapshotMeta {
        SnapshotMeta {
            applied_index: self.applied_index,
            applied_term: self.applied_term,
            revision: self.revision,
        }
    }

    /// Write a durable image of the current state and start a fresh wal
    pub fn snapshot(&mut self) -> Result<SnapshotMeta> {
        let bytes = self.export()?;
        if let Some(files) = &mut self.files {
            write_atomic(&files.snapshot_path(), &bytes)?;
            files.wal.reset()?;
        }
        tracing::debug!(applied_index = self.applied_index, revision = self.revision, "engine snapshot written");
        Ok(self.meta())
    }

    /// The current state as bytes for a lagging follower
    pub fn export(&self) -> Result<Vec<u8>> {
        let image = SnapshotImage {
            meta: self.meta(),
            compacted_revision: self.compacted_revision,
            keys: self
                .keys
                .iter()
                .map(|(key, versions)| KeyHistory {
                    key: key.clone(),
                    versions: versions.clone(),
                })
                .collect(),
        };
        Ok(serde_json::to_vec(&image)?)
    }

    /// Replace the whole state with an exported image and make it durable
    pub fn restore(&mut self, data: &[u8]) -> Result<SnapshotMeta> {
        let image: SnapshotImage = serde_json::from_slice(data)?;
        if let Some(files) = &mut self.files {
            write_atomic(&files.snapshot_path(), data)?;
            files.wal.reset()?;
        }
        self.load_image(image);
        tracing::info!(
            applied_index = self.applied_index,
            revision = self.revision,
            keys = self.len(),
            "engine restored from snapshot"
        );
        Ok(self.meta())
    }

    fn load_image(&mut self, image: SnapshotImage) {
        self.keys = image
            .keys
            .into_iter()
            .map(|history| (history.key, history.versions))
            .collect();
        self.applied_index = image.meta.applied_index;
        self.applied_term = image.meta.applied_term;
        self.revision = image.meta.revision;
        self.compacted_revision = image.compacted_revision;
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    pub fn applied_term(&self) -> u64 {
        self.applied_term
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn compacted_revision(&self) -> u64 {
        self.compacted_revision
    }

    /// Number of live (not deleted) keys
    pub fn len(&self) -> usize {
        self.keys
            .values()
            .filter(|versions| versions.last().is_some_and(|v| v.value.is_some()))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
