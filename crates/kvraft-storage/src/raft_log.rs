//! # raft_log
//!
//! why: raft must not forget its term, its vote or its log across a crash
//! relations: the node worker persists kvraft-core's HardState and LogChanges through RaftStorage
//! what: RaftStorage trait, FileStorage (atomic hard state + framed log file), InMemoryStorage

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use kvraft_core::{HardState, LogChanges, LogEntry, RaftLog};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use crate::wal::{encode_frame, write_atomic, FsyncPolicy, Wal};

const HARD_STATE_FILE: &str = "hard_state.json";
const LOG_FILE: &str = "raft.log";

/// Durable storage of raft state.
///
/// Implementations must have made a change durable by the time the call
/// returns (modulo the fsync policy); the node sends no message that depends
/// on state it has not persisted.
pub trait RaftStorage: Send {
    /// Persist term and vote. A lower term than the stored one is refused.
    fn save_hard_state(&mut self, state: &HardState) -> Result<()>;

    fn load_hard_state(&self) -> Result<HardState>;

    /// Append entries after the current last entry
    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()>;

    /// Remove every entry at or after `from_index`
    fn truncate_log_from(&mut self, from_index: u64) -> Result<()>;

    /// Forget every entry up to and including `index`, remembering its term
    fn compact_log(&mut self, index: u64, term: u64) -> Result<()>;

    /// Everything needed to rebuild the in-memory log after a restart
    fn load_log(&self) -> Result<PersistedLog>;

    /// Flush whatever the last calls left buffered
    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    /// Wipe all persisted state
    fn clear(&mut self) -> Result<()>;

    /// Write out a batch of log mutations taken from `RaftLog::take_changes`
    fn persist(&mut self, changes: &LogChanges) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        if let Some(from) = changes.truncate_from {
            self.truncate_log_from(from)?;
        }
        if let Some((index, term)) = changes.compact_to {
            self.compact_log(index, term)?;
        }
        self.append_entries(&changes.append)?;
        self.sync()
    }
}

/// The log as stable storage holds it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedLog {
    pub snapshot_index: u64,
    pub snapshot_term: u64,
    pub entries: Vec<LogEntry>,
}

impl PersistedLog {
    pub fn last_index(&self) -> u64 {
        self.entries.last().map_or(self.snapshot_index, |e| e.index)
    }

    pub fn into_raft_log(self) -> RaftLog {
        RaftLog::from_parts(self.snapshot_index, self.snapshot_term, self.entries)
    }

    /// Append, replacing any overlapping suffix; returns false on a gap
    fn push_entries(&mut self, entries: &[LogEntry]) -> bool {
        for entry in entries {
            if entry.index <= self.snapshot_index {
                continue;
            }
            if entry.index <= self.last_index() {
                self.truncate_from(entry.index);
            }
            if entry.index != self.last_index() + 1 {
                return false;
            }
            self.entries.push(entry.clone());
        }
        true
    }

    fn truncate_from(&mut self, from_index: u64) {
        self.entries.retain(|e| e.index < from_index);
    }

    fn compact(&mut self, index: u64, term: u64) {
        if index < self.snapshot_index {
            return;
        }
        self.entries.retain(|e| e.index > index);
        if self.entries.first().is_some_and(|e| e.index != index + 1) {
            self.entries.clear();
        }
        self.snapshot_index = index;
        self.snapshot_term = term;
    }
}

/// One mutation in the log file
#[derive(Debug, Clone, Serialize, Deserialize)]
enum LogRecord {
    Append(LogEntry),
    TruncateFrom(u64),
    Compact { index: u64, term: u64 },
}

fn check_term(stored: &HardState, state: &HardState) -> Result<()> {
    if state.term < stored.term {
        return Err(StorageError::TermRegression {
            stored: stored.term,
            attempted: state.term,
        });
    }
    Ok(())
}

// -- file storage implementation --

/// File-based raft storage.
///
/// Stores state in a directory with:
/// - hard_state.json: term and voted_for, replaced atomically
/// - raft.log: framed stream of append / truncate / compact records
///
/// An in-memory image of the log is kept so reads never touch disk.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    hard_state: HardState,
    log: PersistedLog,
    wal: Wal,
    fsync: FsyncPolicy,
}

impl FileStorage {
    /// Open the storage at `dir`, creating it if needed and recovering what is there
    pub fn open(dir: impl Into<PathBuf>, fsync: FsyncPolicy) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let hard_state = Self::read_hard_state(&dir.join(HARD_STATE_FILE))?;

        let log_path = dir.join(LOG_FILE);
        let mut log = PersistedLog::default();
        for record in Wal::replay::<LogRecord>(&log_path)? {
            match record {
                LogRecord::Append(entry) => {
                    if !log.push_entries(std::slice::from_ref(&entry)) {
                        return Err(StorageError::corrupt(
                            &log_path,
                            format!("gap before entry {} (last {})", entry.index, log.last_index()),
                        ));
                    }
                }
                LogRecord::TruncateFrom(index) => log.truncate_from(index),
                LogRecord::Compact { index, term } => log.compact(index, term),
            }
        }
        let wal = Wal::open(&log_path, fsync)?;

        tracing::info!(
            dir = ?dir,
            term = hard_state.term,
            snapshot_index = log.snapshot_index,
            last_index = log.last_index(),
            "raft storage opened"
        );

        Ok(Self {
            dir,
            hard_state,
            log,
            wal,
            fsync,
        })
    }

    fn hard_state_path(&self) -> PathBuf {
        self.dir.join(HARD_STATE_FILE)
    }

    fn read_hard_state(path: &Path) -> Result<HardState> {
        let contents = match fs::read(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HardState::default()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&contents)
            .map_err(|e| StorageError::corrupt(path, format!("unreadable hard state: {e}")))
    }

    /// Rewrite the log file so it holds exactly the current image
    fn rewrite_log(&mut self) -> Result<()> {
        let mut bytes = encode_frame(&LogRecord::Compact {
            index: self.log.snapshot_index,
            term: self.log.snapshot_term,
        })?;
        for entry in &self.log.entries {
            bytes.extend(encode_frame(&LogRecord::Append(entry.clone()))?);
        }
        let path = self.wal.path().to_path_buf();
        self.wal.sync()?;
        write_atomic(&path, &bytes)?;
        self.wal = Wal::open(&path, self.fsync)?;
        Ok(())
    }
}

impl RaftStorage for FileStorage {
    fn save_hard_state(&mut self, state: &HardState) -> Result<()> {
        check_term(&self.hard_state, state)?;
        if *state == self.hard_state && self.hard_state_path().exists() {
            return Ok(());
        }
        let json = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.hard_state_path(), &json)?;
        self.hard_state = *state;
        Ok(())
    }

    fn load_hard_state(&self) -> Result<HardState> {
        Ok(self.hard_state)
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()> {
        let entries: Vec<&LogEntry> = entries
            .iter()
            .filter(|e| e.index > self.log.snapshot_index)
            .collect();
        let Some(first) = entries.first() else {
            return Ok(());
        };
        if first.index > self.log.last_index() + 1 {
            return Err(StorageError::corrupt(
                self.wal.path(),
                format!(
                    "append of entry {} would leave a gap after {}",
                    first.index,
                    self.log.last_index()
                ),
            ));
        }
        if first.index <= self.log.last_index() {
            self.truncate_log_from(first.index)?;
        }
        for entry in entries {
            self.wal.append(&LogRecord::Append(entry.clone()))?;
            self.log.entries.push(entry.clone());
        }
        Ok(())
    }

    fn truncate_log_from(&mut self, from_index: u64) -> Result<()> {
        if from_index > self.log.last_index() {
            return Ok(());
        }
        self.wal.append(&LogRecord::TruncateFrom(from_index))?;
        self.log.truncate_from(from_index);
        Ok(())
    }

    fn compact_log(&mut self, index: u64, term: u64) -> Result<()> {
        if index <= self.log.snapshot_index {
            return Ok(());
        }
        self.log.compact(index, term);
        self.rewrite_log()?;
        tracing::debug!(index, term, remaining = self.log.entries.len(), "raft log compacted");
        Ok(())
    }

    fn load_log(&self) -> Result<PersistedLog> {
        Ok(self.log.clone())
    }

    fn sync(&mut self) -> Result<()> {
        self.wal.sync()
    }

    fn clear(&mut self) -> Result<()> {
        match fs::remove_file(self.hard_state_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.hard_state = HardState::default();
        self.log = PersistedLog::default();
        self.wal.reset()
    }
}

// -- in-memory storage implementation --

/// In-memory storage for tests; nothing survives the value being dropped
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    hard_state: HardState,
    log: PersistedLog,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RaftStorage for InMemoryStorage {
    fn save_hard_state(&mut self, state: &HardState) -> Result<()> {
        check_term(&self.hard_state, state)?;
        self.hard_state = *state;
        Ok(())
    }

    fn load_hard_state(&self) -> Result<HardState> {
        Ok(self.hard_state)
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()> {
        if !self.log.push_entries(entries) {
            return Err(StorageError::corrupt(
                "<memory>",
                format!("append would leave a gap after {}", self.log.last_index()),
            ));
        }
        Ok(())
    }

    fn truncate_log_from(&mut self, from_index: u64) -> Result<()> {
        self.log.truncate_from(from_index);
        Ok(())
    }

    fn compact_log(&mut self, index: u64, term: u64) -> Result<()> {
        if index > self.log.snapshot_index {
            self.log.compact(index, term);
        }
        Ok(())
    }

    fn load_log(&self) -> Result<PersistedLog> {
        Ok(self.log.clone())
    }

    fn clear(&mut self) -> Result<()> {
        *self = Self::default();
        Ok(())
    }
}
