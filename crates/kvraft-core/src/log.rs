//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: owned by node.rs, persisted via kvraft-storage, applied by the kv engine
//! what: Command, LogEntry, RaftLog with a compacted prefix and unpersisted-change tracking

use serde::{Deserialize, Serialize};

/// An operation proposed to the replicated state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Appended by a fresh leader so entries from earlier terms can commit
    Noop,
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl Command {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Command::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Command::Delete { key: key.into() }
    }

    /// Whether applying this command produces a new store revision
    pub fn is_write(&self) -> bool {
        !matches!(self, Command::Noop)
    }
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    /// The command to be applied to the state machine
    pub command: Command,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: u64, index: u64, command: Command) -> Self {
        Self {
            term,
            index,
            command,
        }
    }
}

/// Log mutations that have not reached stable storage yet.
///
/// Apply them in field order: truncate, append, compact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogChanges {
    pub truncate_from: Option<u64>,
    pub append: Vec<LogEntry>,
    /// (snapshot_index, snapshot_term) of a newly compacted prefix
    pub compact_to: Option<(u64, u64)>,
}

impl LogChanges {
    pub fn is_empty(&self) -> bool {
        self.truncate_from.is_none() && self.append.is_empty() && self.compact_to.is_none()
    }
}

/// In-memory view of the replicated log.
///
/// Entries up to `snapshot_index` live only in the state machine snapshot;
/// the log keeps the boundary term so consistency checks still work there.
#[derive(Debug, Clone, Default)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
    snapshot_index: u64,
    snapshot_term: u64,
    /// lowest index whose stored copy is missing or stale
    dirty_from: Option<u64>,
    /// last index known to be in stable storage
    persisted_last: u64,
    compacted: Option<(u64, u64)>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from what stable storage returned
    pub fn from_parts(snapshot_index: u64, snapshot_term: u64, entries: Vec<LogEntry>) -> Self {
        let entries: Vec<LogEntry> = entries
            .into_iter()
            .filter(|e| e.index > snapshot_index)
            .collect();
        let persisted_last = entries.last().map_or(snapshot_index, |e| e.index);
        Self {
            entries,
            snapshot_index,
            snapshot_term,
            dirty_from: None,
            persisted_last,
            compacted: None,
        }
    }

    /// True when no entries are held past the snapshot boundary
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> u64 {
        self.snapshot_term
    }

    pub fn first_index(&self) -> u64 {
        self.snapshot_index + 1
    }

    pub fn last_index(&self) -> u64 {
        self.entries.last().map_or(self.snapshot_index, |e| e.index)
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map_or(self.snapshot_term, |e| e.term)
    }

    fn offset(&self, index: u64) -> Option<usize> {
        if index <= self.snapshot_index {
            return None;
        }
        let offset = (index - self.snapshot_index - 1) as usize;
        (offset < self.entries.len()).then_some(offset)
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        self.offset(index).map(|o| &self.entries[o])
    }

    /// Term of the entry at `index`; `None` when absent or compacted away
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.entry(index).map(|e| e.term)
    }

    pub fn matches(&self, index: u64, term: u64) -> bool {
        self.term_at(index) == Some(term)
    }

    /// Election restriction: is a log ending at (`last_index`, `last_term`)
    /// at least as up-to-date as this one?
    pub fn is_up_to_date(&self, last_index: u64, last_term: u64) -> bool {
        let my_term = self.last_term();
        last_term > my_term || (last_term == my_term && last_index >= self.last_index())
    }

    /// Up to `max` entries starting at `from`
    pub fn entries_from(&self, from: u64, max: usize) -> Vec<LogEntry> {
        match self.offset(from) {
            Some(o) => self.entries[o..].iter().take(max).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Entries in `from..=to`
    pub fn slice(&self, from: u64, to: u64) -> Vec<LogEntry> {
        if to < from {
            return Vec::new();
        }
        self.entries_from(from, (to - from + 1) as usize)
    }

    /// Append an entry whose index directly follows the last one
    pub fn push(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1, "log entries must be contiguous");
        self.mark_dirty(entry.index);
        self.entries.push(entry);
    }

    /// Append a command at the next index and return the new entry
    pub fn append(&mut self, term: u64, command: Command) -> LogEntry {
        let entry = LogEntry::new(term, self.last_index() + 1, command);
        self.push(entry.clone());
        entry
    }

    /// Remove every entry at or after `index`
    pub fn truncate_from(&mut self, index: u64) {
        let index = index.max(self.first_index());
        if let Some(o) = self.offset(index) {
            self.entries.truncate(o);
            self.mark_dirty(index);
        }
    }

    /// Drop the prefix up to and including `index`.
    ///
    /// Returns false when `index` is not inside the live part of the log.
    pub fn compact_to(&mut self, index: u64) -> bool {
        if index <= self.snapshot_index || index > self.last_index() {
            return false;
        }
        let Some(term) = self.term_at(index) else {
            return false;
        };
        let drop = (index - self.snapshot_index) as usize;
        self.entries.drain(..drop);
        self.snapshot_index = index;
        self.snapshot_term = term;
        self.compacted = Some((index, term));
        true
    }

    /// Make (`index`, `term`) the snapshot boundary.
    ///
    /// A suffix that agrees with the snapshot is kept; otherwise the whole log
    /// is discarded. Returns whether the suffix was kept.
    pub fn reset_to_snapshot(&mut self, index: u64, term: u64) -> bool {
        if index >= self.snapshot_index && self.matches(index, term) {
            if index > self.snapshot_index {
                self.compact_to(index);
            }
            return true;
        }
        self.entries.clear();
        self.mark_dirty(index + 1);
        self.snapshot_index = index;
        self.snapshot_term = term;
        self.compacted = Some((index, term));
        false
    }

    /// Hand over every mutation since the last call, for stable storage
    pub fn take_changes(&mut self) -> LogChanges {
        let mut changes = LogChanges {
            compact_to: self.compacted.take(),
            ..Default::default()
        };
        if let Some(from) = self.dirty_from.take() {
            if from <= self.persisted_last {
                changes.truncate_from = Some(from);
            }
            changes.append = self.entries_from(from.max(self.first_index()), usize::MAX);
        }
        self.persisted_last = self.last_index();
        changes
    }

    fn mark_dirty(&mut self, index: u64) {
        self.dirty_from = Some(self.dirty_from.map_or(index, |d| d.min(index)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with_terms(terms: &[u64]) -> RaftLog {
        let mut log = RaftLog::new();
        for term in terms {
            log.append(*term, Command::Noop);
        }
        log
    }

    #[test]
    fn empty_log_boundaries() {
        let log = RaftLog::new();
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_at(0), Some(0));
        assert_eq!(log.term_at(1), None);
    }

    #[test]
    fn compaction_keeps_boundary_term() {
        let mut log = log_with_terms(&[1, 1, 2, 2]);
        assert!(log.compact_to(3));
        assert_eq!(log.first_index(), 4);
        assert_eq!(log.term_at(3), Some(2));
        assert_eq!(log.term_at(2), None);
        assert_eq!(log.last_index(), 4);
        assert!(!log.compact_to(2));
    }

    #[test]
    fn up_to_date_compares_term_then_index() {
        let log = log_with_terms(&[1, 2]);
        assert!(log.is_up_to_date(1, 3));
        assert!(log.is_up_to_date(2, 2));
        assert!(!log.is_up_to_date(1, 2));
        assert!(!log.is_up_to_date(5, 1));
    }

    #[test]
    fn changes_report_truncation_of_persisted_entries() {
        let mut log = log_with_terms(&[1, 1, 1]);
        let first = log.take_changes();
        assert_eq!(first.truncate_from, None);
        assert_eq!(first.append.len(), 3);

        log.truncate_from(2);
        log.push(LogEntry::new(2, 2, Command::Noop));
        let changes = log.take_changes();
        assert_eq!(changes.truncate_from, Some(2));
        assert_eq!(changes.append, vec![LogEntry::new(2, 2, Command::Noop)]);
        assert!(log.take_changes().is_empty());
    }

    #[test]
    fn reset_to_snapshot_keeps_matching_suffix() {
        let mut log = log_with_terms(&[1, 1, 2]);
        log.take_changes();
        assert!(log.reset_to_snapshot(2, 1));
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.take_changes().compact_to, Some((2, 1)));
    }

    #[test]
    fn reset_to_snapshot_discards_conflicting_log() {
        let mut log = log_with_terms(&[1, 1, 1]);
        log.take_changes();
        assert!(!log.reset_to_snapshot(5, 3));
        assert!(log.is_empty());
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.last_term(), 3);
        let changes = log.take_changes();
        assert_eq!(changes.truncate_from, None);
        assert_eq!(changes.compact_to, Some((5, 3)));

        let mut log = log_with_terms(&[1, 1, 1, 1]);
        log.take_changes();
        assert!(!log.reset_to_snapshot(2, 7));
        assert_eq!(log.take_changes().truncate_from, Some(3));
    }
}
