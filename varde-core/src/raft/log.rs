//! In-memory replicated log.
//!
//! Indices are 1-based: index 0 is the empty sentinel, so `last_index`
//! of a fresh log is 0 and the first appended entry gets index 1. The
//! vector position of an entry is always `index - 1`.

use serde::{Deserialize, Serialize};

use crate::raft::command::Command;
use crate::types::{LogIndex, Term};

/// One slot in the replicated log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub command: Command,
    /// Leader wall clock at append, for time-based apply decisions.
    pub appended_at_ms: i64,
}

/// Append-only log with truncate-on-conflict.
#[derive(Debug, Default)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the newest entry, 0 when empty.
    pub fn last_index(&self) -> LogIndex {
        self.entries.last().map_or(0, |e| e.index)
    }

    /// Term of the newest entry, 0 when empty.
    pub fn last_term(&self) -> Term {
        self.entries.last().map_or(0, |e| e.term)
    }

    /// Term of the entry at `index`, 0 for the sentinel, None past the end.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.entry_at(index).map(|e| e.term)
    }

    pub fn entry_at(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    /// Appends a fresh entry at the tail, assigning its index.
    pub fn append(&mut self, term: Term, command: Command, appended_at_ms: i64) -> LogIndex {
        let index = self.last_index() + 1;
        self.entries.push(LogEntry {
            term,
            index,
            command,
            appended_at_ms,
        });
        index
    }

    /// Appends a replicated entry that already carries its index.
    pub fn push(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        self.entries.push(entry);
    }

    /// Drops every entry at `from` and after.
    pub fn truncate_from(&mut self, from: LogIndex) {
        if from == 0 {
            self.entries.clear();
        } else {
            self.entries.truncate(from as usize - 1);
        }
    }

    /// Entries in `[from, from + limit)`, clamped to the tail.
    pub fn entries_from(&self, from: LogIndex, limit: usize) -> Vec<LogEntry> {
        if from == 0 || from > self.last_index() {
            return Vec::new();
        }
        let start = from as usize - 1;
        let end = (start + limit).min(self.entries.len());
        self.entries[start..end].to_vec()
    }

    /// True when a candidate's log is at least as up to date as ours.
    pub fn candidate_is_current(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        let our_term = self.last_term();
        last_log_term > our_term || (last_log_term == our_term && last_log_index >= self.last_index())
    }
}
