//! Durable transport backed by an append-only journal file.
//!
//! Behaves like [`InMemoryTransport`](super::InMemoryTransport) while running.
//! Reopening the same path after a crash brings back every record that was
//! not acknowledged; records that were in flight come back with their
//! delivery attempt raised by one.

use std::path::Path;

use super::journal::{live_entries, FileJournal, Journal};
use super::queued::QueueTransport;
use super::{TransportError, TransportOptions};

/// Journal entries written between automatic compactions by default.
pub const DEFAULT_COMPACT_THRESHOLD: usize = 100_000;

pub type LogTransport = QueueTransport<FileJournal>;

impl LogTransport {
    /// Open or create the journal at `path` and replay it.
    pub fn open(
        path: impl AsRef<Path>,
        options: TransportOptions,
        fsync: bool,
    ) -> Result<Self, TransportError> {
        Self::open_compacting(path, options, fsync, DEFAULT_COMPACT_THRESHOLD)
    }

    /// Like [`open`](Self::open), rewriting the journal every
    /// `compact_threshold` entries. Zero leaves compaction to [`compact`](Self::compact).
    pub fn open_compacting(
        path: impl AsRef<Path>,
        options: TransportOptions,
        fsync: bool,
        compact_threshold: usize,
    ) -> Result<Self, TransportError> {
        let (journal, queue) =
            FileJournal::open(path, fsync, options.guarantee, compact_threshold)?;
        Ok(QueueTransport::from_parts(queue, journal, options))
    }

    /// Rewrite the journal so it only holds records still needed.
    pub fn compact(&self) -> Result<(), TransportError> {
        self.with_inner("compact", |inner| {
            inner.journal.rewrite(&live_entries(&inner.queue))
        })?
    }
}
