//! Write-ahead journal behind the queue transport.
//!
//! Every state change of a record is one JSON line. Replaying the lines in
//! order rebuilds the queue after a restart:
//!
//! ```text
//! {"op":"appended","tag":1,"record":{...}}
//! {"op":"leased","tag":1}
//! {"op":"redelivery","tag":1,"delivery_attempt":1}
//! {"op":"acked","tag":1}
//! ```

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::queue::{QueueState, Settled};
use super::{DeadLetter, DeliveryGuarantee, TransportError};
use crate::envelope::{DeliveryTag, EnvelopeRecord};

/// One state change of a queued record.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalEntry<'a> {
    Appended {
        tag: DeliveryTag,
        record: Cow<'a, EnvelopeRecord>,
    },
    Leased {
        tag: DeliveryTag,
    },
    Redelivery {
        tag: DeliveryTag,
        delivery_attempt: u32,
    },
    Acked {
        tag: DeliveryTag,
    },
    Dropped {
        tag: DeliveryTag,
    },
    DeadLettered {
        tag: DeliveryTag,
        reason: Cow<'a, str>,
        at: SystemTime,
    },
    Requeued {
        tag: DeliveryTag,
    },
    Discarded {
        tag: DeliveryTag,
    },
    /// Written first by compaction so forgotten records still count.
    Checkpoint {
        next_tag: u64,
        watermarks: HashMap<String, u64>,
    },
}

impl JournalEntry<'_> {
    pub(crate) fn settled(tag: DeliveryTag, settled: Settled) -> JournalEntry<'static> {
        match settled {
            Settled::Requeued { delivery_attempt } => JournalEntry::Redelivery {
                tag,
                delivery_attempt,
            },
            Settled::Dropped => JournalEntry::Dropped { tag },
        }
    }
}

/// Sink for queue state changes.
pub trait Journal: Send + 'static {
    fn write(&mut self, entry: &JournalEntry<'_>) -> Result<(), TransportError>;

    /// Whether enough entries piled up since the last rewrite to compact.
    fn needs_compaction(&self) -> bool {
        false
    }

    /// Replace the journal with `entries`, which describe the whole live state.
    fn rewrite(&mut self, _entries: &[JournalEntry<'_>]) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Journal for transports that keep nothing across restarts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoJournal;

impl Journal for NoJournal {
    fn write(&mut self, _entry: &JournalEntry<'_>) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Append-only JSON-lines journal file.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    file: File,
    fsync: bool,
    /// Byte length of the complete lines on disk.
    len: u64,
    /// Entries written since the file was last rewritten.
    written: usize,
    /// Rewrite after this many entries; 0 turns automatic compaction off.
    compact_threshold: usize,
}

impl FileJournal {
    /// Open (or create) the journal at `path` and rebuild the queue from it.
    ///
    /// Records that were leased but never settled are redelivered with
    /// `delivery_attempt + 1` (dropped under at-most-once). A torn final line
    /// is cut off so new entries start on a fresh line.
    pub(crate) fn open(
        path: impl AsRef<Path>,
        fsync: bool,
        guarantee: DeliveryGuarantee,
        compact_threshold: usize,
    ) -> Result<(Self, QueueState), TransportError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let (replay, len) = Replay::read(&file)?;
        let on_disk = file.metadata()?.len();
        if on_disk > len {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = on_disk - len,
                "truncating torn journal tail"
            );
            file.set_len(len)?;
        }

        let mut journal = Self {
            path,
            file,
            fsync,
            len,
            written: replay.entries,
            compact_threshold,
        };
        let queue = replay.into_queue(guarantee, &mut journal)?;
        Ok((journal, queue))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&mut self, line: &[u8]) -> io::Result<()> {
        self.file.write_all(line)?;
        self.file.flush()?;
        if self.fsync {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

/// Entries that rebuild `queue` from scratch, for compaction.
pub(super) fn live_entries(queue: &QueueState) -> Vec<JournalEntry<'static>> {
    let snapshot = queue.snapshot();
    let mut entries = vec![JournalEntry::Checkpoint {
        next_tag: snapshot.next_tag,
        watermarks: snapshot.watermarks,
    }];
    for (tag, record) in snapshot.pending {
        entries.push(JournalEntry::Appended {
            tag,
            record: Cow::Owned(record),
        });
    }
    for (tag, record) in snapshot.in_flight {
        entries.push(JournalEntry::Appended {
            tag,
            record: Cow::Owned(record),
        });
        entries.push(JournalEntry::Leased { tag });
    }
    for dead in snapshot.dead {
        entries.push(JournalEntry::Appended {
            tag: dead.tag,
            record: Cow::Owned(dead.record),
        });
        entries.push(JournalEntry::DeadLettered {
            tag: dead.tag,
            reason: Cow::Owned(dead.reason),
            at: dead.dead_lettered_at,
        });
    }
    entries
}

pub(super) fn appended(tag: DeliveryTag, record: &EnvelopeRecord) -> JournalEntry<'_> {
    JournalEntry::Appended {
        tag,
        record: Cow::Borrowed(record),
    }
}

fn encode_line(buf: &mut Vec<u8>, entry: &JournalEntry<'_>) -> Result<(), TransportError> {
    serde_json::to_writer(&mut *buf, entry).map_err(|e| TransportError::Journal {
        line: 0,
        message: e.to_string(),
    })?;
    buf.push(b'\n');
    Ok(())
}

impl Journal for FileJournal {
    fn write(&mut self, entry: &JournalEntry<'_>) -> Result<(), TransportError> {
        let mut line = Vec::new();
        encode_line(&mut line, entry)?;
        if let Err(err) = self.append(&line) {
            // Cut off whatever part of the line reached the file.
            if let Err(trim) = self.file.set_len(self.len) {
                tracing::error!(
                    path = %self.path.display(),
                    error = %trim,
                    "cannot trim partial journal entry"
                );
            }
            return Err(err.into());
        }
        self.len += line.len() as u64;
        self.written += 1;
        Ok(())
    }

    fn needs_compaction(&self) -> bool {
        self.compact_threshold > 0 && self.written >= self.compact_threshold
    }

    fn rewrite(&mut self, entries: &[JournalEntry<'_>]) -> Result<(), TransportError> {
        let tmp_path = self.path.with_extension("compacting");
        let mut lines = Vec::new();
        for entry in entries {
            encode_line(&mut lines, entry)?;
        }

        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&lines)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        self.len = lines.len() as u64;
        self.written = 0;
        tracing::info!(
            path = %self.path.display(),
            entries = entries.len(),
            bytes = self.len,
            "journal compacted"
        );
        Ok(())
    }
}

struct Live {
    record: EnvelopeRecord,
    leased: bool,
}

#[derive(Default)]
struct Replay {
    next_tag: u64,
    watermarks: HashMap<String, u64>,
    live: BTreeMap<DeliveryTag, Live>,
    dead: BTreeMap<DeliveryTag, DeadLetter>,
    entries: usize,
}

impl Replay {
    /// Replay every complete line. Also returns the byte length those lines
    /// cover; anything after it is a torn append.
    fn read(file: &File) -> Result<(Self, u64), TransportError> {
        let mut replay = Replay::default();
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        let mut len = 0u64;
        let mut line = 0;

        loop {
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf)?;
            if read == 0 {
                break;
            }
            line += 1;
            // A line without its newline is what a crash mid-append leaves.
            let Some(body) = buf.strip_suffix(b"\n") else {
                break;
            };
            if !body.iter().all(u8::is_ascii_whitespace) {
                let entry = serde_json::from_slice::<JournalEntry<'static>>(body).map_err(
                    |err| TransportError::Journal {
                        line,
                        message: err.to_string(),
                    },
                )?;
                replay.apply(entry);
            }
            len += read as u64;
        }
        Ok((replay, len))
    }

    fn apply(&mut self, entry: JournalEntry<'static>) {
        self.entries += 1;
        match entry {
            JournalEntry::Appended { tag, record } => {
                let record = record.into_owned();
                self.next_tag = self.next_tag.max(tag.0 + 1);
                let mark = self.watermarks.entry(record.partition_key.clone()).or_insert(0);
                *mark = (*mark).max(record.sequence_token);
                self.live.insert(tag, Live { record, leased: false });
            }
            JournalEntry::Leased { tag } => {
                if let Some(live) = self.live.get_mut(&tag) {
                    live.leased = true;
                }
            }
            JournalEntry::Redelivery {
                tag,
                delivery_attempt,
            } => {
                if let Some(live) = self.live.get_mut(&tag) {
                    live.record.delivery_attempt = delivery_attempt;
                    live.leased = false;
                }
            }
            JournalEntry::Acked { tag } | JournalEntry::Dropped { tag } => {
                self.live.remove(&tag);
            }
            JournalEntry::DeadLettered { tag, reason, at } => {
                if let Some(live) = self.live.remove(&tag) {
                    self.dead.insert(
                        tag,
                        DeadLetter {
                            tag,
                            record: live.record,
                            reason: reason.into_owned(),
                            dead_lettered_at: at,
                        },
                    );
                }
            }
            JournalEntry::Requeued { tag } => {
                if let Some(mut dead) = self.dead.remove(&tag) {
                    dead.record.delivery_attempt = 0;
                    self.live.insert(
                        tag,
                        Live {
                            record: dead.record,
                            leased: false,
                        },
                    );
                }
            }
            JournalEntry::Discarded { tag } => {
                self.dead.remove(&tag);
            }
            JournalEntry::Checkpoint {
                next_tag,
                watermarks,
            } => {
                self.next_tag = self.next_tag.max(next_tag);
                for (key, seq) in watermarks {
                    let mark = self.watermarks.entry(key).or_insert(0);
                    *mark = (*mark).max(seq);
                }
            }
        }
    }

    fn into_queue(
        self,
        guarantee: DeliveryGuarantee,
        journal: &mut FileJournal,
    ) -> Result<QueueState, TransportError> {
        let mut queue = QueueState::new(guarantee);
        queue.reserve_tags(self.next_tag);
        for (key, seq) in &self.watermarks {
            queue.raise_watermark(key, *seq);
        }

        let mut redelivered = 0;
        for (tag, live) in self.live {
            let mut record = live.record;
            if live.leased {
                // The consumer holding it died before settling.
                if guarantee == DeliveryGuarantee::AtMostOnce {
                    journal.write(&JournalEntry::Dropped { tag })?;
                    continue;
                }
                record.delivery_attempt += 1;
                journal.write(&JournalEntry::Redelivery {
                    tag,
                    delivery_attempt: record.delivery_attempt,
                })?;
                redelivered += 1;
            }
            queue.restore_pending(tag, record);
        }
        let dead = self.dead.len();
        for (_, dead_letter) in self.dead {
            queue.restore_dead(dead_letter);
        }

        tracing::info!(
            path = %journal.path.display(),
            entries = self.entries,
            pending = queue.len(),
            redelivered,
            dead,
            "journal replayed"
        );
        Ok(queue)
    }
}
