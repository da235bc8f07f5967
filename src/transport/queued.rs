//! Blocking queue transport shared by the in-memory and log flavours.
//!
//! One mutex guards the queue and its journal, a condvar wakes blocked
//! senders and pollers. Journal entries that a restart needs to stay correct
//! (appends, acks, operator actions) are written before the change is
//! applied. Redelivery bookkeeping is written after; if that write is lost
//! the earlier `leased` entry already makes the record come back.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::journal::{appended, live_entries, Journal, JournalEntry};
use super::queue::{QueueState, Settled};
use super::{
    DeadLetter, DeadLetterQueue, DeliveryGuarantee, Transport, TransportError, TransportOptions,
};
use crate::envelope::{Delivery, DeliveryTag, EnvelopeRecord, Lease};

pub(super) struct Inner<J> {
    pub queue: QueueState,
    pub journal: J,
    closed: bool,
}

struct Shared<J> {
    inner: Mutex<Inner<J>>,
    changed: Condvar,
    options: TransportOptions,
}

/// Bounded queue transport over a [`Journal`].
///
/// Cloning gives another handle to the same queue.
pub struct QueueTransport<J> {
    shared: Arc<Shared<J>>,
}

impl<J> Clone for QueueTransport<J> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<J: Journal> QueueTransport<J> {
    pub(super) fn from_parts(queue: QueueState, journal: J, options: TransportOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    queue,
                    journal,
                    closed: false,
                }),
                changed: Condvar::new(),
                options,
            }),
        }
    }

    pub fn options(&self) -> TransportOptions {
        self.shared.options
    }

    fn lock(&self, operation: &'static str) -> Result<MutexGuard<'_, Inner<J>>, TransportError> {
        self.shared
            .inner
            .lock()
            .map_err(|_| TransportError::Poisoned(operation))
    }

    /// Run `f` with the queue locked.
    pub(super) fn with_inner<R>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut Inner<J>) -> R,
    ) -> Result<R, TransportError> {
        let mut inner = self.lock(operation)?;
        Ok(f(&mut inner))
    }

    /// Records held for delivery (pending and in flight).
    pub fn len(&self) -> usize {
        self.lock("len").map(|inner| inner.queue.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.lock("in_flight")
            .map(|inner| inner.queue.in_flight_len())
            .unwrap_or(0)
    }
}

fn journal_after(journal: &mut impl Journal, entry: &JournalEntry<'_>) {
    if let Err(err) = journal.write(entry) {
        tracing::warn!(error = %err, "journal write failed; state will be rebuilt from earlier entries");
    }
}

/// Rewrite the journal once it has grown past its threshold.
fn compact_if_due<J: Journal>(inner: &mut Inner<J>) {
    if !inner.journal.needs_compaction() {
        return;
    }
    let entries = live_entries(&inner.queue);
    if let Err(err) = inner.journal.rewrite(&entries) {
        tracing::warn!(error = %err, "journal compaction failed; will retry after the next write");
    }
}

fn log_reclaimed(tag: DeliveryTag, settled: Settled) {
    match settled {
        Settled::Requeued { delivery_attempt } => tracing::warn!(
            tag = %tag,
            delivery_attempt,
            "lease expired before acknowledgment; redelivering"
        ),
        Settled::Dropped => tracing::warn!(
            tag = %tag,
            "lease expired under at-most-once; record dropped"
        ),
    }
}

impl<J: Journal> Transport for QueueTransport<J> {
    fn guarantee(&self) -> DeliveryGuarantee {
        self.shared.options.guarantee
    }

    fn send(
        &self,
        record: EnvelopeRecord,
        timeout: Duration,
    ) -> Result<DeliveryTag, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock("send")?;

        loop {
            if inner.closed {
                return Err(TransportError::Closed);
            }
            if inner.queue.len() < self.shared.options.capacity {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Unavailable(format!(
                    "queue full ({} records)",
                    self.shared.options.capacity
                )));
            }
            inner = self
                .shared
                .changed
                .wait_timeout(inner, deadline - now)
                .map_err(|_| TransportError::Poisoned("send"))?
                .0;
        }

        let tag = inner.queue.peek_tag();
        inner.journal.write(&appended(tag, &record))?;
        let tag = inner.queue.enqueue(record);
        compact_if_due(&mut *inner);
        drop(inner);
        self.shared.changed.notify_all();
        Ok(tag)
    }

    fn poll(&self, timeout: Duration) -> Result<Option<Delivery>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock("poll")?;

        loop {
            let now = Instant::now();
            for (tag, settled) in inner.queue.reclaim_expired(now) {
                log_reclaimed(tag, settled);
                journal_after(&mut inner.journal, &JournalEntry::settled(tag, settled));
            }
            if let Some(delivery) = inner.queue.lease_next(now, self.shared.options.ack_timeout) {
                journal_after(&mut inner.journal, &JournalEntry::Leased { tag: delivery.tag() });
                compact_if_due(&mut *inner);
                return Ok(Some(delivery));
            }
            if now >= deadline {
                return Ok(None);
            }

            let mut wait = deadline - now;
            if let Some(at) = inner.queue.next_deadline() {
                wait = wait.min(at.saturating_duration_since(now).max(Duration::from_millis(1)));
            }
            inner = self
                .shared
                .changed
                .wait_timeout(inner, wait)
                .map_err(|_| TransportError::Poisoned("poll"))?
                .0;
        }
    }

    fn ack(&self, lease: Lease) -> Result<(), TransportError> {
        let mut inner = self.lock("ack")?;
        inner.queue.check_lease(lease)?;
        inner.journal.write(&JournalEntry::Acked { tag: lease.tag })?;
        inner.queue.ack(lease)?;
        compact_if_due(&mut *inner);
        drop(inner);
        self.shared.changed.notify_all();
        Ok(())
    }

    fn nack(&self, lease: Lease, retry_after: Duration, reason: &str) -> Result<(), TransportError> {
        let tag = lease.tag;
        let mut inner = self.lock("nack")?;
        let settled = inner.queue.nack(lease, Instant::now() + retry_after)?;
        journal_after(&mut inner.journal, &JournalEntry::settled(tag, settled));
        compact_if_due(&mut *inner);
        drop(inner);
        self.shared.changed.notify_all();

        if settled == Settled::Dropped {
            tracing::warn!(tag = %tag, reason, "delivery failed under at-most-once; record dropped");
        }
        Ok(())
    }

    fn dead_letter(&self, lease: Lease, reason: &str) -> Result<(), TransportError> {
        let tag = lease.tag;
        let mut inner = self.lock("dead_letter")?;
        let dead = inner.queue.dead_letter(lease, reason)?;
        let entry = match &dead {
            Some(dead) => JournalEntry::DeadLettered {
                tag,
                reason: reason.into(),
                at: dead.dead_lettered_at,
            },
            None => JournalEntry::Dropped { tag },
        };
        journal_after(&mut inner.journal, &entry);
        compact_if_due(&mut *inner);
        drop(inner);
        self.shared.changed.notify_all();

        if dead.is_none() {
            tracing::warn!(tag = %tag, reason, "dead letter under at-most-once; record dropped");
        }
        Ok(())
    }

    fn sequence_high_watermarks(&self) -> Result<HashMap<String, u64>, TransportError> {
        Ok(self.lock("watermarks")?.queue.watermarks())
    }

    fn sequence_high_watermark(&self, partition_key: &str) -> Result<Option<u64>, TransportError> {
        Ok(self.lock("watermark")?.queue.watermark(partition_key))
    }

    fn close(&self) {
        if let Ok(mut inner) = self.lock("close") {
            inner.closed = true;
        }
        self.shared.changed.notify_all();
    }
}

impl<J: Journal> DeadLetterQueue for QueueTransport<J> {
    fn dead_letters(&self) -> Result<Vec<DeadLetter>, TransportError> {
        Ok(self.lock("dead_letters")?.queue.dead_letters())
    }

    fn retry_dead_letter(&self, tag: DeliveryTag) -> Result<(), TransportError> {
        let mut inner = self.lock("retry_dead_letter")?;
        if !inner.queue.is_dead(tag) {
            return Err(TransportError::NotDeadLettered(tag));
        }
        inner.journal.write(&JournalEntry::Requeued { tag })?;
        inner.queue.retry_dead(tag)?;
        drop(inner);
        self.shared.changed.notify_all();
        tracing::info!(tag = %tag, "dead letter requeued");
        Ok(())
    }

    fn discard_dead_letter(&self, tag: DeliveryTag) -> Result<DeadLetter, TransportError> {
        let mut inner = self.lock("discard_dead_letter")?;
        if !inner.queue.is_dead(tag) {
            return Err(TransportError::NotDeadLettered(tag));
        }
        inner.journal.write(&JournalEntry::Discarded { tag })?;
        let dead = inner.queue.discard_dead(tag)?;
        tracing::info!(tag = %tag, "dead letter discarded");
        Ok(dead)
    }
}
