//! Delivery state shared by the bundled transports.
//!
//! `QueueState` is a plain state machine with no locking of its own; each
//! transport keeps it behind a single mutex so enqueue, lease and settle are
//! atomic. The lock is never held while a handler runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant, SystemTime};

use super::{DeadLetter, DeliveryGuarantee, TransportError};
use crate::envelope::{Delivery, DeliveryTag, EnvelopeRecord, Lease};

struct Pending {
    record: EnvelopeRecord,
    not_before: Option<Instant>,
}

struct Leased {
    record: EnvelopeRecord,
    until: Instant,
    id: u64,
}

/// What happened to a record whose delivery was given back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settled {
    /// Queued again with the new attempt count.
    Requeued { delivery_attempt: u32 },
    /// Discarded without redelivery (at-most-once).
    Dropped,
}

pub(crate) struct QueueState {
    guarantee: DeliveryGuarantee,
    next_tag: u64,
    next_lease: u64,
    pending: BTreeMap<u64, Pending>,
    in_flight: HashMap<u64, Leased>,
    busy: HashSet<String>,
    dead: BTreeMap<u64, DeadLetter>,
    watermarks: HashMap<String, u64>,
}

impl QueueState {
    pub fn new(guarantee: DeliveryGuarantee) -> Self {
        Self {
            guarantee,
            next_tag: 1,
            next_lease: 1,
            pending: BTreeMap::new(),
            in_flight: HashMap::new(),
            busy: HashSet::new(),
            dead: BTreeMap::new(),
            watermarks: HashMap::new(),
        }
    }

    /// Records held for delivery: pending plus in flight.
    pub fn len(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn watermarks(&self) -> HashMap<String, u64> {
        self.watermarks.clone()
    }

    pub fn watermark(&self, partition_key: &str) -> Option<u64> {
        self.watermarks.get(partition_key).copied()
    }

    /// Tag the next enqueued record will get.
    pub fn peek_tag(&self) -> DeliveryTag {
        DeliveryTag(self.next_tag)
    }

    /// Fails unless `lease` is the current lease of an in-flight record.
    pub fn check_lease(&self, lease: Lease) -> Result<(), TransportError> {
        match self.in_flight.get(&lease.tag.0) {
            Some(leased) if leased.id == lease.id => Ok(()),
            Some(_) => Err(TransportError::LeaseExpired(lease)),
            None if self.pending.contains_key(&lease.tag.0) || self.is_dead(lease.tag) => {
                Err(TransportError::LeaseExpired(lease))
            }
            None => Err(TransportError::UnknownDelivery(lease.tag)),
        }
    }

    pub fn is_dead(&self, tag: DeliveryTag) -> bool {
        self.dead.contains_key(&tag.0)
    }

    pub fn enqueue(&mut self, record: EnvelopeRecord) -> DeliveryTag {
        let tag = self.next_tag;
        self.restore_pending(DeliveryTag(tag), record);
        DeliveryTag(tag)
    }

    /// Put a record back at its original position (journal replay).
    pub fn restore_pending(&mut self, tag: DeliveryTag, record: EnvelopeRecord) {
        self.track(tag, &record);
        self.pending.insert(
            tag.0,
            Pending {
                record,
                not_before: None,
            },
        );
    }

    pub fn restore_dead(&mut self, dead: DeadLetter) {
        self.track(dead.tag, &dead.record);
        self.dead.insert(dead.tag.0, dead);
    }

    /// Account for a record that no longer needs delivery (acked before a
    /// restart) so tags and sequence watermarks keep moving forward.
    pub fn track(&mut self, tag: DeliveryTag, record: &EnvelopeRecord) {
        self.reserve_tags(tag.0 + 1);
        self.raise_watermark(&record.partition_key, record.sequence_token);
    }

    pub fn reserve_tags(&mut self, next_tag: u64) {
        self.next_tag = self.next_tag.max(next_tag);
    }

    pub fn raise_watermark(&mut self, partition_key: &str, sequence_token: u64) {
        let mark = self
            .watermarks
            .entry(partition_key.to_string())
            .or_insert(0);
        *mark = (*mark).max(sequence_token);
    }

    /// Lease the oldest deliverable record.
    ///
    /// A partition key is skipped while one of its records is in flight or
    /// waiting out a retry delay, so later records never overtake it.
    pub fn lease_next(&mut self, now: Instant, lease: Duration) -> Option<Delivery> {
        let mut blocked: HashSet<&str> = HashSet::new();
        let mut chosen = None;

        for (tag, pending) in &self.pending {
            let key = pending.record.partition_key.as_str();
            if self.busy.contains(key) || blocked.contains(key) {
                continue;
            }
            if pending.not_before.is_some_and(|at| at > now) {
                blocked.insert(key);
                continue;
            }
            chosen = Some(*tag);
            break;
        }

        let tag = chosen?;
        let pending = self.pending.remove(&tag)?;
        let id = self.next_lease;
        self.next_lease += 1;
        self.busy.insert(pending.record.partition_key.clone());
        self.in_flight.insert(
            tag,
            Leased {
                record: pending.record.clone(),
                until: now + lease,
                id,
            },
        );

        Some(Delivery {
            lease: Lease {
                tag: DeliveryTag(tag),
                id,
            },
            record: pending.record,
        })
    }

    fn release(&mut self, lease: Lease) -> Result<EnvelopeRecord, TransportError> {
        self.check_lease(lease)?;
        self.release_tag(lease.tag)
    }

    fn release_tag(&mut self, tag: DeliveryTag) -> Result<EnvelopeRecord, TransportError> {
        let leased = self
            .in_flight
            .remove(&tag.0)
            .ok_or(TransportError::UnknownDelivery(tag))?;
        self.busy.remove(&leased.record.partition_key);
        Ok(leased.record)
    }

    pub fn ack(&mut self, lease: Lease) -> Result<EnvelopeRecord, TransportError> {
        self.release(lease)
    }

    pub fn nack(&mut self, lease: Lease, retry_at: Instant) -> Result<Settled, TransportError> {
        let record = self.release(lease)?;
        Ok(self.requeue(lease.tag, record, Some(retry_at)))
    }

    fn requeue(
        &mut self,
        tag: DeliveryTag,
        mut record: EnvelopeRecord,
        not_before: Option<Instant>,
    ) -> Settled {
        if self.guarantee == DeliveryGuarantee::AtMostOnce {
            return Settled::Dropped;
        }
        record.delivery_attempt += 1;
        let delivery_attempt = record.delivery_attempt;
        self.pending.insert(tag.0, Pending { record, not_before });
        Settled::Requeued { delivery_attempt }
    }

    /// Move a leased record to the dead-letter area.
    ///
    /// Returns `None` under at-most-once, where the record is dropped instead.
    pub fn dead_letter(
        &mut self,
        lease: Lease,
        reason: &str,
    ) -> Result<Option<DeadLetter>, TransportError> {
        let record = self.release(lease)?;
        let tag = lease.tag;
        if self.guarantee == DeliveryGuarantee::AtMostOnce {
            return Ok(None);
        }
        let dead = DeadLetter {
            tag,
            record,
            reason: reason.to_string(),
            dead_lettered_at: SystemTime::now(),
        };
        self.dead.insert(tag.0, dead.clone());
        Ok(Some(dead))
    }

    /// Give back every lease that ran out, as if its consumer crashed.
    pub fn reclaim_expired(&mut self, now: Instant) -> Vec<(DeliveryTag, Settled)> {
        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, leased)| leased.until <= now)
            .map(|(tag, _)| *tag)
            .collect();

        let mut reclaimed = Vec::with_capacity(expired.len());
        for tag in expired {
            if let Ok(record) = self.release_tag(DeliveryTag(tag)) {
                let settled = self.requeue(DeliveryTag(tag), record, None);
                reclaimed.push((DeliveryTag(tag), settled));
            }
        }
        reclaimed.sort_by_key(|(tag, _)| *tag);
        reclaimed
    }

    /// Earliest moment something may become deliverable or expire.
    pub fn next_deadline(&self) -> Option<Instant> {
        let delayed = self.pending.values().filter_map(|p| p.not_before);
        let leases = self.in_flight.values().map(|l| l.until);
        delayed.chain(leases).min()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead.values().cloned().collect()
    }

    /// Queue a dead letter again with a fresh attempt budget.
    pub fn retry_dead(&mut self, tag: DeliveryTag) -> Result<(), TransportError> {
        let mut dead = self
            .dead
            .remove(&tag.0)
            .ok_or(TransportError::NotDeadLettered(tag))?;
        dead.record.delivery_attempt = 0;
        self.pending.insert(
            tag.0,
            Pending {
                record: dead.record,
                not_before: None,
            },
        );
        Ok(())
    }

    pub fn discard_dead(&mut self, tag: DeliveryTag) -> Result<DeadLetter, TransportError> {
        self.dead
            .remove(&tag.0)
            .ok_or(TransportError::NotDeadLettered(tag))
    }

    /// Full copy of the live state, for journal compaction.
    pub fn snapshot(&self) -> QueueSnapshot {
        let mut in_flight: Vec<_> = self
            .in_flight
            .iter()
            .map(|(tag, l)| (DeliveryTag(*tag), l.record.clone()))
            .collect();
        in_flight.sort_by_key(|(tag, _)| *tag);

        QueueSnapshot {
            next_tag: self.next_tag,
            watermarks: self.watermarks.clone(),
            pending: self
                .pending
                .iter()
                .map(|(tag, p)| (DeliveryTag(*tag), p.record.clone()))
                .collect(),
            in_flight,
            dead: self.dead_letters(),
        }
    }
}

pub(crate) struct QueueSnapshot {
    pub next_tag: u64,
    pub watermarks: HashMap<String, u64>,
    pub pending: Vec<(DeliveryTag, EnvelopeRecord)>,
    pub in_flight: Vec<(DeliveryTag, EnvelopeRecord)>,
    pub dead: Vec<DeadLetter>,
}
