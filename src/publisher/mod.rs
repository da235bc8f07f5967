//! Publisher - stamps events with a per-key sequence token and hands them to
//! a transport.
//!
//! `publish` returns as soon as the transport has stored the record. It never
//! waits for handlers. What it can wait on (an earlier publish for the same
//! key, then queue capacity) shares one submission deadline.
//!
//! ## Example
//!
//! ```
//! use order_events::{Event, InMemoryTransport, OrderCreated, OrderId, Publisher, UserId};
//!
//! let publisher = Publisher::new(InMemoryTransport::new()).unwrap();
//! let order_id = OrderId::new();
//!
//! let receipt = publisher
//!     .publish(Event::new(OrderCreated {
//!         order_id,
//!         user_id: UserId::new(),
//!         total_amount: 6500,
//!         items: Vec::new(),
//!     }))
//!     .unwrap();
//! assert_eq!(receipt.sequence_token, 1);
//! assert_eq!(receipt.partition_key, order_id.to_string());
//! ```

mod error;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::codec::{EventCodec, JsonCodec};
use crate::envelope::{DeliveryTag, EnvelopeRecord};
use crate::event::{Event, EventId};
use crate::transport::{Transport, TransportError};

pub use error::PublishError;

/// Tuning for a [`Publisher`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublisherOptions {
    /// Longest `publish` waits for the transport to accept a record.
    pub submit_timeout: Duration,
    /// Reject event ids already published within the window.
    pub deduplicate: bool,
    /// Number of recent event ids remembered for deduplication.
    pub dedup_window: usize,
    /// Partition keys whose last token is kept in memory. Past that, idle
    /// keys are forgotten and looked up in the transport again when they
    /// next publish. Zero keeps every key.
    pub sequence_cache: usize,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self {
            submit_timeout: Duration::from_secs(1),
            deduplicate: true,
            dedup_window: 10_000,
            sequence_cache: 10_000,
        }
    }
}

impl PublisherOptions {
    pub fn with_submit_timeout(mut self, submit_timeout: Duration) -> Self {
        self.submit_timeout = submit_timeout;
        self
    }

    pub fn with_deduplicate(mut self, deduplicate: bool) -> Self {
        self.deduplicate = deduplicate;
        self
    }

    pub fn with_dedup_window(mut self, dedup_window: usize) -> Self {
        self.dedup_window = dedup_window;
        self
    }

    pub fn with_sequence_cache(mut self, sequence_cache: usize) -> Self {
        self.sequence_cache = sequence_cache;
        self
    }
}

/// Anything order code can hand events to: a [`Publisher`], an
/// [`EventBus`](crate::EventBus), or a shared handle to either.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event) -> Result<PublishReceipt, PublishError>;
}

impl<P: EventSink + ?Sized> EventSink for std::sync::Arc<P> {
    fn publish(&self, event: Event) -> Result<PublishReceipt, PublishError> {
        (**self).publish(event)
    }
}

/// What the transport accepted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishReceipt {
    pub event_id: EventId,
    pub partition_key: String,
    pub sequence_token: u64,
    pub tag: DeliveryTag,
}

/// Bounded memory of recently published ids. Oldest ids fall out first.
struct RecentIds {
    ids: HashSet<EventId>,
    order: VecDeque<EventId>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn contains(&self, id: &EventId) -> bool {
        self.ids.contains(id)
    }

    fn remember(&mut self, id: EventId) {
        if self.capacity == 0 || !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

struct PublishState {
    sequences: HashMap<String, u64>,
    /// Keys with a send in progress.
    sending: HashSet<String>,
    recent: RecentIds,
}

impl PublishState {
    /// Drop cached tokens of idle keys once the cache is over `limit`.
    fn trim_sequences(&mut self, limit: usize) {
        if limit == 0 || self.sequences.len() <= limit {
            return;
        }
        let sending = &self.sending;
        self.sequences.retain(|key, _| sending.contains(key));
        tracing::debug!(limit, "forgot cached sequence tokens of idle keys");
    }
}

/// Publishes events onto a transport.
///
/// Safe to share between request threads (`Arc<Publisher<_>>`). Publishes
/// for the same partition key go out one at a time so tokens reach the
/// transport in the order they were assigned; other keys do not wait.
pub struct Publisher<T, C = JsonCodec> {
    transport: T,
    codec: C,
    options: PublisherOptions,
    state: Mutex<PublishState>,
    key_free: Condvar,
}

impl<T: Transport> Publisher<T> {
    /// Publisher with the JSON codec and default options.
    pub fn new(transport: T) -> Result<Self, PublishError> {
        Self::with_codec(transport, JsonCodec::default(), PublisherOptions::default())
    }
}

impl<T: Transport, C: EventCodec> Publisher<T, C> {
    /// Build a publisher, continuing sequences from what the transport holds.
    pub fn with_codec(
        transport: T,
        codec: C,
        options: PublisherOptions,
    ) -> Result<Self, PublishError> {
        let mut state = PublishState {
            sequences: transport.sequence_high_watermarks()?,
            sending: HashSet::new(),
            recent: RecentIds::new(options.dedup_window),
        };
        state.trim_sequences(options.sequence_cache);
        Ok(Self {
            transport,
            codec,
            options,
            state: Mutex::new(state),
            key_free: Condvar::new(),
        })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn options(&self) -> PublisherOptions {
        self.options
    }

    fn lock(&self) -> Result<MutexGuard<'_, PublishState>, PublishError> {
        self.state
            .lock()
            .map_err(|_| PublishError::TransportUnavailable(TransportError::Poisoned("publish")))
    }

    /// Wait until no other publish for `partition_key` is sending, then
    /// claim the key. Gives up at `deadline`.
    fn claim<'a>(
        &'a self,
        mut state: MutexGuard<'a, PublishState>,
        partition_key: &str,
        deadline: Instant,
    ) -> Result<MutexGuard<'a, PublishState>, PublishError> {
        while state.sending.contains(partition_key) {
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Unavailable(format!(
                    "publish for {partition_key} still in progress"
                ))
                .into());
            }
            state = self
                .key_free
                .wait_timeout(state, deadline - now)
                .map_err(|_| TransportError::Poisoned("publish"))?
                .0;
        }
        state.sending.insert(partition_key.to_string());
        Ok(state)
    }

    /// Submit an event for delivery.
    ///
    /// Returns once the transport holds the record, or fails after at most
    /// `submit_timeout`. On error nothing was stored, no sequence token was
    /// used and the id may be published again.
    pub fn publish(&self, event: Event) -> Result<PublishReceipt, PublishError> {
        let deadline = Instant::now() + self.options.submit_timeout;
        let event_id = event.event_id();
        let partition_key = event.partition_key();

        let state = self.lock()?;
        let mut state = self.claim(state, &partition_key, deadline)?;
        let result = self.stamp(&mut state, &event, &partition_key);
        drop(state);

        // The key is claimed: the next token for it cannot reach the
        // transport before this one, and the state lock is free meanwhile.
        let sent = result.and_then(|record| {
            let sequence_token = record.sequence_token;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let tag = self.transport.send(record, remaining)?;
            Ok((sequence_token, tag))
        });

        let mut state = self.lock()?;
        state.sending.remove(&partition_key);
        if let Ok((sequence_token, _)) = &sent {
            state.sequences.insert(partition_key.clone(), *sequence_token);
            if self.options.deduplicate {
                state.recent.remember(event_id);
            }
            state.trim_sequences(self.options.sequence_cache);
        }
        drop(state);
        self.key_free.notify_all();

        let (sequence_token, tag) = sent?;
        tracing::debug!(
            event_id = %event_id,
            event_type = event.event_type(),
            partition_key = %partition_key,
            sequence_token,
            tag = %tag,
            "event published"
        );

        Ok(PublishReceipt {
            event_id,
            partition_key,
            sequence_token,
            tag,
        })
    }

    /// Check for a duplicate, pick the next token and encode the record.
    fn stamp(
        &self,
        state: &mut PublishState,
        event: &Event,
        partition_key: &str,
    ) -> Result<EnvelopeRecord, PublishError> {
        let event_id = event.event_id();
        if self.options.deduplicate && state.recent.contains(&event_id) {
            tracing::warn!(event_id = %event_id, "rejected duplicate publish");
            return Err(PublishError::DuplicateEvent(event_id));
        }

        let last = match state.sequences.get(partition_key) {
            Some(last) => *last,
            None => self
                .transport
                .sequence_high_watermark(partition_key)?
                .unwrap_or(0),
        };
        let payload = self.codec.encode(event)?;
        Ok(EnvelopeRecord::new(event, last + 1, payload))
    }
}

impl<T: Transport, C: EventCodec> EventSink for Publisher<T, C> {
    fn publish(&self, event: Event) -> Result<PublishReceipt, PublishError> {
        Publisher::publish(self, event)
    }
}
