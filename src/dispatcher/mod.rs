//! Dispatcher - routes delivered records to subscribed handlers.
//!
//! A `Dispatcher` is built once, then shared (`Arc`) with the worker pool.
//! For every delivery it decodes the record, runs the handlers registered for
//! its event type in registration order, and settles the delivery with the
//! transport:
//!
//! | outcome                                   | transport call  |
//! |-------------------------------------------|-----------------|
//! | every handler succeeded, or none exist    | `ack`           |
//! | a handler failed, attempts left           | `nack` + delay  |
//! | a handler failed, attempts exhausted      | `dead_letter`   |
//! | the payload cannot be decoded             | `dead_letter`   |
//!
//! ## Example
//!
//! ```
//! use order_events::{Dispatcher, Envelope, EventPayload, RetryPolicy};
//! use std::time::Duration;
//!
//! let dispatcher = Dispatcher::builder()
//!     .subscribe("OrderCreated", |envelope: &Envelope| {
//!         if let EventPayload::OrderCreated(created) = envelope.event.payload() {
//!             println!("order {} total {}", created.order_id, created.total_amount);
//!         }
//!         Ok(())
//!     })
//!     .retry(RetryPolicy::fixed(3, Duration::from_millis(10)))
//!     .build();
//! assert_eq!(dispatcher.handler_count("OrderCreated"), 1);
//! ```

mod error;
mod retry;

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use crate::codec::{EventCodec, JsonCodec};
use crate::envelope::{Delivery, DeliveryTag, Envelope};
use crate::event::EventId;
use crate::transport::{Transport, TransportError};

pub use error::HandlerError;
pub use retry::{Backoff, RetryPolicy};

/// Reacts to one event. Must tolerate seeing the same `event_id` twice.
pub trait Handler: Send + Sync {
    fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(&Envelope) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        self(envelope)
    }
}

/// Raised when a record is moved to the dead-letter queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetterAlert {
    pub tag: DeliveryTag,
    pub event_id: EventId,
    pub event_type: String,
    pub partition_key: String,
    pub delivery_attempt: u32,
    pub reason: String,
}

type AlertHook = Box<dyn Fn(&DeadLetterAlert) + Send + Sync>;

/// How a delivery was settled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    Acked,
    /// Given back for another attempt after `delay`.
    Retrying { delivery_attempt: u32, delay: Duration },
    DeadLettered { reason: String },
}

/// Builder for a [`Dispatcher`].
pub struct DispatcherBuilder<C> {
    codec: C,
    handlers: HashMap<String, Vec<Box<dyn Handler>>>,
    retry: RetryPolicy,
    on_dead_letter: Option<AlertHook>,
}

impl<C: EventCodec> DispatcherBuilder<C> {
    /// Register a closure for `event_type`. Handlers of one type run in
    /// registration order.
    pub fn subscribe<F>(self, event_type: &str, handler: F) -> Self
    where
        F: Fn(&Envelope) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe_handler(event_type, handler)
    }

    pub fn subscribe_handler<H>(mut self, event_type: &str, handler: H) -> Self
    where
        H: Handler + 'static,
    {
        self.handlers
            .entry(event_type.to_string())
            .or_default()
            .push(Box::new(handler));
        self
    }

    /// Replace the codec used to decode records.
    pub fn codec<C2: EventCodec>(self, codec: C2) -> DispatcherBuilder<C2> {
        DispatcherBuilder {
            codec,
            handlers: self.handlers,
            retry: self.retry,
            on_dead_letter: self.on_dead_letter,
        }
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Called for every dead-lettered record, after the error log.
    pub fn on_dead_letter<F>(mut self, hook: F) -> Self
    where
        F: Fn(&DeadLetterAlert) + Send + Sync + 'static,
    {
        self.on_dead_letter = Some(Box::new(hook));
        self
    }

    pub fn build(self) -> Dispatcher<C> {
        Dispatcher {
            codec: self.codec,
            handlers: self.handlers,
            retry: self.retry,
            on_dead_letter: self.on_dead_letter,
        }
    }
}

/// Subscriber registry plus the retry rules applied to failures.
pub struct Dispatcher<C = JsonCodec> {
    codec: C,
    handlers: HashMap<String, Vec<Box<dyn Handler>>>,
    retry: RetryPolicy,
    on_dead_letter: Option<AlertHook>,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder<JsonCodec> {
        DispatcherBuilder {
            codec: JsonCodec::default(),
            handlers: HashMap::new(),
            retry: RetryPolicy::default(),
            on_dead_letter: None,
        }
    }
}

impl<C: EventCodec> Dispatcher<C> {
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn handler_count(&self, event_type: &str) -> usize {
        self.handlers.get(event_type).map_or(0, Vec::len)
    }

    /// Decode a delivery, run its handlers and settle it with `transport`.
    ///
    /// Handler failures and undecodable records never surface as errors;
    /// they end up in the outcome. Only a failing transport call does.
    pub fn route<T>(
        &self,
        transport: &T,
        delivery: Delivery,
    ) -> Result<RouteOutcome, TransportError>
    where
        T: Transport + ?Sized,
    {
        let Delivery { lease, record } = delivery;
        let tag = lease.tag;

        let event = match self.codec.decode(&record.payload) {
            Ok(event) => event,
            Err(err) => {
                let reason = format!("undecodable record: {err}");
                tracing::error!(
                    tag = %tag,
                    event_type = %record.event_type,
                    event_id = %record.event_id,
                    error = %err,
                    "cannot decode record; dead-lettering"
                );
                transport.dead_letter(lease, &reason)?;
                self.alert(DeadLetterAlert {
                    tag,
                    event_id: record.event_id,
                    event_type: record.event_type,
                    partition_key: record.partition_key,
                    delivery_attempt: record.delivery_attempt,
                    reason: reason.clone(),
                });
                return Ok(RouteOutcome::DeadLettered { reason });
            }
        };

        let envelope = record.to_envelope(event);
        let handlers = match self.handlers.get(envelope.event.event_type()) {
            Some(handlers) if !handlers.is_empty() => handlers,
            _ => {
                tracing::debug!(
                    tag = %tag,
                    event_type = envelope.event.event_type(),
                    "no handler subscribed; acknowledging"
                );
                transport.ack(lease)?;
                return Ok(RouteOutcome::Acked);
            }
        };

        let failure = handlers
            .iter()
            .find_map(|handler| invoke(handler.as_ref(), &envelope).err());

        let Some(failure) = failure else {
            transport.ack(lease)?;
            tracing::debug!(
                tag = %tag,
                event_id = %envelope.event.event_id(),
                sequence_token = envelope.sequence_token,
                "event handled"
            );
            return Ok(RouteOutcome::Acked);
        };

        let reason = failure.to_string();
        let attempt = envelope.delivery_attempt;

        if self.retry.should_retry(attempt) {
            let delay = self.retry.backoff.delay_for(attempt);
            tracing::warn!(
                tag = %tag,
                event_id = %envelope.event.event_id(),
                delivery_attempt = attempt,
                max_attempts = self.retry.max_attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %failure,
                "handler failed; retry scheduled"
            );
            transport.nack(lease, delay, &reason)?;
            return Ok(RouteOutcome::Retrying {
                delivery_attempt: attempt + 1,
                delay,
            });
        }

        tracing::error!(
            tag = %tag,
            event_id = %envelope.event.event_id(),
            event_type = envelope.event.event_type(),
            delivery_attempt = attempt,
            error = %failure,
            "retries exhausted; event dead-lettered"
        );
        transport.dead_letter(lease, &reason)?;
        self.alert(DeadLetterAlert {
            tag,
            event_id: envelope.event.event_id(),
            event_type: envelope.event.event_type().to_string(),
            partition_key: envelope.event.partition_key(),
            delivery_attempt: attempt,
            reason: reason.clone(),
        });
        Ok(RouteOutcome::DeadLettered { reason })
    }

    fn alert(&self, alert: DeadLetterAlert) {
        if let Some(hook) = &self.on_dead_letter {
            hook(&alert);
        }
    }
}

/// Run one handler, turning a panic into a failure.
fn invoke(handler: &dyn Handler, envelope: &Envelope) -> Result<(), HandlerError> {
    match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(envelope))) {
        Ok(result) => result,
        Err(payload) => Err(HandlerError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
