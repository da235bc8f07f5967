//! Event bus - one transport, its publisher and a worker pool, started from
//! a [`BusConfig`].
//!
//! ## Example
//!
//! ```
//! use order_events::{BusConfig, Dispatcher, Event, EventBus, OrderCreated, OrderId, UserId};
//!
//! let handlers = Dispatcher::builder().subscribe("OrderCreated", |envelope| {
//!     println!("got {}", envelope.event.event_id());
//!     Ok(())
//! });
//! let bus = EventBus::start(BusConfig::default().with_workers(1), handlers).unwrap();
//!
//! bus.publish(Event::new(OrderCreated {
//!     order_id: OrderId::new(),
//!     user_id: UserId::new(),
//!     total_amount: 6500,
//!     items: Vec::new(),
//! }))
//! .unwrap();
//!
//! let stats = bus.shutdown();
//! assert_eq!(stats.dead_lettered, 0);
//! ```

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::codec::{EventCodec, JsonCodec};
use crate::config::{BusConfig, ConfigError, TransportConfig};
use crate::dispatcher::{Dispatcher, DispatcherBuilder};
use crate::envelope::DeliveryTag;
use crate::event::Event;
use crate::publisher::{EventSink, PublishError, PublishReceipt, Publisher};
use crate::transport::{
    AnyTransport, DeadLetter, DeadLetterQueue, InMemoryTransport, LogTransport, Transport,
    TransportError,
};
use crate::worker::{WorkerHandle, WorkerPool, WorkerStats};

#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot open transport: {0}")]
    Transport(#[from] TransportError),
    #[error("cannot start publisher: {0}")]
    Publish(#[from] PublishError),
}

/// A running bus.
///
/// Dropping it signals the workers without waiting; call
/// [`shutdown`](EventBus::shutdown) to wait for them.
pub struct EventBus<C = JsonCodec> {
    transport: AnyTransport,
    publisher: Publisher<AnyTransport, C>,
    dispatcher: Arc<Dispatcher<C>>,
    workers: WorkerHandle,
    shutdown_timeout: Option<Duration>,
}

impl EventBus {
    /// Open the configured transport and start the workers.
    ///
    /// The retry policy from `config` replaces whatever the builder had.
    pub fn start(
        config: BusConfig,
        handlers: DispatcherBuilder<JsonCodec>,
    ) -> Result<Self, BusError> {
        Self::start_with_codec(config, handlers, JsonCodec::default())
    }
}

impl<C: EventCodec + Clone + 'static> EventBus<C> {
    /// Like [`start`](EventBus::start) with a custom codec for both sides.
    pub fn start_with_codec(
        config: BusConfig,
        handlers: DispatcherBuilder<C>,
        codec: C,
    ) -> Result<Self, BusError> {
        config.validate()?;

        let options = config.transport_options();
        let transport: AnyTransport = match &config.transport {
            TransportConfig::InMemory { .. } => InMemoryTransport::with_options(options).into(),
            TransportConfig::Log {
                path,
                fsync,
                compact_threshold,
                ..
            } => LogTransport::open_compacting(path, options, *fsync, *compact_threshold)?.into(),
        };

        let publisher =
            Publisher::with_codec(transport.clone(), codec.clone(), config.publisher_options())?;
        let dispatcher = Arc::new(handlers.codec(codec).retry(config.retry).build());
        let workers = WorkerPool::spawn(
            transport.clone(),
            Arc::clone(&dispatcher),
            config.worker_options(),
        );

        Ok(Self {
            transport,
            publisher,
            dispatcher,
            workers,
            shutdown_timeout: config.shutdown_timeout(),
        })
    }

    pub fn publish(&self, event: Event) -> Result<PublishReceipt, PublishError> {
        self.publisher.publish(event)
    }

    pub fn publisher(&self) -> &Publisher<AnyTransport, C> {
        &self.publisher
    }

    pub fn dispatcher(&self) -> &Dispatcher<C> {
        &self.dispatcher
    }

    pub fn transport(&self) -> &AnyTransport {
        &self.transport
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, TransportError> {
        self.transport.dead_letters()
    }

    pub fn retry_dead_letter(&self, tag: DeliveryTag) -> Result<(), TransportError> {
        self.transport.retry_dead_letter(tag)
    }

    pub fn discard_dead_letter(&self, tag: DeliveryTag) -> Result<DeadLetter, TransportError> {
        self.transport.discard_dead_letter(tag)
    }

    /// Stop accepting events, stop the workers and wait for them.
    ///
    /// Records still queued stay in the transport; a log transport delivers
    /// them after the next start. With `shutdown_timeout_ms` configured this
    /// is [`shutdown_timeout`](Self::shutdown_timeout).
    pub fn shutdown(self) -> WorkerStats {
        match self.shutdown_timeout {
            Some(timeout) => self.shutdown_timeout(timeout),
            None => {
                self.transport.close();
                self.workers.stop()
            }
        }
    }

    /// Like [`shutdown`](Self::shutdown), but stop waiting for workers stuck
    /// in a handler after `timeout`. Their deliveries stay leased and are
    /// redelivered once the lease runs out.
    pub fn shutdown_timeout(self, timeout: Duration) -> WorkerStats {
        self.transport.close();
        self.workers.stop_timeout(timeout)
    }
}

impl<C: EventCodec + Clone + 'static> EventSink for EventBus<C> {
    fn publish(&self, event: Event) -> Result<PublishReceipt, PublishError> {
        EventBus::publish(self, event)
    }
}
