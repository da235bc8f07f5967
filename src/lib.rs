mod bus;
mod codec;
mod config;
mod dispatcher;
mod envelope;
mod event;
mod orders;
mod publisher;
mod transport;
mod worker;

pub use bus::{BusError, EventBus};
pub use codec::{CodecError, EventCodec, EventRegistry, JsonCodec, PayloadUpcaster};
pub use config::{BusConfig, ConfigError, TransportConfig};
pub use dispatcher::{
    Backoff, DeadLetterAlert, Dispatcher, DispatcherBuilder, Handler, HandlerError, RetryPolicy,
    RouteOutcome,
};
pub use envelope::{Delivery, DeliveryTag, Envelope, EnvelopeRecord, Lease};
pub use event::{
    Event, EventId, EventKind, EventPayload, OrderCreated, OrderId, OrderLine, OrderStatus,
    OrderStatusUpdated, UserId,
};
pub use orders::{InMemoryOrderStore, Order, OrderError, OrderPage, OrderService, OrderStore};
pub use publisher::{EventSink, PublishError, PublishReceipt, Publisher, PublisherOptions};
pub use transport::{
    AnyTransport, DeadLetter, DeadLetterQueue, Deliveries, DeliveryGuarantee, FileJournal,
    InMemoryTransport, Journal, JournalEntry, LogTransport, NoJournal, QueueTransport, Transport,
    TransportError, TransportOptions, DEFAULT_COMPACT_THRESHOLD,
};
pub use worker::{WorkerHandle, WorkerOptions, WorkerPool, WorkerStats};
