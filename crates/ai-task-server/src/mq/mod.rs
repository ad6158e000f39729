//! Message-queue binding and dispatch.
//!
//! `BindingRegistry` is built once at startup, `ConnectionManager` declares
//! its topology and feeds deliveries to the `Dispatcher`, which applies the
//! ack / requeue / dead-letter policy.

pub mod amqp;
pub mod binding;
pub mod broker;
pub mod connection;
pub mod consumers;
pub mod dispatcher;
pub mod memory;
pub mod producers;
pub mod topology;

use std::sync::Arc;

pub use amqp::AmqpConnector;
pub use binding::{
    decode_json, handler_fn, Binding, BindingKind, BindingRegistry, BrokerSlot, MessageHandler,
    MessagePublisher, Producer,
};
pub use broker::{
    Broker, BrokerConnector, BrokerError, Delivery, DeliveryAcker, DeliveryStream, ExchangeKind,
    MessageProperties,
};
pub use connection::{BrokerHealth, ConnectionManager, ConnectionOptions};
pub use consumers::{ReviewConsumer, ReviewTask};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use memory::MemoryBroker;
pub use producers::{Producers, ReviewResult};
pub use topology::build_registry;

/// `memory://` selects the in-process broker, anything else is AMQP
pub fn connector_for_url(url: &str, connection_name: &str) -> Arc<dyn BrokerConnector> {
    if url.starts_with("memory://") {
        Arc::new(MemoryBroker::new())
    } else {
        Arc::new(AmqpConnector::new(url, connection_name))
    }
}
