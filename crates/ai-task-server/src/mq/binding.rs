use anyhow::Context;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::broker::{
    Broker, BrokerError, DeadLetterSpec, ExchangeKind, ExchangeSpec, MessageProperties, QueueSpec,
};
use crate::utils::metrics::Metrics;

/// Body of a queue consumer. An `Err` (or a panic) is a handling failure and
/// goes through the dispatcher's requeue / dead-letter policy.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, body: &[u8], properties: &MessageProperties) -> anyhow::Result<()>;
}

pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Vec<u8>, MessageProperties) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, body: &[u8], properties: &MessageProperties) -> anyhow::Result<()> {
        (self.f)(body.to_vec(), properties.clone()).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Vec<u8>, MessageProperties) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Decode a UTF-8 JSON body
pub fn decode_json<T: DeserializeOwned>(body: &[u8]) -> anyhow::Result<T> {
    let text = std::str::from_utf8(body).context("message body is not valid UTF-8")?;
    serde_json::from_str(text).context("malformed JSON message body")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Consumer,
    Producer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub exchange: String,
    /// None for producers
    pub queue: Option<String>,
    pub routing_key: String,
    pub kind: BindingKind,
}

/// Publish target returned by [`BindingRegistry::register_producer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Producer {
    pub exchange: String,
    pub routing_key: String,
}

impl Producer {
    pub fn encode<T: Serialize + ?Sized>(&self, payload: &T) -> Result<Vec<u8>, BrokerError> {
        Ok(serde_json::to_vec(payload)?)
    }
}

/// Topology and handler table, assembled once at startup and read-only after.
pub struct BindingRegistry {
    exchange_kind: ExchangeKind,
    dead_letter_suffix: String,
    bindings: Vec<Binding>,
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl BindingRegistry {
    pub fn new(exchange_kind: ExchangeKind, dead_letter_suffix: impl Into<String>) -> Self {
        Self {
            exchange_kind,
            dead_letter_suffix: dead_letter_suffix.into(),
            bindings: Vec::new(),
            handlers: HashMap::new(),
        }
    }

    /// Returns false when the identical binding was already registered; the
    /// first handler is kept.
    pub fn register_consumer(
        &mut self,
        exchange: &str,
        queue: &str,
        routing_key: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> bool {
        let binding = Binding {
            exchange: exchange.to_string(),
            queue: Some(queue.to_string()),
            routing_key: routing_key.to_string(),
            kind: BindingKind::Consumer,
        };

        if self.bindings.contains(&binding) {
            debug!(exchange, queue, routing_key, "Consumer binding already registered");
            return false;
        }

        if self.handlers.contains_key(queue) {
            warn!(queue, "Queue already has a handler, keeping the first one");
        } else {
            self.handlers.insert(queue.to_string(), handler);
        }

        info!(exchange, queue, routing_key, "📥 Registered consumer");
        self.bindings.push(binding);
        true
    }

    pub fn register_producer(&mut self, exchange: &str, routing_key: &str) -> Producer {
        let binding = Binding {
            exchange: exchange.to_string(),
            queue: None,
            routing_key: routing_key.to_string(),
            kind: BindingKind::Producer,
        };

        if !self.bindings.contains(&binding) {
            info!(exchange, routing_key, "📤 Registered producer");
            self.bindings.push(binding);
        }

        Producer {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        }
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn handler_for(&self, queue: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(queue).cloned()
    }

    /// Distinct consumer queues in registration order
    pub fn consumer_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = Vec::new();
        for binding in &self.bindings {
            if let Some(queue) = &binding.queue {
                if !queues.contains(queue) {
                    queues.push(queue.clone());
                }
            }
        }
        queues
    }

    pub fn dead_letter_exchange(&self, exchange: &str) -> String {
        format!("{}{}", exchange, self.dead_letter_suffix)
    }

    pub fn dead_letter_queue(&self, queue: &str) -> String {
        format!("{}{}", queue, self.dead_letter_suffix)
    }

    /// Declare every exchange, queue and binding. Safe to run again on an
    /// existing identical topology, which is what happens on reconnect.
    pub async fn declare_topology(&self, broker: &dyn Broker) -> Result<(), BrokerError> {
        let mut exchanges: Vec<&str> = Vec::new();
        for binding in &self.bindings {
            if !exchanges.contains(&binding.exchange.as_str()) {
                exchanges.push(&binding.exchange);
            }
        }

        for exchange in &exchanges {
            broker
                .declare_exchange(&ExchangeSpec {
                    name: exchange.to_string(),
                    kind: self.exchange_kind,
                })
                .await?;
        }

        for binding in &self.bindings {
            let Some(queue) = &binding.queue else {
                continue;
            };

            let dlx = self.dead_letter_exchange(&binding.exchange);
            let dlq = self.dead_letter_queue(queue);

            broker
                .declare_exchange(&ExchangeSpec {
                    name: dlx.clone(),
                    kind: ExchangeKind::Direct,
                })
                .await?;
            broker
                .declare_queue(&QueueSpec {
                    name: dlq.clone(),
                    durable: true,
                    dead_letter: None,
                })
                .await?;
            broker.bind_queue(&dlq, &dlx, queue).await?;

            broker
                .declare_queue(&QueueSpec {
                    name: queue.clone(),
                    durable: true,
                    dead_letter: Some(DeadLetterSpec {
                        exchange: dlx,
                        routing_key: queue.clone(),
                    }),
                })
                .await?;
            broker
                .bind_queue(queue, &binding.exchange, &binding.routing_key)
                .await?;

            debug!(
                exchange = %binding.exchange,
                queue = %queue,
                routing_key = %binding.routing_key,
                "Binding declared"
            );
        }

        info!(
            exchanges = exchanges.len(),
            bindings = self.bindings.len(),
            "✅ Topology declared"
        );
        Ok(())
    }
}

/// The broker currently in use, swapped by the connection manager on reconnect.
pub type BrokerSlot = Arc<RwLock<Option<Arc<dyn Broker>>>>;

/// Cloneable publish handle for producers
#[derive(Clone)]
pub struct MessagePublisher {
    slot: BrokerSlot,
    metrics: Metrics,
}

impl MessagePublisher {
    pub fn new(metrics: Metrics) -> Self {
        Self {
            slot: Arc::new(RwLock::new(None)),
            metrics,
        }
    }

    pub fn set_broker(&self, broker: Option<Arc<dyn Broker>>) {
        *self.slot.write() = broker;
    }

    pub fn is_connected(&self) -> bool {
        self.slot
            .read()
            .as_ref()
            .map(|broker| broker.is_connected())
            .unwrap_or(false)
    }

    /// Encode `payload` and send it; returns the bytes that went out.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        producer: &Producer,
        payload: &T,
    ) -> Result<Vec<u8>, BrokerError> {
        let body = producer.encode(payload)?;

        let broker = self.slot.read().clone().ok_or(BrokerError::NotConnected)?;
        if !broker.is_connected() {
            return Err(BrokerError::NotConnected);
        }

        let message_id = Uuid::new_v4().to_string();
        let properties = MessageProperties::json().with_message_id(message_id.clone());

        broker
            .publish(&producer.exchange, &producer.routing_key, &body, &properties)
            .await?;
        self.metrics.increment_published();

        debug!(
            exchange = %producer.exchange,
            routing_key = %producer.routing_key,
            message_id = %message_id,
            bytes = body.len(),
            "Message published"
        );
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mq::memory::MemoryBroker;
    use crate::mq::BrokerConnector;
    use serde::Deserialize;

    fn noop() -> Arc<dyn MessageHandler> {
        handler_fn(|_, _| async { Ok(()) })
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Task {
        id: u32,
    }

    #[test]
    fn test_decode_json() {
        assert_eq!(decode_json::<Task>(br#"{"id":7}"#).unwrap(), Task { id: 7 });
        assert!(decode_json::<Task>(b"{not json").is_err());
        assert!(decode_json::<Task>(&[0xff, 0xfe]).is_err());
        assert!(decode_json::<Task>(br#"{"other":1}"#).is_err());
    }

    #[test]
    fn test_duplicate_consumer_is_noop() {
        let mut registry = BindingRegistry::new(ExchangeKind::Topic, ".dead-letter");
        assert!(registry.register_consumer("ai", "q", "to-review", noop()));
        assert!(!registry.register_consumer("ai", "q", "to-review", noop()));

        assert_eq!(registry.bindings().len(), 1);
        assert_eq!(registry.consumer_queues(), vec!["q".to_string()]);
        assert!(registry.handler_for("q").is_some());
        assert!(registry.handler_for("other").is_none());
    }

    #[test]
    fn test_producer_encodes_json() {
        let mut registry = BindingRegistry::new(ExchangeKind::Topic, ".dead-letter");
        let producer = registry.register_producer("ai", "reviewed");
        registry.register_producer("ai", "reviewed");

        assert_eq!(registry.bindings().len(), 1);
        assert_eq!(registry.bindings()[0].kind, BindingKind::Producer);
        assert_eq!(
            producer.encode(&serde_json::json!({"ok": true})).unwrap(),
            br#"{"ok":true}"#.to_vec()
        );
    }

    #[tokio::test]
    async fn test_declare_topology_twice_yields_single_topology() {
        let mut registry = BindingRegistry::new(ExchangeKind::Topic, ".dead-letter");
        registry.register_consumer("ai", "to-review-queue", "to-review", noop());
        registry.register_producer("ai", "reviewed");

        let memory = MemoryBroker::new();
        let broker = memory.connect().await.unwrap();
        registry.declare_topology(broker.as_ref()).await.unwrap();
        registry.declare_topology(broker.as_ref()).await.unwrap();

        // ai, ai.dead-letter
        assert_eq!(memory.exchange_count(), 2);
        // to-review-queue, to-review-queue.dead-letter
        assert_eq!(memory.queue_count(), 2);
        assert_eq!(memory.binding_count(), 2);
        assert!(memory.has_binding("ai", "to-review-queue", "to-review"));
        assert!(memory.has_binding(
            "ai.dead-letter",
            "to-review-queue.dead-letter",
            "to-review-queue"
        ));
    }

    #[tokio::test]
    async fn test_publisher_requires_connection() {
        let publisher = MessagePublisher::new(Metrics::new());
        let producer = Producer {
            exchange: "ai".to_string(),
            routing_key: "reviewed".to_string(),
        };

        let err = publisher.publish(&producer, &"hello").await.unwrap_err();
        assert!(matches!(err, BrokerError::NotConnected));
    }

    #[tokio::test]
    async fn test_publisher_sends_to_bound_queue() {
        let mut registry = BindingRegistry::new(ExchangeKind::Topic, ".dead-letter");
        registry.register_consumer("ai", "results", "reviewed", noop());
        let producer = registry.register_producer("ai", "reviewed");

        let memory = MemoryBroker::new();
        let broker = memory.connect().await.unwrap();
        registry.declare_topology(broker.as_ref()).await.unwrap();

        let metrics = Metrics::new();
        let publisher = MessagePublisher::new(metrics.clone());
        publisher.set_broker(Some(broker));
        assert!(publisher.is_connected());

        let sent = publisher
            .publish(&producer, &serde_json::json!({"task_id": "t1"}))
            .await
            .unwrap();

        assert_eq!(memory.drain("results"), vec![sent]);
        assert_eq!(metrics.snapshot().messages_published, 1);
    }
}
