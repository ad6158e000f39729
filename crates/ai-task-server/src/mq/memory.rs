//! In-process broker with AMQP-like semantics.
//!
//! Selected with a `memory://` broker URL. Supports direct, fanout and topic
//! exchanges, idempotent declarations, requeue with the redelivered flag and
//! dead-letter routing on `nack(requeue = false)`.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

use super::broker::{
    Broker, BrokerConnector, BrokerError, Delivery, DeliveryAcker, DeliveryStream, ExchangeKind,
    ExchangeSpec, MessageProperties, QueueSpec,
};

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    state: Mutex<MemoryState>,
    connected: AtomicBool,
    available: AtomicBool,
    connects: AtomicUsize,
    next_tag: AtomicU64,
}

impl Default for MemoryInner {
    fn default() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            connected: AtomicBool::new(false),
            available: AtomicBool::new(true),
            connects: AtomicUsize::new(0),
            next_tag: AtomicU64::new(1),
        }
    }
}

#[derive(Default)]
struct MemoryState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, MemoryQueue>,
    /// (exchange, queue, routing key)
    bindings: HashSet<(String, String, String)>,
}

struct MemoryQueue {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    notify: Arc<Notify>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    body: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse new connections while `available` is false.
    /// Existing connections stay up; pair with `disconnect` for an outage.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Simulate a dropped connection; open consumer streams end with an error
    pub fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.wake_all();
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn exchange_count(&self) -> usize {
        self.inner.state.lock().exchanges.len()
    }

    pub fn queue_count(&self) -> usize {
        self.inner.state.lock().queues.len()
    }

    pub fn binding_count(&self) -> usize {
        self.inner.state.lock().bindings.len()
    }

    pub fn has_binding(&self, exchange: &str, queue: &str, routing_key: &str) -> bool {
        self.inner.state.lock().bindings.contains(&(
            exchange.to_string(),
            queue.to_string(),
            routing_key.to_string(),
        ))
    }

    /// Ready (not yet delivered) messages in `queue`
    pub fn message_count(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Remove and return the ready message bodies of `queue`
    pub fn drain(&self, queue: &str) -> Vec<Vec<u8>> {
        let mut state = self.inner.state.lock();
        state
            .queues
            .get_mut(queue)
            .map(|q| q.ready.drain(..).map(|m| m.body).collect())
            .unwrap_or_default()
    }

    fn wake_all(&self) {
        let state = self.inner.state.lock();
        for queue in state.queues.values() {
            queue.notify.notify_waiters();
            queue.notify.notify_one();
        }
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.inner.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }
}

impl MemoryInner {
    fn route(
        &self,
        exchange: &str,
        routing_key: &str,
        message: StoredMessage,
    ) -> Result<usize, BrokerError> {
        let mut state = self.state.lock();

        let kind = *state
            .exchanges
            .get(exchange)
            .ok_or_else(|| BrokerError::Publish(format!("no exchange '{}'", exchange)))?;

        let targets: HashSet<String> = state
            .bindings
            .iter()
            .filter(|(ex, _, key)| ex == exchange && binding_matches(kind, key, routing_key))
            .map(|(_, queue, _)| queue.clone())
            .collect();

        for name in &targets {
            if let Some(queue) = state.queues.get_mut(name) {
                queue.ready.push_back(message.clone());
                queue.notify.notify_one();
            }
        }

        Ok(targets.len())
    }

    fn requeue(&self, queue: &str, mut message: StoredMessage) {
        message.redelivered = true;
        let mut state = self.state.lock();
        if let Some(q) = state.queues.get_mut(queue) {
            q.ready.push_front(message);
            q.notify.notify_one();
        }
    }

    fn dead_letter(&self, queue: &str, mut message: StoredMessage) {
        let target = {
            let state = self.state.lock();
            state
                .queues
                .get(queue)
                .and_then(|q| q.spec.dead_letter.clone())
        };

        match target {
            Some(dl) => {
                message.redelivered = false;
                message.routing_key = dl.routing_key.clone();
                if let Err(e) = self.route(&dl.exchange, &dl.routing_key, message) {
                    debug!(queue, "Dead-letter routing failed, message dropped: {}", e);
                }
            }
            None => debug!(queue, "No dead-letter exchange, message dropped"),
        }
    }
}

fn binding_matches(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Fanout => true,
        ExchangeKind::Topic => topic_matches(binding_key, routing_key),
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more words
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn go(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                go(&pattern[1..], key) || (!key.is_empty() && go(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => go(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => go(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    go(&pattern, &key)
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        let mut state = self.inner.state.lock();

        match state.exchanges.get(&exchange.name) {
            Some(kind) if *kind != exchange.kind => Err(BrokerError::Topology(format!(
                "exchange '{}' already declared as {:?}",
                exchange.name, kind
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(exchange.name.clone(), exchange.kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        let mut state = self.inner.state.lock();

        match state.queues.get(&queue.name) {
            Some(existing) if existing.spec != *queue => Err(BrokerError::Topology(format!(
                "queue '{}' already declared with different arguments",
                queue.name
            ))),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    queue.name.clone(),
                    MemoryQueue {
                        spec: queue.clone(),
                        ready: VecDeque::new(),
                        notify: Arc::new(Notify::new()),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        let mut state = self.inner.state.lock();

        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::Topology(format!("no exchange '{}'", exchange)));
        }
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Topology(format!("no queue '{}'", queue)));
        }

        state.bindings.insert((
            exchange.to_string(),
            queue.to_string(),
            routing_key.to_string(),
        ));
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        _prefetch: u16,
    ) -> Result<DeliveryStream, BrokerError> {
        self.ensure_connected()?;

        let notify = {
            let state = self.inner.state.lock();
            state
                .queues
                .get(queue)
                .map(|q| q.notify.clone())
                .ok_or_else(|| BrokerError::Topology(format!("no queue '{}'", queue)))?
        };

        debug!(queue, consumer_tag, "Memory consumer started");

        let inner = self.inner.clone();
        let queue = queue.to_string();

        let stream = async_stream::stream! {
            loop {
                if !inner.connected.load(Ordering::SeqCst) {
                    yield Err(BrokerError::Connection("connection closed".to_string()));
                    break;
                }

                let next = {
                    let mut state = inner.state.lock();
                    state.queues.get_mut(&queue).and_then(|q| q.ready.pop_front())
                };

                match next {
                    Some(message) => {
                        let delivery_tag = inner.next_tag.fetch_add(1, Ordering::SeqCst);
                        yield Ok(Delivery {
                            queue: queue.clone(),
                            routing_key: message.routing_key.clone(),
                            delivery_tag,
                            redelivered: message.redelivered,
                            body: message.body.clone(),
                            properties: message.properties.clone(),
                            acker: Box::new(MemoryAcker {
                                inner: inner.clone(),
                                queue: queue.clone(),
                                message: Mutex::new(Some(message)),
                            }),
                        });
                    }
                    None => notify.notified().await,
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BrokerError> {
        self.ensure_connected()?;

        let routed = self.inner.route(
            exchange,
            routing_key,
            StoredMessage {
                routing_key: routing_key.to_string(),
                body: payload.to_vec(),
                properties: properties.clone(),
                redelivered: false,
            },
        )?;

        if routed == 0 {
            debug!(exchange, routing_key, "Message unroutable, dropped");
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.disconnect();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("memory broker unavailable".to_string()));
        }

        self.inner.connected.store(true, Ordering::SeqCst);
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.clone()))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

struct MemoryAcker {
    inner: Arc<MemoryInner>,
    queue: String,
    message: Mutex<Option<StoredMessage>>,
}

impl MemoryAcker {
    fn take(&self) -> Result<StoredMessage, BrokerError> {
        self.message
            .lock()
            .take()
            .ok_or_else(|| BrokerError::Ack("delivery already settled".to_string()))
    }

    /// Like AMQP, unsettled messages go back to the queue when the channel is gone
    fn check_channel(&self, message: StoredMessage) -> Result<StoredMessage, BrokerError> {
        if self.inner.connected.load(Ordering::SeqCst) {
            Ok(message)
        } else {
            self.inner.requeue(&self.queue, message);
            Err(BrokerError::Ack("channel closed".to_string()))
        }
    }
}

/// Dropped without ack/nack (aborted handler): back to the queue
impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if let Some(message) = self.message.get_mut().take() {
            self.inner.requeue(&self.queue, message);
        }
    }
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        let message = self.take()?;
        self.check_channel(message)?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        let message = self.check_channel(self.take()?)?;
        if requeue {
            self.inner.requeue(&self.queue, message);
        } else {
            self.inner.dead_letter(&self.queue, message);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mq::broker::DeadLetterSpec;
    use futures::StreamExt;

    async fn connected() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.connect().await.unwrap();
        broker
    }

    fn exchange(name: &str, kind: ExchangeKind) -> ExchangeSpec {
        ExchangeSpec {
            name: name.to_string(),
            kind,
        }
    }

    fn queue(name: &str) -> QueueSpec {
        QueueSpec {
            name: name.to_string(),
            durable: true,
            dead_letter: None,
        }
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("to-review", "to-review"));
        assert!(topic_matches("docs.*", "docs.pdf"));
        assert!(!topic_matches("docs.*", "docs.pdf.large"));
        assert!(topic_matches("docs.#", "docs.pdf.large"));
        assert!(topic_matches("docs.#", "docs"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.pdf", "docs.pdf"));
        assert!(!topic_matches("*.pdf", "pdf"));
        assert!(!topic_matches("docs.pdf", "docs.txt"));
    }

    #[tokio::test]
    async fn test_declarations_are_idempotent() {
        let broker = connected().await;

        for _ in 0..2 {
            broker.declare_exchange(&exchange("ai", ExchangeKind::Topic)).await.unwrap();
            broker.declare_queue(&queue("q")).await.unwrap();
            broker.bind_queue("q", "ai", "to-review").await.unwrap();
        }

        assert_eq!(broker.exchange_count(), 1);
        assert_eq!(broker.queue_count(), 1);
        assert_eq!(broker.binding_count(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_redeclaration_fails() {
        let broker = connected().await;
        broker.declare_exchange(&exchange("ai", ExchangeKind::Topic)).await.unwrap();
        assert!(broker
            .declare_exchange(&exchange("ai", ExchangeKind::Direct))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let broker = MemoryBroker::new();
        assert!(matches!(
            broker.declare_queue(&queue("q")).await,
            Err(BrokerError::NotConnected)
        ));

        broker.set_available(false);
        assert!(broker.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_publish_consume_and_requeue() {
        let broker = connected().await;
        broker.declare_exchange(&exchange("ai", ExchangeKind::Topic)).await.unwrap();
        broker.declare_queue(&queue("q")).await.unwrap();
        broker.bind_queue("q", "ai", "to-review").await.unwrap();

        broker
            .publish("ai", "to-review", b"{}", &MessageProperties::json())
            .await
            .unwrap();
        broker
            .publish("ai", "elsewhere", b"{}", &MessageProperties::json())
            .await
            .unwrap();
        assert_eq!(broker.message_count("q"), 1);

        let mut stream = broker.consume("q", "test", 1).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        assert_eq!(first.properties.content_type.as_deref(), Some("application/json"));
        first.acker.nack(true).await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        second.acker.ack().await.unwrap();
        assert!(second.acker.ack().await.is_err());
        assert_eq!(broker.message_count("q"), 0);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_dead_letters() {
        let broker = connected().await;
        broker.declare_exchange(&exchange("ai", ExchangeKind::Topic)).await.unwrap();
        broker.declare_exchange(&exchange("ai.dlx", ExchangeKind::Direct)).await.unwrap();
        broker.declare_queue(&queue("q.dead")).await.unwrap();
        broker.bind_queue("q.dead", "ai.dlx", "q").await.unwrap();
        broker
            .declare_queue(&QueueSpec {
                name: "q".to_string(),
                durable: true,
                dead_letter: Some(DeadLetterSpec {
                    exchange: "ai.dlx".to_string(),
                    routing_key: "q".to_string(),
                }),
            })
            .await
            .unwrap();
        broker.bind_queue("q", "ai", "to-review").await.unwrap();

        broker
            .publish("ai", "to-review", b"poison", &MessageProperties::default())
            .await
            .unwrap();

        let mut stream = broker.consume("q", "test", 1).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        delivery.acker.nack(false).await.unwrap();

        assert_eq!(broker.message_count("q"), 0);
        assert_eq!(broker.drain("q.dead"), vec![b"poison".to_vec()]);
    }

    #[tokio::test]
    async fn test_disconnect_ends_stream_with_error() {
        let broker = connected().await;
        broker.declare_queue(&queue("q")).await.unwrap();
        let mut stream = broker.consume("q", "test", 1).await.unwrap();

        let waiter = tokio::spawn(async move { stream.next().await });
        tokio::task::yield_now().await;
        broker.disconnect();

        let item = waiter.await.unwrap();
        assert!(matches!(item, Some(Err(BrokerError::Connection(_)))));
    }
}
