use async_trait::async_trait;
use futures::stream::Stream;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Broker connection error: {0}")]
    Connection(String),

    #[error("Topology declaration failed: {0}")]
    Topology(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Broker not connected")]
    NotConnected,

    #[error("Payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

impl std::str::FromStr for ExchangeKind {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            other => Err(BrokerError::Topology(format!("unsupported exchange kind: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeadLetterSpec {
    pub exchange: String,
    pub routing_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub dead_letter: Option<DeadLetterSpec>,
}

/// The subset of AMQP basic properties handlers care about
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
}

impl MessageProperties {
    pub fn json() -> Self {
        Self {
            content_type: Some("application/json".to_string()),
            ..Self::default()
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// Settles one delivery. Exactly one of `ack`/`nack` is called per delivery.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    /// `requeue = false` hands the message to the queue's dead-letter exchange
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

pub struct Delivery {
    pub queue: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub acker: Box<dyn DeliveryAcker>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("routing_key", &self.routing_key)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .field("properties", &self.properties)
            .finish()
    }
}

pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// One live broker connection. Declarations are idempotent.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<(), BrokerError>;

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;

    fn is_connected(&self) -> bool;
}

/// Opens connections; called once at startup and again for every reconnect
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError>;

    /// Redacted description for logs
    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_kind_parsing() {
        assert_eq!("topic".parse::<ExchangeKind>().unwrap(), ExchangeKind::Topic);
        assert_eq!("Direct".parse::<ExchangeKind>().unwrap(), ExchangeKind::Direct);
        assert_eq!("fanout".parse::<ExchangeKind>().unwrap(), ExchangeKind::Fanout);
        assert!("headers".parse::<ExchangeKind>().is_err());
    }
}
