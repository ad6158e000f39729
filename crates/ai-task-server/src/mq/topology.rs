use std::sync::Arc;

use super::binding::{BindingRegistry, MessagePublisher};
use super::broker::ExchangeKind;
use super::consumers::ReviewConsumer;
use super::producers::Producers;
use crate::config::{BrokerConfig, TasksConfig};
use crate::services::gemini::ModelClient;
use crate::services::object_store::ObjectStore;
use crate::utils::error::ConfigurationError;

/// Every consumer and producer the process runs with.
pub fn build_registry(
    broker: &BrokerConfig,
    tasks: &TasksConfig,
    store: Arc<dyn ObjectStore>,
    model: Arc<dyn ModelClient>,
    publisher: MessagePublisher,
) -> Result<(BindingRegistry, Producers), ConfigurationError> {
    let exchange_kind: ExchangeKind = broker
        .exchange_kind
        .parse()
        .map_err(|e| ConfigurationError::Invalid(format!("broker.exchange_kind: {}", e)))?;

    let mut registry = BindingRegistry::new(exchange_kind, broker.dead_letter_suffix.clone());
    let producers = Producers::register(&mut registry, tasks);

    let review = ReviewConsumer::new(
        store,
        model,
        publisher,
        producers.review_results.clone(),
        tasks,
    );
    registry.register_consumer(
        &tasks.exchange,
        &tasks.review_queue,
        &tasks.review_routing_key,
        Arc::new(review),
    );

    Ok((registry, producers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mq::BindingKind;
    use crate::services::gemini::MockModelClient;
    use crate::services::object_store::MockObjectStore;
    use crate::utils::metrics::Metrics;

    #[test]
    fn test_default_topology() {
        let (registry, producers) = build_registry(
            &BrokerConfig::default(),
            &TasksConfig::default(),
            Arc::new(MockObjectStore::new()),
            Arc::new(MockModelClient::new()),
            MessagePublisher::new(Metrics::new()),
        )
        .unwrap();

        assert_eq!(registry.consumer_queues(), vec!["to-review-queue".to_string()]);
        assert!(registry.handler_for("to-review-queue").is_some());
        assert_eq!(producers.review_requests.routing_key, "to-review");
        assert_eq!(producers.review_results.routing_key, "reviewed");
        assert_eq!(
            registry
                .bindings()
                .iter()
                .filter(|b| b.kind == BindingKind::Producer)
                .count(),
            2
        );
    }

    #[test]
    fn test_unknown_exchange_kind_is_configuration_error() {
        let broker = BrokerConfig {
            exchange_kind: "headers".to_string(),
            ..BrokerConfig::default()
        };

        let result = build_registry(
            &broker,
            &TasksConfig::default(),
            Arc::new(MockObjectStore::new()),
            Arc::new(MockModelClient::new()),
            MessagePublisher::new(Metrics::new()),
        );
        assert!(matches!(result, Err(ConfigurationError::Invalid(_))));
    }
}
