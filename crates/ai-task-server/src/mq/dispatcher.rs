use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::binding::BindingRegistry;
use super::broker::{BrokerError, Delivery};
use crate::utils::metrics::{Metrics, Timer};

/// Terminal state of one delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Acked,
    Requeued,
    DeadLettered,
}

/// One automatic re-attempt: a fresh delivery is requeued, a redelivered one
/// goes to the dead-letter exchange.
pub fn failure_policy(redelivered: bool) -> DispatchOutcome {
    if redelivered {
        DispatchOutcome::DeadLettered
    } else {
        DispatchOutcome::Requeued
    }
}

/// Resolves the handler for a delivery's queue, runs it and settles the
/// delivery. Handler errors and panics stay inside the delivery they came from.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<BindingRegistry>,
    metrics: Metrics,
}

impl Dispatcher {
    pub fn new(registry: Arc<BindingRegistry>, metrics: Metrics) -> Self {
        Self { registry, metrics }
    }

    pub fn registry(&self) -> &Arc<BindingRegistry> {
        &self.registry
    }

    /// `Err` only when the broker rejected the ack/nack itself.
    pub async fn dispatch(&self, delivery: Delivery) -> Result<DispatchOutcome, BrokerError> {
        let Delivery {
            queue,
            delivery_tag,
            redelivered,
            body,
            properties,
            acker,
            ..
        } = delivery;

        let outcome = match self.registry.handler_for(&queue) {
            None => {
                error!(queue = %queue, delivery_tag, "No handler bound to queue");
                failure_policy(redelivered)
            }
            Some(handler) => {
                let timer = Timer::new();
                let result = AssertUnwindSafe(handler.handle(&body, &properties))
                    .catch_unwind()
                    .await;
                self.metrics.add_handler_time(timer.elapsed());

                match result {
                    Ok(Ok(())) => DispatchOutcome::Acked,
                    Ok(Err(e)) => {
                        warn!(
                            queue = %queue,
                            delivery_tag,
                            redelivered,
                            "Message handling failed: {:#}",
                            e
                        );
                        failure_policy(redelivered)
                    }
                    Err(panic) => {
                        error!(
                            queue = %queue,
                            delivery_tag,
                            redelivered,
                            "Message handler panicked: {}",
                            panic_message(panic.as_ref())
                        );
                        failure_policy(redelivered)
                    }
                }
            }
        };

        match outcome {
            DispatchOutcome::Acked => {
                acker.ack().await?;
                self.metrics.increment_acked();
                debug!(queue = %queue, delivery_tag, "Message acked");
            }
            DispatchOutcome::Requeued => {
                acker.nack(true).await?;
                self.metrics.increment_requeued();
                debug!(queue = %queue, delivery_tag, "Message requeued for one retry");
            }
            DispatchOutcome::DeadLettered => {
                acker.nack(false).await?;
                self.metrics.increment_dead_lettered();
                warn!(queue = %queue, delivery_tag, "☠️ Message dead-lettered after retry");
            }
        }

        Ok(outcome)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
