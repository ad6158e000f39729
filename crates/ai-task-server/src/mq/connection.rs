use futures::stream::{self, BoxStream, SelectAll, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::binding::{BindingRegistry, MessagePublisher};
use super::broker::{Broker, BrokerConnector, BrokerError, Delivery, DeliveryStream};
use super::dispatcher::Dispatcher;
use crate::config::{BrokerConfig, ReconnectConfig};
use crate::utils::metrics::Metrics;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BrokerHealth {
    Starting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Reconnect attempts exhausted; the process should stop
    Failed { reason: String },
    Stopped,
}

impl BrokerHealth {
    pub fn is_connected(&self) -> bool {
        matches!(self, BrokerHealth::Connected)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub connection_name: String,
    pub prefetch: u16,
    pub shutdown_grace: Duration,
    pub probe_interval: Duration,
    pub reconnect: ReconnectConfig,
}

impl From<&BrokerConfig> for ConnectionOptions {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            connection_name: config.connection_name.clone(),
            prefetch: config.prefetch,
            shutdown_grace: Duration::from_secs(config.shutdown_grace_seconds),
            probe_interval: Duration::from_secs(config.probe_interval_seconds.max(1)),
            reconnect: config.reconnect.clone(),
        }
    }
}

/// Doubling delay for reconnect attempt `attempt` (1-based), capped at `max_delay_ms`
pub fn backoff_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let delay = config.initial_delay_ms.saturating_mul(1u64 << exponent);
    Duration::from_millis(delay.min(config.max_delay_ms))
}

/// Owns the broker connection: declares topology, feeds deliveries to the
/// dispatcher, reconnects with backoff and drains on shutdown.
pub struct ConnectionManager {
    health: Arc<watch::Sender<BrokerHealth>>,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    publisher: MessagePublisher,
}

impl ConnectionManager {
    /// Connect, declare every registered binding and start consuming. Any
    /// failure here is a startup failure.
    pub async fn initialize(
        connector: Arc<dyn BrokerConnector>,
        registry: Arc<BindingRegistry>,
        publisher: MessagePublisher,
        metrics: Metrics,
        options: ConnectionOptions,
    ) -> Result<Self, BrokerError> {
        let (health, _) = watch::channel(BrokerHealth::Starting);
        let health = Arc::new(health);
        let (shutdown, shutdown_rx) = watch::channel(false);

        info!("🔌 Connecting to broker at {}", connector.describe());

        let supervisor = Supervisor {
            connector,
            dispatcher: Dispatcher::new(registry.clone(), metrics),
            registry,
            publisher: publisher.clone(),
            semaphore: Arc::new(Semaphore::new(usize::from(options.prefetch.max(1)))),
            options,
            health: health.clone(),
        };

        let (broker, streams) = supervisor.establish().await?;
        health.send_replace(BrokerHealth::Connected);
        info!(
            queues = streams.len(),
            "✅ Broker connected, consumers started"
        );

        let handle = tokio::spawn(supervisor.run(broker, streams, shutdown_rx));

        Ok(Self {
            health,
            shutdown,
            supervisor: Mutex::new(Some(handle)),
            publisher,
        })
    }

    pub fn health(&self) -> BrokerHealth {
        self.health.borrow().clone()
    }

    pub fn health_receiver(&self) -> watch::Receiver<BrokerHealth> {
        self.health.subscribe()
    }

    pub fn publisher(&self) -> MessagePublisher {
        self.publisher.clone()
    }

    /// Stop consuming, drain in-flight handlers within the grace period, then
    /// close the connection. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);

        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            info!("🛑 Stopping broker consumers");
            if let Err(e) = handle.await {
                error!("Broker supervisor task failed: {}", e);
            }
        }

        self.health.send_replace(BrokerHealth::Stopped);
        info!("Broker connection closed");
    }
}

enum ServeExit {
    Shutdown,
    ConnectionLost(String),
}

enum Reconnect {
    Established(Arc<dyn Broker>, Vec<DeliveryStream>),
    Shutdown,
    Exhausted,
}

struct Supervisor {
    connector: Arc<dyn BrokerConnector>,
    registry: Arc<BindingRegistry>,
    dispatcher: Dispatcher,
    publisher: MessagePublisher,
    semaphore: Arc<Semaphore>,
    options: ConnectionOptions,
    health: Arc<watch::Sender<BrokerHealth>>,
}

impl Supervisor {
    /// Open a connection, declare topology and start one consumer per queue
    async fn establish(&self) -> Result<(Arc<dyn Broker>, Vec<DeliveryStream>), BrokerError> {
        let broker = self.connector.connect().await?;

        match self.start_consumers(broker.as_ref()).await {
            Ok(streams) => {
                self.publisher.set_broker(Some(broker.clone()));
                Ok((broker, streams))
            }
            Err(e) => {
                if let Err(close_err) = broker.close().await {
                    debug!("Close after failed setup: {}", close_err);
                }
                Err(e)
            }
        }
    }

    async fn start_consumers(
        &self,
        broker: &dyn Broker,
    ) -> Result<Vec<DeliveryStream>, BrokerError> {
        self.registry.declare_topology(broker).await?;

        let mut streams = Vec::new();
        for queue in self.registry.consumer_queues() {
            let consumer_tag = format!("{}-{}", self.options.connection_name, queue);
            let stream = broker
                .consume(&queue, &consumer_tag, self.options.prefetch)
                .await?;
            info!(queue = %queue, consumer_tag = %consumer_tag, "👂 Consuming");
            streams.push(stream);
        }
        Ok(streams)
    }

    async fn run(
        self,
        mut broker: Arc<dyn Broker>,
        mut streams: Vec<DeliveryStream>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut in_flight = JoinSet::new();
        let mut connection_open = true;

        loop {
            match self.serve(&broker, streams, &mut in_flight, &mut shutdown).await {
                ServeExit::Shutdown => break,
                ServeExit::ConnectionLost(reason) => {
                    warn!("⚠️ Broker connection lost: {}", reason);
                    self.publisher.set_broker(None);
                    if let Err(e) = broker.close().await {
                        debug!("Close of lost connection: {}", e);
                    }

                    match self.reconnect(&mut shutdown).await {
                        Reconnect::Established(new_broker, new_streams) => {
                            broker = new_broker;
                            streams = new_streams;
                        }
                        Reconnect::Shutdown | Reconnect::Exhausted => {
                            connection_open = false;
                            break;
                        }
                    }
                }
            }
        }

        self.drain(&mut in_flight).await;
        self.publisher.set_broker(None);

        if connection_open {
            if let Err(e) = broker.close().await {
                warn!("Failed to close broker connection cleanly: {}", e);
            }
        }
    }

    async fn serve(
        &self,
        broker: &Arc<dyn Broker>,
        streams: Vec<DeliveryStream>,
        in_flight: &mut JoinSet<()>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ServeExit {
        let mut deliveries = merge(streams);
        let period = self.options.probe_interval;
        let mut probe = tokio::time::interval_at(Instant::now() + period, period);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                return ServeExit::Shutdown;
            }

            tokio::select! {
                _ = shutdown.changed() => return ServeExit::Shutdown,

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!("Handler task failed: {}", e);
                    }
                }

                _ = probe.tick() => {
                    if !broker.is_connected() {
                        return ServeExit::ConnectionLost("connection probe failed".to_string());
                    }
                }

                item = deliveries.next() => match item {
                    Some(Ok(delivery)) => {
                        let permit = tokio::select! {
                            permit = self.semaphore.clone().acquire_owned() => match permit {
                                Ok(permit) => permit,
                                Err(_) => return ServeExit::Shutdown,
                            },
                            _ = shutdown.changed() => return ServeExit::Shutdown,
                        };

                        let dispatcher = self.dispatcher.clone();
                        in_flight.spawn(async move {
                            let _permit = permit;
                            let queue = delivery.queue.clone();
                            let delivery_tag = delivery.delivery_tag;
                            if let Err(e) = dispatcher.dispatch(delivery).await {
                                error!(
                                    queue = %queue,
                                    delivery_tag,
                                    "Failed to settle delivery: {}",
                                    e
                                );
                            }
                        });
                    }
                    Some(Err(e)) => return ServeExit::ConnectionLost(e.to_string()),
                    None => return ServeExit::ConnectionLost("delivery streams closed".to_string()),
                },
            }
        }
    }

    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> Reconnect {
        let reconnect = &self.options.reconnect;
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=reconnect.max_attempts {
            self.health
                .send_replace(BrokerHealth::Reconnecting { attempt });

            let delay = backoff_delay(reconnect, attempt);
            info!(
                attempt,
                max_attempts = reconnect.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "🔄 Reconnecting to broker"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return Reconnect::Shutdown,
            }

            match self.establish().await {
                Ok((broker, streams)) => {
                    self.health.send_replace(BrokerHealth::Connected);
                    info!(attempt, "✅ Broker reconnected");
                    return Reconnect::Established(broker, streams);
                }
                Err(e) => {
                    warn!(attempt, "Reconnect attempt failed: {}", e);
                    last_error = e.to_string();
                }
            }
        }

        error!(
            attempts = reconnect.max_attempts,
            "❌ Giving up on broker: {}", last_error
        );
        self.health.send_replace(BrokerHealth::Failed {
            reason: format!(
                "reconnect failed after {} attempts: {}",
                reconnect.max_attempts, last_error
            ),
        });
        Reconnect::Exhausted
    }

    async fn drain(&self, in_flight: &mut JoinSet<()>) {
        if in_flight.is_empty() {
            return;
        }

        info!(in_flight = in_flight.len(), "Draining in-flight handlers");
        let drained = tokio::time::timeout(self.options.shutdown_grace, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = in_flight.len(),
                "Grace period elapsed, aborting remaining handlers"
            );
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
        }
    }
}

/// Merge consumer streams. A stream that ends is reported as a connection
/// loss; the trailing pending stream keeps an empty set from finishing.
fn merge(
    streams: Vec<DeliveryStream>,
) -> SelectAll<BoxStream<'static, Result<Delivery, BrokerError>>> {
    let mut merged = stream::select_all(streams.into_iter().map(|s| {
        s.chain(stream::once(async {
            Err(BrokerError::Connection("consumer stream ended".to_string()))
        }))
        .boxed()
    }));
    merged.push(stream::pending().boxed());
    merged
}
