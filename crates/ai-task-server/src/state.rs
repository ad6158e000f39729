use std::sync::Arc;
use tokio::sync::watch;

use crate::config::Settings;
use crate::mq::{BrokerHealth, MessagePublisher, Producers};
use crate::services::CompletionService;
use crate::utils::metrics::Metrics;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub completions: Arc<CompletionService>,
    pub publisher: MessagePublisher,
    pub producers: Producers,
    pub broker_health: watch::Receiver<BrokerHealth>,
    pub metrics: Metrics,
}
