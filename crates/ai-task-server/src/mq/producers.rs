use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::binding::{BindingRegistry, Producer};
use super::consumers::ReviewTask;
use crate::config::TasksConfig;

/// Wire body published once a review is done
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewResult {
    pub task_id: String,
    pub bucket: String,
    pub key: String,
    pub review: String,
    pub completed_at: DateTime<Utc>,
}

impl ReviewResult {
    pub fn new(task: &ReviewTask, review: String) -> Self {
        Self {
            task_id: task.task_id.clone(),
            bucket: task.bucket.clone(),
            key: task.key.clone(),
            review,
            completed_at: Utc::now(),
        }
    }
}

/// Publish targets used by handlers and the HTTP layer
#[derive(Debug, Clone)]
pub struct Producers {
    /// Enqueue review tasks
    pub review_requests: Producer,
    pub review_results: Producer,
}

impl Producers {
    pub fn register(registry: &mut BindingRegistry, tasks: &TasksConfig) -> Self {
        Self {
            review_requests: registry.register_producer(&tasks.exchange, &tasks.review_routing_key),
            review_results: registry.register_producer(&tasks.exchange, &tasks.result_routing_key),
        }
    }
}
