use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("Context key {0} not found")]
    NotRegistered(String),

    #[error("Invalid context config: {0}")]
    InvalidConfig(String),
}

/// One conversational exchange kept in a context buffer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Outbound user text
    pub text: String,

    /// Model output, filled once the model answered
    #[serde(default)]
    pub response: Option<String>,

    pub timestamp: DateTime<Utc>,

    /// Opaque caller metadata, never rendered
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Message {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            response: None,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Byte length of the rendered form; the unit of the context budget
    pub fn rendered_len(&self) -> usize {
        self.to_string().len()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "User: {}", self.text)?;
        if let Some(response) = &self.response {
            write!(f, "\nModel: {}", response)?;
        }
        Ok(())
    }
}

/// Per-key context settings, fixed once the key is configured
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextConfig {
    /// Budget in bytes of rendered messages
    pub max_context_length: usize,
    pub invalidation_after_seconds: u64,
    pub system_instruction: String,
}

impl ContextConfig {
    pub fn new(
        max_context_length: usize,
        invalidation_after_seconds: u64,
        system_instruction: impl Into<String>,
    ) -> Self {
        Self {
            max_context_length,
            invalidation_after_seconds,
            system_instruction: system_instruction.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ContextError> {
        if self.max_context_length == 0 {
            return Err(ContextError::InvalidConfig(
                "max_context_length must be greater than 0".to_string(),
            ));
        }
        if self.invalidation_after_seconds == 0 {
            return Err(ContextError::InvalidConfig(
                "invalidation_after_seconds must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Ordered messages for one key (oldest first) with a running byte total.
///
/// After every `push` the total stays below `max_context_length`, unless the
/// only message left is itself at least that long.
#[derive(Debug)]
pub struct ContextBuffer {
    config: Arc<ContextConfig>,
    messages: VecDeque<Message>,
    total_length: usize,
}

impl ContextBuffer {
    pub fn new(config: Arc<ContextConfig>) -> Self {
        Self {
            config,
            messages: VecDeque::new(),
            total_length: 0,
        }
    }

    pub fn config(&self) -> &Arc<ContextConfig> {
        &self.config
    }

    pub fn messages(&self) -> &VecDeque<Message> {
        &self.messages
    }

    pub fn total_length(&self) -> usize {
        self.total_length
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Evict oldest messages until `message` fits, then append it.
    /// Returns the number of evicted messages.
    pub fn push(&mut self, message: Message) -> usize {
        let incoming = message.rendered_len();
        let mut evicted = 0;

        while !self.messages.is_empty()
            && self.total_length + incoming >= self.config.max_context_length
        {
            if let Some(oldest) = self.messages.pop_front() {
                self.total_length -= oldest.rendered_len();
                evicted += 1;
            }
        }

        self.total_length += incoming;
        self.messages.push_back(message);
        evicted
    }

    /// Clear everything when the newest message is older than the invalidation window.
    /// Returns true if the buffer was cleared.
    pub fn invalidate_if_stale(&mut self, now: DateTime<Utc>) -> bool {
        let Some(last) = self.messages.back() else {
            return false;
        };

        let window = chrono::Duration::seconds(self.config.invalidation_after_seconds as i64);
        if now - last.timestamp > window {
            self.clear();
            return true;
        }

        false
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.total_length = 0;
    }
}
