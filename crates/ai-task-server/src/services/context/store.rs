use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use super::assembler::PromptAssembler;
use super::types::{ContextBuffer, ContextConfig, ContextError, Message};

/// Owns every context buffer.
///
/// Keys live in a sharded `DashMap`; each buffer sits behind its own mutex so
/// `add`/`render` on one key are serialized while different keys never contend.
/// No lock is held across an await point.
#[derive(Clone, Default)]
pub struct ContextStore {
    buffers: Arc<DashMap<String, Arc<Mutex<ContextBuffer>>>>,
}

impl ContextStore {
    pub fn new() -> Self {
        info!("Initializing context store");
        Self::default()
    }

    /// Create the buffer for `key`. First write wins: returns `false` and keeps
    /// the existing config if the key is already configured.
    pub fn configure(&self, key: &str, config: ContextConfig) -> Result<bool, ContextError> {
        config.validate()?;

        match self.buffers.entry(key.to_string()) {
            Entry::Occupied(_) => {
                debug!(key, "Context already configured, keeping existing config");
                Ok(false)
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(ContextBuffer::new(Arc::new(config)))));
                info!(key, "Context configured");
                Ok(true)
            }
        }
    }

    pub fn is_configured(&self, key: &str) -> bool {
        self.buffers.contains_key(key)
    }

    pub fn config(&self, key: &str) -> Result<Arc<ContextConfig>, ContextError> {
        let buffer = self.buffer(key)?;
        let guard = buffer.lock();
        Ok(guard.config().clone())
    }

    /// Append `message`, evicting the oldest entries to stay within budget
    pub fn add(&self, key: &str, message: Message) -> Result<(), ContextError> {
        let buffer = self.buffer(key)?;
        let mut guard = buffer.lock();

        let evicted = guard.push(message);
        debug!(
            key,
            evicted,
            messages = guard.len(),
            total_length = guard.total_length(),
            "Context updated"
        );
        Ok(())
    }

    pub fn render(&self, key: &str, prompt: &str) -> Result<String, ContextError> {
        self.render_at(key, prompt, Utc::now())
    }

    /// Lazy invalidation happens here, on read only
    pub fn render_at(
        &self,
        key: &str,
        prompt: &str,
        now: DateTime<Utc>,
    ) -> Result<String, ContextError> {
        let buffer = self.buffer(key)?;
        let mut guard = buffer.lock();

        if guard.invalidate_if_stale(now) {
            info!(key, "Clearing context...");
        }

        Ok(PromptAssembler::assemble(guard.messages(), prompt))
    }

    pub fn snapshot(&self, key: &str) -> Result<Vec<Message>, ContextError> {
        let buffer = self.buffer(key)?;
        let guard = buffer.lock();
        Ok(guard.messages().iter().cloned().collect())
    }

    pub fn total_length(&self, key: &str) -> Result<usize, ContextError> {
        let buffer = self.buffer(key)?;
        let guard = buffer.lock();
        Ok(guard.total_length())
    }

    /// Number of configured keys
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    // Clone the Arc out so the DashMap shard lock is released before we lock the buffer
    fn buffer(&self, key: &str) -> Result<Arc<Mutex<ContextBuffer>>, ContextError> {
        self.buffers
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ContextError::NotRegistered(key.to_string()))
    }
}
