//! Conversational context module
//!
//! Provides bounded, time-limited conversation memory per client key:
//! - Per-key buffers with a byte budget and FIFO eviction
//! - Lazy invalidation when the newest message is too old
//! - Deterministic prompt assembly

mod assembler;
mod store;
pub mod types;

pub use assembler::PromptAssembler;
pub use store::ContextStore;
pub use types::{ContextBuffer, ContextConfig, ContextError, Message};
