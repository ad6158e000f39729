pub mod completion;
pub mod context;
pub mod gemini;
pub mod object_store;

pub use completion::CompletionService;
pub use context::ContextStore;
pub use gemini::{GeminiService, ModelClient};
pub use object_store::{ObjectStore, S3ObjectStore};
