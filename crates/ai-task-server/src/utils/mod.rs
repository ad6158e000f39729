pub mod error;
pub mod logger;
pub mod metrics;

pub use error::{ApiError, ConfigurationError};
pub use metrics::{Metrics, MetricsSnapshot, Timer};
