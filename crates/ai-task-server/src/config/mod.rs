pub mod settings;

pub use settings::{
    BrokerConfig, GeminiConfig, LogFormat, LoggingConfig, ReconnectConfig, ServerConfig,
    Settings, StorageConfig, TasksConfig,
};
