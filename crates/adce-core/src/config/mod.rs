//! Engine configuration (TOML).

mod loader;
mod types;

pub use loader::{ConfigError, load_config, parse_config, validate_config};
pub use types::{
    EngineConfig, ExecutorConfig, MonitorConfig, PriorityRules, ReconcileConfig, RetryConfig,
    SourceConfig, StorageConfig,
};
