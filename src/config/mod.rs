//! Service configuration
//!
//! Static configuration is assembled from layers, later layers winning:
//! 1. Built-in defaults
//! 2. TOML config file (`--config`)
//! 3. Environment variables (`TELEMETRY_*`)
//! 4. CLI flags
//!
//! Values the collector may adjust at runtime (heartbeat interval and
//! friends) live in [`DynamicSettings`] instead.

mod defaults;
mod dynamic;
mod effective;
mod merge;

pub use defaults::BuiltinDefaults;
pub use dynamic::{DynamicSettings, DEFAULT_HEARTBEAT_SECONDS};
pub use effective::{
    ApiConfig, ConfigError, ConfigOrigin, ConfigSource, FileStreamSection, RetrySection,
    ServerSection, ServiceConfig, ENV_PREFIX,
};
pub use merge::{deep_merge, merge_layers};
