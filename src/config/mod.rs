//! Configuration management: TOML schema, loading, and validation.
//! Config is immutable once loaded and shared via Arc where needed.

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    AccessConfig, EnvelopeConfig, ListenerConfig, ObservabilityConfig, TokenConfig, TxConfig,
};
pub use validation::{validate_config, ValidationError};
