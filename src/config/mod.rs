//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → BalancerConfig (validated, immutable)
//!     → UpstreamManager builds one PeerRegistry per group
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → UpstreamManager::reload reconfigures registries in place
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All optional fields have defaults to allow minimal configs
//! - Zero total weight is rejected here, never at selection time

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{BalanceMethod, BalancerConfig, ObservabilityConfig, PeerConfig, UpstreamConfig};
pub use validation::ValidationError;
