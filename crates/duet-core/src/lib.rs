//! Duet Core - configuration and identifier generation
//!
//! Shared pieces of the Duet signaling relay that carry no networking code.

pub mod config;
pub mod idgen;

pub use config::{Config, ConfigError, SignalConfig};
pub use idgen::{IdError, IdSource, UuidIdGenerator};

/// Default signal server port
pub const DEFAULT_PORT: u16 = 8080;
