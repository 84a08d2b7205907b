//! Identifier generation
//!
//! Room and peer identifiers are UUIDv5 values derived from a namespace UUID
//! and a monotonically increasing sequence number, so every id is reproducible
//! from its namespace and position.

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use uuid::Uuid;

/// A source of identifiers that are unique within its namespace
pub trait IdSource: Send + Sync {
    /// Produce the next identifier
    fn generate(&self) -> String;

    /// Derive a generator whose identifiers live in `namespace`
    fn scoped(&self, namespace: &str) -> Result<Box<dyn IdSource>, IdError>;
}

/// Identifier generation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("invalid id namespace {namespace:?}: {reason}")]
    InvalidNamespace { namespace: String, reason: String },
}

/// UUIDv5 generator over a fixed namespace
#[derive(Debug)]
pub struct UuidIdGenerator {
    namespace: Uuid,
    counter: AtomicU64,
}

impl UuidIdGenerator {
    /// Create a generator with a fresh random namespace
    pub fn new() -> Self {
        Self::with_namespace(Uuid::new_v4())
    }

    pub fn with_namespace(namespace: Uuid) -> Self {
        Self {
            namespace,
            counter: AtomicU64::new(0),
        }
    }

    /// Parse `namespace` as a UUID and build a generator over it
    pub fn parse_namespace(namespace: &str) -> Result<Self, IdError> {
        let parsed = Uuid::parse_str(namespace).map_err(|e| IdError::InvalidNamespace {
            namespace: namespace.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::with_namespace(parsed))
    }
}

impl Default for UuidIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdSource for UuidIdGenerator {
    fn generate(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        Uuid::new_v5(&self.namespace, seq.to_string().as_bytes()).to_string()
    }

    fn scoped(&self, namespace: &str) -> Result<Box<dyn IdSource>, IdError> {
        Ok(Box::new(Self::parse_namespace(namespace)?))
    }
}
