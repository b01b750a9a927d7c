//! Error types for deduplication

use thiserror::Error;

/// Result type for dedup operations
pub type Result<T> = std::result::Result<T, Error>;

/// Deduplication errors
#[derive(Error, Debug)]
pub enum Error {
    /// Durable store failure
    #[error("Dedup store error: {0}")]
    Store(String),
}
