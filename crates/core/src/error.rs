//! Error types for the core domain

use thiserror::Error;

/// Core domain errors
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Tokenizer unavailable: {0}")]
    Tokenizer(String),

    #[error("Invalid chunking: overlap {overlap} must be smaller than chunk size {max_tokens}")]
    InvalidChunking { max_tokens: usize, overlap: usize },

    #[error("Invalid clustering configuration: {0}")]
    InvalidClustering(String),
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
