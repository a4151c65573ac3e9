//! Storage error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Snapshot I/O error on {path}: {source}")]
    Snapshot {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Clustering error: {0}")]
    Clustering(#[from] kgrag_core::CoreError),

    #[error("SurrealDB error: {0}")]
    Surreal(#[from] surrealdb::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;
