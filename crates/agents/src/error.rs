//! Agent error types

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    /// Storage failures are fatal to the enclosing insert or query.
    #[error("Storage error: {0}")]
    Storage(#[from] kgrag_db::DbError),

    #[error("Core error: {0}")]
    Core(#[from] kgrag_core::CoreError),

    #[error("LLM backend error: {0}")]
    Llm(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Malformed extraction output: {0}")]
    ExtractionParse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Query mode '{0}' is not enabled")]
    InvalidMode(String),

    #[error("Processing error: {0}")]
    Processing(String),
}

impl AgentError {
    /// Whether a failed backend call is worth another attempt. HTTP errors
    /// are retried on timeouts, refused connections, 429 and 5xx only.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Llm(_) | AgentError::Embedding(_) => true,
            AgentError::Http(e) => match e.status() {
                Some(status) => retryable_status(status),
                None => e.is_timeout() || e.is_connect(),
            },
            _ => false,
        }
    }
}

fn retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_statuses_are_retryable() {
        assert!(retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!retryable_status(StatusCode::BAD_REQUEST));
        assert!(!retryable_status(StatusCode::NOT_FOUND));
        assert!(!retryable_status(StatusCode::UNPROCESSABLE_ENTITY));
    }

    #[test]
    fn test_request_build_error_is_not_retryable() {
        let err = reqwest::Client::new()
            .get("not a url")
            .build()
            .unwrap_err();
        assert!(!AgentError::from(err).is_retryable());
        assert!(AgentError::Llm("overloaded".into()).is_retryable());
        assert!(!AgentError::ExtractionParse("prose".into()).is_retryable());
    }
}
