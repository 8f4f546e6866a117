//! Agent error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("config error: {0}")]
    Config(String),

    #[error("buffer error: {0}")]
    Buffer(String),

    #[error("version store error: {0}")]
    Version(String),

    #[error("notify server error: {0}")]
    Notify(String),

    #[error("transport error: {0}")]
    Transport(#[from] slm_transport::TransportError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type AgentResult<T> = Result<T, AgentError>;
