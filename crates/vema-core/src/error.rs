use thiserror::Error;

#[derive(Debug, Error)]
pub enum VemaError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Mapping table error: {0}")]
    Mappings(String),

    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    #[error("LLM provider error: {0}")]
    LlmProvider(String),

    #[error("File error: {0}")]
    File(String),

    #[error("Download path outside the outputs directory: {path}")]
    PathSecurity { path: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, VemaError>;
