use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiagError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("persistence error for store '{store}': {message}")]
    Persistence { store: String, message: String },

    #[error("corrupt persisted state for store '{store}': {message}")]
    Corrupt { store: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl DiagError {
    pub fn invalid(message: impl Into<String>) -> Self {
        DiagError::InvalidArgument(message.into())
    }
}

pub type DiagResult<T> = Result<T, DiagError>;
