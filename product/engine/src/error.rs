use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("fetch failed for {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("upload failed for {key}: {message}")]
    Upload { key: String, message: String },

    #[error("recognition failed: {0}")]
    Recognition(String),

    #[error("logging setup failed: {0}")]
    Logging(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Short, stable name used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Fetch { .. } => "fetch",
            EngineError::Parse(_) => "parse",
            EngineError::Upload { .. } => "upload",
            EngineError::Recognition(_) => "recognition",
            EngineError::Logging(_) => "logging",
            EngineError::Json(_) => "json",
            EngineError::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
