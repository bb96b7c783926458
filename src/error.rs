use thiserror::Error;

#[derive(Error, Debug)]
pub enum AssistantError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Classifier error: {0}")]
    Classifier(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Time logic error: {0}")]
    Time(String),

    #[error("Dialogue error: {0}")]
    Dialogue(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for AssistantError {
    fn from(err: rusqlite::Error) -> Self {
        AssistantError::Database(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AssistantError>;
