use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Index request failed: {0}")]
    Index(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Cursor codec error: {0}")]
    Codec(String),

    #[error("Operation failed: {0}")]
    Operation(String),
}

impl Error {
    pub fn is_config(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
