use std::io;

use http::{header::InvalidHeaderValue, status::StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::ParseError as UrlParseError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum TranscludeError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Fetch of {url} failed: {reason}")]
    Fetch { url: String, reason: String },
    #[error("Invalid header value: {0}")]
    Header(String),
    #[error("{operation} is not valid while the page is {state}")]
    InvalidState { operation: String, state: String },
    #[error("File System error: {0}")]
    Io(String),
    #[error("Worker pool error: {0}")]
    Pool(String),
    #[error("Render error: {0}")]
    Render(String),
    #[error("Root resource {url} is unavailable: {reason}")]
    RootUnavailable { url: String, reason: String },
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
}

impl TranscludeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            TranscludeError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            TranscludeError::Fetch { .. } => StatusCode::BAD_GATEWAY,
            TranscludeError::Header(_) => StatusCode::BAD_REQUEST,
            TranscludeError::InvalidState { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            TranscludeError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            TranscludeError::Pool(_) => StatusCode::SERVICE_UNAVAILABLE,
            TranscludeError::Render(_) => StatusCode::INTERNAL_SERVER_ERROR,
            TranscludeError::RootUnavailable { .. } => StatusCode::BAD_GATEWAY,
            TranscludeError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) fn invalid_state(operation: &str, state: impl std::fmt::Display) -> Self {
        TranscludeError::InvalidState {
            operation: operation.to_string(),
            state: state.to_string(),
        }
    }
}

impl From<toml::de::Error> for TranscludeError {
    fn from(src: toml::de::Error) -> TranscludeError {
        TranscludeError::Serialization(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for TranscludeError {
    fn from(src: toml::ser::Error) -> TranscludeError {
        TranscludeError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<UrlParseError> for TranscludeError {
    fn from(src: UrlParseError) -> TranscludeError {
        TranscludeError::Serialization(format!("Invalid URL: {src}"))
    }
}

impl From<InvalidHeaderValue> for TranscludeError {
    fn from(src: InvalidHeaderValue) -> TranscludeError {
        TranscludeError::Header(format!("{src}"))
    }
}

impl From<io::Error> for TranscludeError {
    fn from(x: io::Error) -> Self {
        TranscludeError::Io(format!("IOError: {} ({x})", x.kind()))
    }
}
