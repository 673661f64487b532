//! Error types for camera acquisition.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CamError {
    #[error("connection: {0}")]
    Connection(String),

    #[error("authentication rejected: {0}")]
    Authentication(String),

    #[error("endpoint not found: {0}")]
    EndpointNotFound(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error("configuration: {0}")]
    Configuration(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal: {0}")]
    Internal(String),
}

/// Serializable classification of a failed capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    Connection,
    Authentication,
    EndpointNotFound,
    InvalidPayload,
    CircuitOpen,
    Configuration,
    Internal,
}

impl CamError {
    pub fn kind(&self) -> FailureKind {
        match self {
            CamError::Connection(_) | CamError::Http(_) | CamError::Io(_) => FailureKind::Connection,
            CamError::Authentication(_)   => FailureKind::Authentication,
            CamError::EndpointNotFound(_) => FailureKind::EndpointNotFound,
            CamError::InvalidPayload(_)   => FailureKind::InvalidPayload,
            CamError::CircuitOpen(_)      => FailureKind::CircuitOpen,
            CamError::Configuration(_)    => FailureKind::Configuration,
            CamError::Json(_) | CamError::Internal(_) => FailureKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, CamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(CamError::CircuitOpen("10.0.0.2".into()).kind(), FailureKind::CircuitOpen);
        assert_eq!(CamError::Configuration("x".into()).kind(), FailureKind::Configuration);
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "t");
        assert_eq!(CamError::from(io).kind(), FailureKind::Connection);
    }
}
