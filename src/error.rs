use std::time::Duration;

use crate::{breaker::FailureKind, player_response::ExtractionError, store::StoreError};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    #[error("server error (HTTP {0})")]
    ServerError(u16),
    #[error("rate limited (HTTP {status})")]
    RateLimited {
        status: u16,
        retry_after: Option<Duration>,
    },
    #[error("challenge page detected")]
    ChallengeDetected,
    #[error("remote resource changed: {0}")]
    ResourceChanged(String),
    #[error("player format drift in {player_version_id}: {detail}")]
    PlayerFormatDrift {
        player_version_id: String,
        detail: String,
    },
    #[error("client error (HTTP {0})")]
    PermanentClient(u16),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("circuit open for {0}")]
    CircuitOpen(String),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("no usable stream for {0}")]
    NoStream(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(StoreError::Io(e))
    }
}

impl Error {
    /// Errors the breaker-gated retry loops may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransientNetwork(_) | Error::ServerError(_) | Error::RateLimited { .. }
        )
    }

    /// How the breaker should account for this error, if it came from the
    /// platform at all.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Error::TransientNetwork(_) => Some(FailureKind::Network),
            Error::ServerError(status) => Some(FailureKind::Server(*status)),
            Error::RateLimited { .. } => Some(FailureKind::RateLimited),
            Error::ChallengeDetected => Some(FailureKind::Challenge),
            Error::PermanentClient(status) => Some(FailureKind::Client(*status)),
            _ => None,
        }
    }

    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_builder() {
            Error::InvalidRequest(e.to_string())
        } else if let Some(status) = e.status() {
            classify_status(status.as_u16(), None).unwrap_or(Error::TransientNetwork(e.to_string()))
        } else {
            Error::TransientNetwork(e.to_string())
        }
    }
}

/// Maps an HTTP status onto the error taxonomy; `None` means success.
pub fn classify_status(status: u16, retry_after: Option<Duration>) -> Option<Error> {
    match status {
        429 => Some(Error::RateLimited {
            status,
            retry_after,
        }),
        500..=599 => Some(Error::ServerError(status)),
        400..=499 => Some(Error::PermanentClient(status)),
        _ => None,
    }
}
