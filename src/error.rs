// ============================================================================
// Error Types
// ============================================================================

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid Pexels API key (HTTP {status})")]
    Unauthorized { status: StatusCode },

    #[error("Rate limited by Pexels (HTTP 429)")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Hourly request quota exhausted{}", reset_hint(.reset_at))]
    QuotaExhausted { reset_at: Option<DateTime<Utc>> },

    #[error("Request to {url} returned HTTP {status}")]
    Status { status: StatusCode, url: String },

    #[error("Not a valid image: {0}")]
    InvalidImage(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Download worker panicked")]
    WorkerPanicked,
}

fn reset_hint(reset_at: &Option<DateTime<Utc>>) -> String {
    match reset_at {
        Some(at) => {
            let mins = (*at - Utc::now()).num_minutes().max(0);
            format!(", window resets in {} minutes", mins)
        }
        None => String::new(),
    }
}

impl Error {
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Map a non-success HTTP status to the matching error variant.
    pub fn from_status(status: StatusCode, url: &str, retry_after: Option<Duration>) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Self::Unauthorized { status },
            StatusCode::TOO_MANY_REQUESTS => Self::RateLimited { retry_after },
            _ => Self::Status {
                status,
                url: url.to_string(),
            },
        }
    }

    /// Whether retrying the same request can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            Self::RateLimited { .. } => true,
            Self::Status { status, .. } => status.is_server_error(),
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Server-requested delay before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Errors after which no further API call of this run can succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized { .. } | Self::QuotaExhausted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let e = Error::from_status(StatusCode::UNAUTHORIZED, "u", None);
        assert!(matches!(e, Error::Unauthorized { .. }));
        assert!(e.is_fatal());
        assert!(!e.is_transient());

        let e = Error::from_status(StatusCode::TOO_MANY_REQUESTS, "u", Some(Duration::from_secs(3)));
        assert!(e.is_transient());
        assert_eq!(e.retry_after(), Some(Duration::from_secs(3)));

        let e = Error::from_status(StatusCode::BAD_GATEWAY, "u", None);
        assert!(e.is_transient());

        let e = Error::from_status(StatusCode::NOT_FOUND, "u", None);
        assert!(!e.is_transient());
        assert!(!e.is_fatal());
    }

    #[test]
    fn test_quota_message() {
        let e = Error::QuotaExhausted { reset_at: None };
        assert_eq!(e.to_string(), "Hourly request quota exhausted");
        let e = Error::QuotaExhausted {
            reset_at: Some(Utc::now() + chrono::Duration::minutes(30)),
        };
        assert!(e.to_string().contains("window resets in"));
    }
}
