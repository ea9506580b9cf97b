use axum::http::StatusCode;
use thiserror::Error;

/// Service-wide error taxonomy.
///
/// Degraded modes (embedder down, vector index unconfigured, index drift) are
/// deliberately NOT errors: the pipeline falls back, logs a warning, and marks
/// the retrieval strategy suffix instead.
#[derive(Debug, Error)]
pub enum Error {
    /// Empty or over-length input. Reported to the client, never logged at
    /// error level.
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// External quota exhaustion. Surfaced with a backoff hint.
    #[error("rate limited by upstream: {0}")]
    RateLimited(String),

    /// Network / 5xx from embedder, generator, or ANN; surfaced only after
    /// the retry budget is spent.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// Document-store failure. The store is one of the two dependencies whose
    /// loss fails the request outright.
    #[error("store failure: {0}")]
    Store(String),

    /// The generator emitted a citation token outside the advertised pack.
    #[error("citation contract violation: {0}")]
    Contract(String),

    /// Missing or malformed environment at startup.
    #[error("configuration: {0}")]
    Config(String),

    /// Invariant violation. Logged; surfaced as an opaque 500.
    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Error::Upstream(_) | Error::Store(_) | Error::Contract(_) => StatusCode::BAD_GATEWAY,
            Error::Config(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to return to the caller. Internal details stay in logs.
    pub fn public_message(&self) -> String {
        match self {
            Error::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(
            Error::Validation("empty".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::RateLimited("quota".into()).status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            Error::Internal("bug".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_details_are_not_public() {
        let e = Error::Internal("offset recovery failed at 42".into());
        assert_eq!(e.public_message(), "internal error");
        let v = Error::Validation("message must not be empty".into());
        assert!(v.public_message().contains("must not be empty"));
    }
}
