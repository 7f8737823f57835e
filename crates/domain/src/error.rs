/// Shared error type used across all ChainStream crates.
///
/// The first group of variants is the request-facing taxonomy: they decide
/// the HTTP status a request is rejected with before any stream opens. The
/// second group covers transport and infrastructure failures.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("{provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("persistence: {0}")]
    Persistence(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error should be rejected before a stream is opened.
    pub fn is_pre_stream(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::Auth(_) | Error::RateLimited { .. } | Error::NotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_message_has_no_internal_detail() {
        let e = Error::Provider {
            provider: "anthropic".into(),
            message: "HTTP 529 - overloaded".into(),
        };
        assert_eq!(e.to_string(), "anthropic: HTTP 529 - overloaded");
    }

    #[test]
    fn pre_stream_classification() {
        assert!(Error::Validation("x".into()).is_pre_stream());
        assert!(Error::RateLimited { retry_after_secs: 3 }.is_pre_stream());
        assert!(!Error::Persistence("disk".into()).is_pre_stream());
        assert!(!Error::Http("reset".into()).is_pre_stream());
    }
}
