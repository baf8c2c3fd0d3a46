use std::time::Duration;

use admit_limit::Reason;

/// Errors produced by the admission middleware.
///
/// Services surface these boxed as [`tower::BoxError`]; downcast to recover
/// the variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmitError {
    /// The request was rejected by a rate limiter. The handler never ran.
    ///
    /// When the `axum` feature is enabled, this converts to `429 Too Many Requests`
    /// with a `Retry-After` header.
    #[error("Rate limit exceeded; retry after {retry_after:?}")]
    RateLimited {
        /// How long until the limiter would admit the request.
        retry_after: Duration,
    },

    /// The request was queued for a permit longer than the configured wait budget.
    ///
    /// When the `axum` feature is enabled, this converts to `408 Request Timeout`.
    #[error("Request timed out waiting for rate limit capacity")]
    Timeout,

    /// The limiter cannot take the request at all, e.g. it has been closed for
    /// shutdown.
    ///
    /// When the `axum` feature is enabled, this converts to `503 Service Unavailable`.
    #[error("Service is overloaded; request shed")]
    Overloaded,

    /// An unexpected error occurred in the inner service.
    ///
    /// When the `axum` feature is enabled, this converts to `500 Internal Server Error`.
    #[error("Internal service error: {0}")]
    Inner(String),
}

impl From<Reason> for AdmitError {
    fn from(reason: Reason) -> Self {
        match reason {
            Reason::Overloaded { retry_after } => Self::RateLimited { retry_after },
            // Single-permit requests always fit, so only oversized takes land here.
            Reason::Exceeded { .. } => Self::Overloaded,
        }
    }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for AdmitError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, retry_after) = match self {
            Self::RateLimited { retry_after } => {
                let secs = retry_after.as_secs().max(1);
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    Some(axum::http::HeaderValue::from(secs)),
                )
            }
            Self::Timeout => (StatusCode::REQUEST_TIMEOUT, None),
            Self::Overloaded => (StatusCode::SERVICE_UNAVAILABLE, None),
            Self::Inner(_) => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };

        let mut response = (status, self.to_string()).into_response();
        if let Some(value) = retry_after {
            response
                .headers_mut()
                .insert(axum::http::header::RETRY_AFTER, value);
        }
        response
    }
}

/// Maps any service error to a response, for use with axum's
/// `HandleErrorLayer`.
#[cfg(feature = "axum")]
pub async fn handle_admit_error(err: tower::BoxError) -> axum::response::Response {
    use axum::response::IntoResponse;

    match err.downcast::<AdmitError>() {
        Ok(admit_err) => (*admit_err).into_response(),
        Err(other) => AdmitError::Inner(other.to_string()).into_response(),
    }
}
