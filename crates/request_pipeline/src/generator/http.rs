use http::StatusCode;
use snafu::Snafu;

use crate::Error as CrateError;

/// Why a single outbound call of a burst did not count as a success.
///
/// Every variant is a failure of the call, never of the generator: the loop folds it into the
/// cycle's aggregate outcome and moves on.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HttpError {
    /// An error occurred during the transport of the request (e.g., network issue, DNS).
    #[snafu(display("HTTP transport error: {}", source))]
    Transport { source: CrateError },

    /// The request could not be built from the configured target.
    #[snafu(display("Invalid HTTP request: {}", details))]
    InvalidRequest { details: String },

    /// The target answered with a status outside the 2xx class.
    #[snafu(display("HTTP server error response (status {}): {}", status, body))]
    ServerError { status: u16, body: String },

    #[snafu(display("HTTP request timed out"))]
    Timeout,

    /// Other, unspecified HTTP client errors.
    #[snafu(display("Generic HTTP client error: {}", source))]
    ClientError { source: CrateError },
}

impl HttpError {
    /// Classifies a boxed error coming out of the outbound service stack.
    pub fn from_boxed(error: CrateError) -> Self {
        if error.is::<tower::timeout::error::Elapsed>() {
            return HttpError::Timeout;
        }
        match error.downcast::<HttpError>() {
            Ok(http_error) => *http_error,
            Err(other) => HttpError::ClientError { source: other },
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HttpError::ServerError { status, .. } => StatusCode::from_u16(*status).ok(),
            _ => None,
        }
    }

    /// Short, low-cardinality label used for metrics.
    pub const fn kind(&self) -> &'static str {
        match self {
            HttpError::Transport { .. } => "transport",
            HttpError::InvalidRequest { .. } => "invalid_request",
            HttpError::ServerError { .. } => "status",
            HttpError::Timeout => "timeout",
            HttpError::ClientError { .. } => "client",
        }
    }
}
