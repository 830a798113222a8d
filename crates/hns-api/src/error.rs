//! Error types for the aggregation server.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for request handling.
///
/// Bodies are the plain message text; Kubernetes clients surface them as-is.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No client certificate was presented.
    #[error("user is not authenticated")]
    Unauthenticated,

    /// The certificate common name is not in the allow-list.
    #[error("user {0} not allowed")]
    UserNotAllowed(String),

    /// The authentication ConfigMap could not be read or parsed.
    #[error("could not authenticate API server, error: {0}")]
    AuthConfig(String),

    /// The authentication ConfigMap is missing a required key.
    #[error("could not authenticate API server, invalid extension config")]
    InvalidAuthConfig,

    /// The requested resource is not in the catalog.
    #[error("could not find resource {0}")]
    ResourceNotFound(String),

    /// The client's Accept header could not be negotiated.
    #[error("could not negotiate content type")]
    Negotiation,

    /// A list item or table row did not carry the metadata needed to sort it.
    #[error("could not sort invalid resource")]
    InvalidSortObject,

    /// The upstream API server returned 404.
    #[error("{0}")]
    NotFound(String),

    /// Any other upstream API failure.
    #[error("{0}")]
    Upstream(String),

    /// Request construction or serialization failure.
    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// The HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Unauthenticated | Error::UserNotAllowed(_) => StatusCode::UNAUTHORIZED,
            Error::ResourceNotFound(_) | Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AuthConfig(_)
            | Error::InvalidAuthConfig
            | Error::Negotiation
            | Error::InvalidSortObject
            | Error::Upstream(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) if resp.code == 404 => Error::NotFound(resp.to_string()),
            other => Error::Upstream(other.to_string()),
        }
    }
}

impl From<http::Error> for Error {
    fn from(err: http::Error) -> Self {
        Error::Internal(err.to_string())
    }
}
