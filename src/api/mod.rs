//! HTTP plumbing shared by every DigitalOcean call.
//!
//! Requests are described as plain values ([`ApiRequest`]) and sent through a
//! [`Transport`]. The production transport wraps `reqwest`; tests substitute
//! a scripted transport. [`RetryingClient`] sits on top of any transport and
//! absorbs rate limiting and server-side failures.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

mod http;
mod retry;

pub(crate) use http::parse_base_url;
pub use http::{DEFAULT_API_BASE, HttpTransport};
pub use retry::{RetryBackoff, RetryPolicy, RetryingClient};

/// HTTP verbs used by the provider API.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Method {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `DELETE`
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        };
        f.write_str(verb)
    }
}

/// A single provider request, independent of the transport that sends it.
#[derive(Clone, Debug, PartialEq)]
pub struct ApiRequest {
    /// HTTP method.
    pub method: Method,
    /// Path relative to the API base, for example `v2/droplets/42`.
    pub path: String,
    /// Query string pairs.
    pub query: Vec<(String, String)>,
    /// Optional JSON body.
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    /// Builds a `GET` request.
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    /// Builds a `POST` request carrying a JSON body.
    #[must_use]
    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            body: Some(body),
            ..Self::new(Method::Post, path)
        }
    }

    /// Builds a `DELETE` request.
    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    /// Appends a query string pair.
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// Raw response returned by a transport.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body bytes.
    pub body: Vec<u8>,
}

impl ApiResponse {
    /// Creates a response from a status and a UTF-8 body.
    #[must_use]
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into().into_bytes(),
        }
    }

    /// Returns `true` for 2xx statuses.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Decodes the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Decode`] when the body does not match `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body).map_err(|err| ApiError::Decode {
            message: err.to_string(),
        })
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Errors raised while talking to the provider API.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ApiError {
    /// The API answered with a non-success status.
    #[error("API returned status {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Provider error identifier (for example `not_found`).
        id: Option<String>,
        /// Provider error message or raw body.
        message: String,
    },
    /// The request never produced a response.
    #[error("request failed: {message}")]
    Transport {
        /// Underlying client error.
        message: String,
    },
    /// The response body could not be decoded.
    #[error("failed to decode response: {message}")]
    Decode {
        /// Decoder error.
        message: String,
    },
    /// The configured API base URL is unusable.
    #[error("invalid API URL {url}: {message}")]
    InvalidBaseUrl {
        /// URL as configured.
        url: String,
        /// Parser error.
        message: String,
    },
}

impl ApiError {
    /// Converts a non-success response into [`ApiError::Status`].
    #[must_use]
    pub fn from_response(response: &ApiResponse) -> Self {
        let (id, message) = match serde_json::from_slice::<ErrorBody>(&response.body) {
            Ok(ErrorBody {
                id,
                message: Some(message),
            }) => (id, message),
            Ok(ErrorBody { id, message: None }) => {
                (id, String::from_utf8_lossy(&response.body).into_owned())
            }
            Err(_) => (None, String::from_utf8_lossy(&response.body).into_owned()),
        };
        Self::Status {
            status: response.status,
            id,
            message,
        }
    }

    /// Status code carried by the error, if any.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns `true` for rate limiting (429) and server errors (5xx).
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.status(), Some(429 | 500..=599))
    }

    /// Returns `true` when the resource does not exist (404).
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.status(), Some(404))
    }
}

/// Future returned by [`Transport::send`].
pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ApiResponse, ApiError>> + Send + 'a>>;

/// Sends a single request and returns the raw response.
///
/// Implementations must not retry; retrying is layered on top by
/// [`RetryingClient`].
pub trait Transport: Send + Sync {
    /// Sends `request` once.
    fn send<'a>(&'a self, request: &'a ApiRequest) -> TransportFuture<'a>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(429, true)]
    #[case(500, true)]
    #[case(503, true)]
    #[case(599, true)]
    #[case(400, false)]
    #[case(404, false)]
    #[case(422, false)]
    fn status_errors_classify_retryability(#[case] status: u16, #[case] retryable: bool) {
        let err = ApiError::from_response(&ApiResponse::new(status, "{}"));
        assert_eq!(err.is_retryable(), retryable);
    }

    #[test]
    fn from_response_reads_provider_error_body() {
        let response = ApiResponse::new(
            404,
            r#"{"id":"not_found","message":"The resource you were accessing could not be found."}"#,
        );
        let err = ApiError::from_response(&response);
        assert_eq!(
            err,
            ApiError::Status {
                status: 404,
                id: Some(String::from("not_found")),
                message: String::from("The resource you were accessing could not be found."),
            }
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn from_response_falls_back_to_raw_body() {
        let err = ApiError::from_response(&ApiResponse::new(502, "bad gateway"));
        assert_eq!(
            err.to_string(),
            "API returned status 502: bad gateway"
        );
    }

    #[test]
    fn transport_errors_are_not_retryable() {
        let err = ApiError::Transport {
            message: String::from("connection reset"),
        };
        assert!(!err.is_retryable());
    }
}
