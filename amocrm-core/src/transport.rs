//! HTTP transport used by every API call.
//!
//! The [`Transport`] trait is the seam between the pagination/batching engine
//! and the network. [`HttpTransport`] is the reqwest-backed implementation; it
//! attaches the bearer token, decodes JSON bodies and turns amoCRM's
//! problem-details error bodies into [`Error`] values.

use crate::context::AccessContext;
use async_trait::async_trait;
use reqwest::header::{HeaderValue, ACCEPT};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Longest raw body excerpt kept in an error message.
const MAX_ERROR_BODY_LEN: usize = 512;

/// Errors returned by a [`Transport`].
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The API rejected the request payload (HTTP 400).
    #[error("Request validation failed ({status}): {message}")]
    Validation {
        /// HTTP status code.
        status: u16,
        /// Server-provided description.
        message: String,
        /// Per-item validation errors, when the server returned them.
        errors: Vec<ValidationError>,
    },
    /// The access token was rejected (HTTP 401 or 403).
    #[error("Authentication failed ({status}): {message}")]
    Authentication {
        /// HTTP status code.
        status: u16,
        /// Server-provided description.
        message: String,
    },
    /// Any other non-success status.
    #[error("HTTP error {status}: {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Server-provided description.
        message: String,
    },
    /// The request could not be sent or the response could not be read.
    #[error("HTTP request failed: {source}")]
    Request {
        #[source]
        source: reqwest::Error,
    },
    /// The response body is not valid JSON.
    #[error("Failed to decode response body: {source}")]
    Decode {
        #[source]
        source: serde_json::Error,
    },
    /// The underlying HTTP client could not be constructed.
    #[error("Failed to build HTTP client: {source}")]
    HttpClientBuild {
        #[source]
        source: reqwest::Error,
    },
}

impl Error {
    /// HTTP status code carried by the error, if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Validation { status, .. }
            | Error::Authentication { status, .. }
            | Error::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Maps a non-success response to the matching error variant.
    pub(crate) fn from_response(status: StatusCode, body: &[u8]) -> Self {
        let problem: ProblemDetails = serde_json::from_slice(body).unwrap_or_default();
        let message = problem.message(status, body);

        match status.as_u16() {
            400 => Error::Validation {
                status: 400,
                message,
                errors: problem.validation_errors,
            },
            code @ (401 | 403) => Error::Authentication {
                status: code,
                message,
            },
            code => Error::Http {
                status: code,
                message,
            },
        }
    }
}

/// Validation errors reported for one item of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    /// Correlation id of the rejected item, if the caller supplied one.
    #[serde(default)]
    pub request_id: Option<Value>,
    /// Field-level problems.
    #[serde(default)]
    pub errors: Vec<FieldError>,
}

/// A single rejected field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    /// Machine-readable error code.
    #[serde(default)]
    pub code: Option<String>,
    /// Path of the field inside the item.
    #[serde(default)]
    pub path: Option<String>,
    /// Human-readable description.
    #[serde(default)]
    pub detail: Option<String>,
}

/// Error body returned by the API (`application/problem+json`).
#[derive(Debug, Default, Deserialize)]
struct ProblemDetails {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    detail: Option<String>,
    #[serde(rename = "validation-errors", default)]
    validation_errors: Vec<ValidationError>,
}

impl ProblemDetails {
    fn message(&self, status: StatusCode, body: &[u8]) -> String {
        let title = self
            .title
            .clone()
            .or_else(|| status.canonical_reason().map(str::to_string))
            .unwrap_or_else(|| "HTTP error".to_string());

        match (&self.detail, self.title.is_some()) {
            (Some(detail), _) => format!("{title}: {detail}"),
            (None, true) => title,
            (None, false) => {
                let text = String::from_utf8_lossy(body);
                let text = text.trim();
                if text.is_empty() {
                    title
                } else {
                    let excerpt: String = text.chars().take(MAX_ERROR_BODY_LEN).collect();
                    format!("{title}: {excerpt}")
                }
            }
        }
    }
}

/// A single API request.
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP verb.
    pub method: Method,
    /// Absolute request URL.
    pub url: Url,
    /// Bearer token for the `Authorization` header.
    pub access_token: String,
    /// JSON body, if any.
    pub body: Option<Value>,
}

impl Request {
    /// Creates a GET request.
    pub fn get(url: Url, context: &AccessContext) -> Self {
        Self {
            method: Method::GET,
            url,
            access_token: context.access_token().to_string(),
            body: None,
        }
    }

    /// Creates a request carrying a JSON body.
    pub fn with_body(method: Method, url: Url, context: &AccessContext, body: Value) -> Self {
        Self {
            method,
            url,
            access_token: context.access_token().to_string(),
            body: Some(body),
        }
    }
}

/// Performs API requests.
///
/// Implementations return the decoded JSON body of a successful (2xx) response,
/// [`Value::Null`] when the response has no content, and a typed [`Error`]
/// otherwise. Retries, if any, belong to the implementation.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `request` and returns the decoded response body.
    async fn send(&self, request: Request) -> Result<Value, Error>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, request: Request) -> Result<Value, Error> {
        (**self).send(request).await
    }
}

/// reqwest-backed [`Transport`].
#[derive(Clone, Debug)]
pub struct HttpTransport {
    http_client: reqwest::Client,
}

impl HttpTransport {
    /// Creates a transport with the crate's default timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HttpClientBuild`] if the TLS backend cannot be initialised.
    pub fn new() -> Result<Self, Error> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(crate::DEFAULT_CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(crate::DEFAULT_REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|source| Error::HttpClientBuild { source })?;

        Ok(Self { http_client })
    }

    /// Wraps an existing reqwest client.
    pub fn with_client(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(method = %request.method, url = %request.url)))]
    async fn send(&self, request: Request) -> Result<Value, Error> {
        let mut builder = self
            .http_client
            .request(request.method, request.url)
            .bearer_auth(&request.access_token)
            .header(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|source| Error::Request { source })?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|source| Error::Request { source })?;

        if !status.is_success() {
            return Err(Error::from_response(status, &body));
        }

        if status == StatusCode::NO_CONTENT || body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }

        serde_json::from_slice(&body).map_err(|source| Error::Decode { source })
    }
}
