//! HTTP transport for the file-stream endpoint
//!
//! Abstracts the HTTP client for testability. Provides:
//! - Transport trait: a JSON POST with a status-aware error type
//! - HttpTransport: blocking reqwest client with basic auth
//! - MockTransport: scripted responses with recorded request bodies

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

/// Header carrying the local username
pub const USERNAME_HEADER: &str = "x-telemetry-username";

/// Header carrying the local user email
pub const USER_EMAIL_HEADER: &str = "x-telemetry-user-email";

/// Response from the collector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    /// Parse the body as JSON, if it is JSON.
    pub fn json(&self) -> Option<Value> {
        serde_json::from_str(&self.body).ok()
    }
}

/// Transport errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Request timed out")]
    Timeout,

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Request failed: {0}")]
    Other(String),
}

impl TransportError {
    /// HTTP status for status errors
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Transport trait for collector communication
pub trait Transport: Send + Sync {
    /// POST `body` as JSON to `url`. Statuses of 400 and above are errors.
    fn post(&self, url: &str, body: &Value) -> Result<HttpResponse, TransportError>;
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// API key sent as the basic-auth password (user `api`)
    pub api_key: Option<String>,
    pub user_agent: String,
    pub username: Option<String>,
    pub email: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            user_agent: format!("telemetry-core/{}", env!("CARGO_PKG_VERSION")),
            username: None,
            email: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Blocking HTTP transport
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    api_key: Option<String>,
}

impl HttpTransport {
    /// Build the underlying client
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        for (name, value) in [(USERNAME_HEADER, &config.username), (USER_EMAIL_HEADER, &config.email)] {
            if let Some(value) = value {
                let value = HeaderValue::from_str(value)
                    .map_err(|e| TransportError::Other(format!("invalid {} header: {}", name, e)))?;
                headers.insert(HeaderName::from_static(name), value);
            }
        }

        let client = reqwest::blocking::Client::builder()
            .user_agent(config.user_agent)
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| TransportError::Other(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: config.api_key,
        })
    }
}

impl Transport for HttpTransport {
    fn post(&self, url: &str, body: &Value) -> Result<HttpResponse, TransportError> {
        let mut request = self.client.post(url).json(body);
        if let Some(ref api_key) = self.api_key {
            request = request.basic_auth("api", Some(api_key));
        }

        let response = request.send().map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let body = response.text().map_err(map_reqwest_error)?;

        if status >= 400 {
            return Err(TransportError::Status { status, body });
        }
        Ok(HttpResponse { status, body })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Connection(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}

/// A recorded request
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub body: Value,
}

/// Mock transport for testing
///
/// Replies with scripted results in order, then with `200 {}` once the
/// script runs out.
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result for the next unanswered request
    pub fn push_result(&self, result: Result<HttpResponse, TransportError>) {
        self.script.lock().push_back(result);
    }

    /// Queue an HTTP error status
    pub fn push_status(&self, status: u16) {
        self.push_result(Err(TransportError::Status {
            status,
            body: String::new(),
        }));
    }

    /// All requests seen so far
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Bodies of all requests seen so far
    pub fn bodies(&self) -> Vec<Value> {
        self.requests.lock().iter().map(|r| r.body.clone()).collect()
    }
}

impl Transport for MockTransport {
    fn post(&self, url: &str, body: &Value) -> Result<HttpResponse, TransportError> {
        self.requests.lock().push(RecordedRequest {
            url: url.to_string(),
            body: body.clone(),
        });
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(HttpResponse::ok("{}")))
    }
}
