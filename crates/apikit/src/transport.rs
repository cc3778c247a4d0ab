//! Transport seam between the typed client and the network.
//!
//! The [`Transport`] trait allows swapping the real HTTP stack
//! ([`UreqTransport`]) for an in-memory one ([`crate::MockTransport`]) in
//! tests.

use crate::error::{Error, Result};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Maximum response body size (image/speech payloads can be large).
const MAX_BODY_SIZE: u64 = 256 * 1024 * 1024;

/// HTTP verbs used by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// Request body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Empty,
    Json(Value),
    Bytes { content_type: String, data: Vec<u8> },
}

/// A fully prepared request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Path relative to the API base, starting with `/`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub bearer: String,
    pub headers: Vec<(String, String)>,
    pub payload: Payload,
}

impl Request {
    /// Create a request with no query, headers or body.
    pub fn new(method: Method, path: impl Into<String>, bearer: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            bearer: bearer.into(),
            headers: Vec::new(),
            payload: Payload::Empty,
        }
    }
}

/// A raw response. Status codes are not interpreted here.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
    pub retry_after: Option<Duration>,
}

impl Response {
    /// Create a JSON response.
    pub fn json(status: u16, value: &Value) -> Self {
        Self {
            status,
            body: value.to_string().into_bytes(),
            retry_after: None,
        }
    }

    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends requests to the platform.
pub trait Transport: Send + Sync {
    /// Perform one HTTP exchange.
    ///
    /// Only transport-level failures are errors; HTTP error statuses are
    /// returned as a [`Response`] for the client to classify.
    fn send(&self, request: &Request) -> Result<Response>;
}

/// Blocking HTTP transport backed by `ureq`.
pub struct UreqTransport {
    agent: ureq::Agent,
    api_base: String,
}

impl UreqTransport {
    /// Create a transport with a per-call timeout.
    pub fn new(api_base: impl Into<String>, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    /// Get the API base URL.
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }
}

/// Apply auth, extra headers and query pairs to a ureq request builder.
macro_rules! prepare {
    ($builder:expr, $request:expr) => {{
        let mut builder = $builder.header("Authorization", &format!("Bearer {}", $request.bearer));
        for (name, value) in &$request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        for (key, value) in &$request.query {
            builder = builder.query(key.as_str(), value.as_str());
        }
        builder
    }};
}

impl Transport for UreqTransport {
    fn send(&self, request: &Request) -> Result<Response> {
        let url = self.url(&request.path);
        log::debug!("{} {}", request.method, url);

        let result = match (&request.method, &request.payload) {
            (Method::Get, _) => prepare!(self.agent.get(&url), request).call(),
            (Method::Delete, _) => prepare!(self.agent.delete(&url), request).call(),
            (Method::Post, Payload::Empty) => prepare!(self.agent.post(&url), request).send_empty(),
            (Method::Post, Payload::Json(value)) => {
                prepare!(self.agent.post(&url), request).send_json(value)
            }
            (Method::Post, Payload::Bytes { content_type, data }) => {
                prepare!(self.agent.post(&url), request)
                    .header("Content-Type", content_type.as_str())
                    .send(data.as_slice())
            }
        };

        let mut response = result?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        let body = response
            .body_mut()
            .with_config()
            .limit(MAX_BODY_SIZE)
            .read_to_vec()
            .map_err(|e| Error::network(e.to_string()))?;

        Ok(Response {
            status,
            body,
            retry_after,
        })
    }
}

/// Minimal `multipart/form-data` encoder for file-bearing endpoints.
#[derive(Debug, Default)]
pub struct Multipart {
    fields: Vec<(String, Option<String>, Vec<u8>)>,
}

impl Multipart {
    /// Create an empty form.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a text field.
    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.fields
            .push((name.to_string(), None, value.as_bytes().to_vec()));
        self
    }

    /// Add a file field.
    pub fn file(mut self, name: &str, filename: &str, data: Vec<u8>) -> Self {
        self.fields
            .push((name.to_string(), Some(filename.to_string()), data));
        self
    }

    /// Encode into a payload with a boundary derived from the content.
    pub fn into_payload(self) -> Payload {
        let mut hasher = blake3::Hasher::new();
        for (name, _, data) in &self.fields {
            hasher.update(name.as_bytes());
            hasher.update(data);
        }
        let digest = hasher.finalize().to_hex();
        let boundary = format!("orgform-{}", &digest[..24]);

        let mut body = Vec::new();
        for (name, filename, data) in self.fields {
            body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            match filename {
                Some(filename) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                             Content-Type: application/octet-stream\r\n\r\n"
                        )
                        .as_bytes(),
                    );
                }
                None => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                    );
                }
            }
            body.extend_from_slice(&data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

        Payload::Bytes {
            content_type: format!("multipart/form-data; boundary={boundary}"),
            data: body,
        }
    }
}
