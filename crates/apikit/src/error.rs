//! Error types for platform API operations.
//!
//! Errors are categorized so the reconciliation layer can decide what to
//! retry, what to self-heal and what to surface to the operator. Every
//! variant keeps the raw remote message so fatal errors can be reported
//! verbatim.

use serde_json::Value;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for platform API operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Categories of platform errors for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connection, timeout or server-side failure (transient, retryable).
    Network,
    /// Request was throttled (retryable, may carry a server hint).
    RateLimited,
    /// Remote object does not exist.
    NotFound,
    /// Remote object conflicts with an existing one.
    Conflict,
    /// Request rejected as malformed, locally or remotely.
    Validation,
    /// Credentials missing or lacking the required scope.
    Permission,
    /// Protocol-sequence violation (e.g. adding a part after completion).
    State,
    /// Any other non-success HTTP status.
    Api,
    /// Response body could not be decoded.
    Format,
    /// Local filesystem error.
    Io,
}

impl ErrorCategory {
    /// Whether this error category is typically transient and worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network | Self::RateLimited)
    }

    /// Get a user-friendly description of this error category.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Network => "Network connectivity issue",
            Self::RateLimited => "Rate limited by the platform",
            Self::NotFound => "Remote object not found",
            Self::Conflict => "Remote object conflict",
            Self::Validation => "Invalid request",
            Self::Permission => "Permission denied",
            Self::State => "Invalid operation sequence",
            Self::Api => "Unexpected API response",
            Self::Format => "Invalid response format",
            Self::Io => "Local file error",
        }
    }

    /// Get actionable advice for resolving this error category.
    #[must_use]
    pub fn advice(&self) -> &'static str {
        match self {
            Self::Network => "Check your connection and try again",
            Self::RateLimited => "Wait for the rate limit window to reset, or lower --jobs",
            Self::NotFound => "The object may have been deleted outside of orgform",
            Self::Conflict => "Import the existing object or rename the declared one",
            Self::Validation => "Fix the declared attributes and re-run",
            Self::Permission => "Provide an admin key for organization-level resources",
            Self::State => "Re-run the pass; an upload may need a fresh session",
            Self::Api => "Check the error details for more information",
            Self::Format => "The platform returned an unexpected payload",
            Self::Io => "Check that local input files exist and are readable",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self, self.description())
    }
}

/// Why a request was refused on permission grounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionKind {
    /// A key exists but lacks the scope the endpoint needs.
    MissingScope,
    /// No usable credential at all.
    MissingAuth,
}

impl fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingScope => write!(f, "missing scope"),
            Self::MissingAuth => write!(f, "missing auth"),
        }
    }
}

/// Errors that can occur while talking to the platform.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport failure or 5xx response.
    #[error("network error: {message}")]
    TransientNetwork {
        /// Raw failure message
        message: String,
    },

    /// HTTP 429.
    #[error("rate limited: {message}")]
    RateLimited {
        /// Raw remote message
        message: String,
        /// Server-supplied `Retry-After`, if any
        retry_after: Option<Duration>,
    },

    /// HTTP 404.
    #[error("not found: {message}")]
    NotFound {
        /// Raw remote message
        message: String,
    },

    /// HTTP 409.
    #[error("conflict: {message}")]
    Conflict {
        /// Raw remote message
        message: String,
    },

    /// HTTP 400/422, or a local check made before any remote call.
    #[error("validation error: {message}")]
    Validation {
        /// Description of the violation
        message: String,
    },

    /// HTTP 401/403, or a scope check made before any remote call.
    #[error("permission denied ({kind}): {message}")]
    PermissionDenied {
        /// Missing scope vs missing auth
        kind: PermissionKind,
        /// Raw remote message or local explanation
        message: String,
    },

    /// Protocol-sequence violation. Never retried.
    #[error("invalid state: {message}")]
    State {
        /// Description of the violation
        message: String,
    },

    /// Any other non-success status.
    #[error("API error (HTTP {status}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Raw remote message
        message: String,
    },

    /// Response body could not be decoded.
    #[error("invalid API response: {0}")]
    InvalidResponse(String),

    /// Local IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a state error.
    pub fn state(message: impl Into<String>) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a transient network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::TransientNetwork {
            message: message.into(),
        }
    }

    /// Build an error from a non-success HTTP response.
    ///
    /// The message is taken from the platform's `{"error": {"message": ...}}`
    /// envelope when present, otherwise from the raw body.
    pub fn from_status(status: u16, body: &[u8], retry_after: Option<Duration>) -> Self {
        let message = remote_message(body).unwrap_or_else(|| format!("HTTP {status}"));

        match status {
            429 => Self::RateLimited {
                message,
                retry_after,
            },
            408 | 500..=599 => Self::TransientNetwork { message },
            404 => Self::NotFound { message },
            409 => Self::Conflict { message },
            400 | 422 => Self::Validation { message },
            401 => Self::PermissionDenied {
                kind: PermissionKind::MissingAuth,
                message,
            },
            403 => Self::PermissionDenied {
                kind: PermissionKind::MissingScope,
                message,
            },
            _ => Self::Api { status, message },
        }
    }

    /// Get the error category for retry logic.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::TransientNetwork { .. } => ErrorCategory::Network,
            Error::RateLimited { .. } => ErrorCategory::RateLimited,
            Error::NotFound { .. } => ErrorCategory::NotFound,
            Error::Conflict { .. } => ErrorCategory::Conflict,
            Error::Validation { .. } => ErrorCategory::Validation,
            Error::PermissionDenied { .. } => ErrorCategory::Permission,
            Error::State { .. } => ErrorCategory::State,
            Error::Api { .. } => ErrorCategory::Api,
            Error::InvalidResponse(_) => ErrorCategory::Format,
            Error::Io(_) => ErrorCategory::Io,
        }
    }

    /// Whether this error is typically transient and worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Whether the remote object is gone.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Server-supplied retry hint, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::StatusCode(code) => Self::from_status(code, &[], None),
            ureq::Error::Timeout(_)
            | ureq::Error::Io(_)
            | ureq::Error::ConnectionFailed
            | ureq::Error::HostNotFound => Self::TransientNetwork {
                message: err.to_string(),
            },
            other => Self::Api {
                status: 0,
                message: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidResponse(err.to_string())
    }
}

/// Extract the human-readable message from an error body.
fn remote_message(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        let nested = value
            .get("error")
            .and_then(|e| e.get("message").or(Some(e)))
            .and_then(Value::as_str);
        if let Some(message) = nested {
            return Some(message.to_string());
        }
    }

    let text = String::from_utf8_lossy(body).trim().to_string();
    if text.is_empty() { None } else { Some(text) }
}
