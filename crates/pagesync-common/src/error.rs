//! Error types shared by every pagesync crate.

use miette::Diagnostic;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Whether a failed remote call is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorClass {
    /// Rate limiting, timeouts, conflicts and 5xx responses.
    Transient,
    /// Validation and permission failures. Never retried.
    Permanent,
}

/// A failed call against the remote workspace API.
#[derive(Debug, Clone, Error, Diagnostic)]
#[error("{operation} failed ({}): {message}", code.as_deref().unwrap_or("no code"))]
#[diagnostic(code(pagesync::remote))]
pub struct RemoteError {
    pub operation: &'static str,
    pub class: RemoteErrorClass,
    /// HTTP status, when the failure came from a response.
    pub status: Option<u16>,
    /// Remote error code such as `rate_limited` or `validation_error`.
    pub code: Option<String>,
    pub message: String,
    /// Delay the remote asked for before the next attempt.
    pub retry_after: Option<Duration>,
}

impl RemoteError {
    pub fn transient(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            class: RemoteErrorClass::Transient,
            status: None,
            code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn permanent(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            class: RemoteErrorClass::Permanent,
            status: None,
            code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Build an error from a response status, classifying it.
    pub fn from_status(
        operation: &'static str,
        status: u16,
        code: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            class: classify_status(status),
            status: Some(status),
            code,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn is_transient(&self) -> bool {
        self.class == RemoteErrorClass::Transient
    }
}

/// 429, 409 and the gateway-ish 5xx codes are retried; everything else is final.
pub fn classify_status(status: u16) -> RemoteErrorClass {
    match status {
        409 | 429 | 500 | 502 | 503 | 504 => RemoteErrorClass::Transient,
        _ => RemoteErrorClass::Permanent,
    }
}

/// Configuration errors
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("missing required environment variable: {var}")]
    #[diagnostic(
        code(config::missing_env),
        help("set {var} in the environment or in a .env file")
    )]
    MissingEnv { var: &'static str },

    #[error("invalid value for {var}: {value}")]
    #[diagnostic(code(config::invalid_env))]
    InvalidEnv { var: &'static str, value: String },

    #[error("failed to parse URL {url}: {message}")]
    #[diagnostic(code(config::url_parse))]
    UrlParse { url: String, message: String },
}

/// Identity map persistence errors
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("failed to read identity map at {}", path.display())]
    #[diagnostic(code(store::read))]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write identity map at {}", path.display())]
    #[diagnostic(code(store::write))]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("identity map at {} is not valid JSON", path.display())]
    #[diagnostic(
        code(store::parse),
        help("delete the file to force a full republish")
    )]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize identity map")]
    #[diagnostic(code(store::serialize))]
    Serialize(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(429), RemoteErrorClass::Transient);
        assert_eq!(classify_status(503), RemoteErrorClass::Transient);
        assert_eq!(classify_status(409), RemoteErrorClass::Transient);
        assert_eq!(classify_status(400), RemoteErrorClass::Permanent);
        assert_eq!(classify_status(403), RemoteErrorClass::Permanent);
        assert_eq!(classify_status(404), RemoteErrorClass::Permanent);
    }

    #[test]
    fn display_includes_code() {
        let err = RemoteError::from_status(
            "append_block_children",
            400,
            Some("validation_error".into()),
            "body failed validation",
        );
        assert_eq!(
            err.to_string(),
            "append_block_children failed (validation_error): body failed validation"
        );
        assert!(!err.is_transient());
    }
}
