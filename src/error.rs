//! Error types for the plover kernel.

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the plover kernel.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session errors
    #[error("Session error: {0}")]
    Session(String),

    /// Session file not found
    #[error("Session not found: {path}")]
    SessionNotFound { path: String },

    /// An appended entry referenced an unknown parent id
    #[error("Detached parent: entry references unknown parent {parent_id}")]
    DetachedParent { parent_id: String },

    /// Provider/API errors
    #[error("Provider error: {provider}: {message}")]
    Provider { provider: String, message: String },

    /// Provider HTTP errors with a status code, used for retry classification
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Authentication errors
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Tool execution errors
    #[error("Tool error: {tool}: {message}")]
    Tool { tool: String, message: String },

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// User aborted operation
    #[error("Operation aborted")]
    Aborted,
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a session error.
    pub fn session(message: impl Into<String>) -> Self {
        Self::Session(message.into())
    }

    /// Create a provider error.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create an API error with an HTTP status.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Create an authentication error.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// Create a tool error.
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether this error is worth retrying with backoff.
    ///
    /// Network failures and HTTP 408/429/5xx are transient. Auth failures
    /// and other 4xx are not. Context overflow is handled by compaction,
    /// never by plain retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            Self::Api { status, .. } => {
                matches!(status, 408 | 429) || (500..600).contains(status)
            }
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    /// Whether the provider rejected the request because the context window
    /// was exceeded.
    pub fn is_context_overflow(&self) -> bool {
        let message = match self {
            Self::Api { status, message } => {
                if *status != 400 {
                    return false;
                }
                message.as_str()
            }
            Self::Provider { message, .. } => message.as_str(),
            _ => return false,
        };
        let lower = message.to_ascii_lowercase();
        lower.contains("prompt is too long")
            || (lower.contains("context")
                && (lower.contains("too long")
                    || lower.contains("exceed")
                    || lower.contains("maximum")
                    || lower.contains("overflow")))
    }
}
