//! Judge backend abstractions for labelwise-runtime.
//!
//! A backend turns one [`PromptView`] into one [`JudgeResponse`]. Everything
//! above it (retry, breaker, cache, averaging, voting) is backend-agnostic.
//!
//! ## Security
//!
//! Backends load API keys through the [`secrets`] module so keys never reach
//! logs or error messages.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use labelwise_core::{FailureKind, JudgeResponse, Label, PromptView};

mod factory;
pub mod secrets;

#[cfg(feature = "openai")]
mod openai;

pub use factory::{BackendFactory, BackendRegistry};
pub use secrets::{ApiCredential, CredentialSource};

#[cfg(feature = "openai")]
pub use openai::{OpenAiBackend, OpenAiBackendFactory};

/// Errors from judge backends.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Server error ({status:?}): {message}")]
    ServerError { status: Option<u16>, message: String },

    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Backend not configured: {0}")]
    NotConfigured(String),

    #[error("Backend '{backend}' halted: {reason}")]
    Halted { backend: String, reason: String },
}

impl BackendError {
    pub fn server(status: Option<u16>, message: impl Into<String>) -> Self {
        BackendError::ServerError {
            status,
            message: message.into(),
        }
    }

    /// Failure classification used by the retry policy.
    pub fn kind(&self) -> FailureKind {
        match self {
            BackendError::RateLimited { .. } => FailureKind::RateLimited,
            BackendError::Timeout(_) => FailureKind::Timeout,
            BackendError::ServerError { .. } | BackendError::Halted { .. } => {
                FailureKind::ServerError
            }
            BackendError::AuthError(_) => FailureKind::AuthError,
            // A missing key or endpoint does not heal between attempts.
            BackendError::MalformedRequest(_) | BackendError::NotConfigured(_) => {
                FailureKind::MalformedRequest
            }
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }

    /// Server-provided wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            BackendError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// A chat message sent to a chat-completions style backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role: "system", "user", or "assistant"
    pub role: String,

    /// Message content
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Backend abstraction allows swapping model providers.
///
/// This is the only place where model calls are made. Implementations make
/// exactly one request per `invoke` and never retry internally.
#[async_trait]
pub trait JudgeBackend: Send + Sync {
    /// Classify one prompt view.
    async fn invoke(&self, view: &PromptView) -> Result<JudgeResponse, BackendError>;

    /// Explain why `label` fits `view`, in a request separate from
    /// classification. `Ok(None)` when the backend cannot explain.
    async fn explain(&self, _view: &PromptView, _label: Label) -> Result<Option<String>, BackendError> {
        Ok(None)
    }

    /// Check if the backend is usable.
    async fn health_check(&self) -> bool {
        true
    }

    /// Backend name for logs and error messages.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(
            BackendError::RateLimited { retry_after: None }.kind(),
            FailureKind::RateLimited
        );
        assert_eq!(
            BackendError::Timeout(Duration::from_secs(1)).kind(),
            FailureKind::Timeout
        );
        assert_eq!(
            BackendError::server(Some(503), "unavailable").kind(),
            FailureKind::ServerError
        );
        assert!(BackendError::AuthError("bad key".into()).is_fatal());
        assert!(BackendError::MalformedRequest("bad body".into()).is_fatal());
        assert!(BackendError::NotConfigured("no key".into()).is_fatal());
        assert!(!BackendError::Timeout(Duration::from_secs(1)).is_fatal());
    }

    #[test]
    fn test_retry_after_hint() {
        let err = BackendError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(BackendError::server(None, "x").retry_after(), None);
    }

    #[test]
    fn test_chat_message_roles() {
        assert_eq!(ChatMessage::system("s").role, "system");
        assert_eq!(ChatMessage::user("u").role, "user");
    }
}
