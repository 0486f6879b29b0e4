//! Unified error handling for the kestrel crate
//!
//! Each module defines its own error enum; this module provides a single
//! `Error` wrapping them all for use across module boundaries, plus a
//! coarse category classification for handling strategies.
//!
//! # Usage
//!
//! ```rust,ignore
//! use kestrel::error::{Error, ErrorCategory};
//!
//! fn handle_error(err: Error) {
//!     if err.is_recoverable() {
//!         tracing::warn!("Retrying: {}", err);
//!     } else {
//!         tracing::error!("Fatal error: {}", err);
//!     }
//! }
//! ```

use std::io;
use thiserror::Error as ThisError;

// Re-export domain-specific errors for convenience
pub use crate::catalog::CatalogError;
pub use crate::collector::client::ClientError;
pub use crate::collector::runtime::RuntimeError;
pub use crate::collector::sources::PollError;
pub use crate::dispatcher::config::ConfigError;
pub use crate::dispatcher::registry::RegistryError;
pub use crate::dispatcher::router::SubmitError;
pub use crate::dispatcher::server::ServerError;
pub use crate::dispatcher::store::TaskError;
pub use crate::dispatcher::users::AuthError;

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Network-related errors (HTTP, timeout, unreachable dispatcher)
    Network,
    /// Feed parsing and data extraction errors
    Parsing,
    /// Authentication and session errors
    Auth,
    /// Task lifecycle and routing errors
    Coordination,
    /// Configuration and validation errors
    Config,
    /// Storage and I/O errors
    Storage,
    /// Other/unknown errors
    Other,
}

/// Unified error type for the kestrel crate
///
/// Wraps all domain-specific errors, providing a single error type usable
/// across module boundaries while preserving the detailed error information.
#[derive(ThisError, Debug)]
pub enum Error {
    /// Collector registry errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Client account errors
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    /// Task store errors
    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    /// Result submission errors
    #[error("Submit error: {0}")]
    Submit(#[from] SubmitError),

    /// Source catalog errors
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Dispatcher server errors
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    /// Dispatcher client errors (collector side)
    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    /// Feed polling errors
    #[error("Poll error: {0}")]
    Poll(#[from] PollError),

    /// Collector runtime errors
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other errors with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Create a config error from a message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(ConfigError::InvalidValue {
            field: "general".to_string(),
            reason: msg.into(),
        })
    }

    /// Create an "other" error with context
    pub fn other(context: impl Into<String>) -> Self {
        Self::Other {
            context: context.into(),
            source: None,
        }
    }

    /// Create an "other" error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Check if this error is recoverable (worth retrying)
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Client(e) => matches!(
                e,
                ClientError::NetworkError(_) | ClientError::HttpError { status: 500..=599, .. }
            ),
            Self::Poll(e) => matches!(
                e,
                PollError::Request { .. } | PollError::Status { status: 500..=599, .. }
            ),
            Self::Io(_) => true,
            _ => false,
        }
    }

    /// Get the error category for handling strategies
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Client(_) => ErrorCategory::Network,
            Self::Poll(PollError::Parse { .. }) => ErrorCategory::Parsing,
            Self::Poll(_) => ErrorCategory::Network,
            Self::Registry(_) | Self::Auth(_) => ErrorCategory::Auth,
            Self::Task(_) | Self::Submit(_) => ErrorCategory::Coordination,
            Self::Config(_) => ErrorCategory::Config,
            Self::Server(_) | Self::Runtime(_) => ErrorCategory::Config,
            Self::Catalog(_) | Self::Io(_) | Self::Json(_) => ErrorCategory::Storage,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other {
            context: err.to_string(),
            source: None,
        }
    }
}

/// Result type alias using the unified error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_domain() {
        let err: Error = RegistryError::InvalidCredentials.into();
        assert!(err.to_string().contains("Registry error"));
    }

    #[test]
    fn test_recoverable_classification() {
        let network: Error = ClientError::NetworkError("timeout".to_string()).into();
        assert!(network.is_recoverable());

        let auth: Error = AuthError::InvalidCredentials.into();
        assert!(!auth.is_recoverable());

        let bad_request: Error = ClientError::HttpError {
            status: 400,
            message: String::new(),
        }
        .into();
        assert!(!bad_request.is_recoverable());
    }

    #[test]
    fn test_categories() {
        let err: Error = SubmitError::InvalidToken.into();
        assert_eq!(err.category(), ErrorCategory::Coordination);

        let err: Error = ClientError::NetworkError("x".to_string()).into();
        assert_eq!(err.category(), ErrorCategory::Network);
    }

    #[test]
    fn test_other_with_source() {
        let io_err = io::Error::new(io::ErrorKind::Other, "disk full");
        let err = Error::with_source("while saving", io_err);
        assert_eq!(err.to_string(), "while saving");
        assert!(std::error::Error::source(&err).is_some());
    }
}
