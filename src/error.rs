//! Error types for anvilq operations.

use thiserror::Error;

/// Result type used throughout anvilq.
pub type AnvilResult<T> = Result<T, AnvilError>;

/// Main error type for anvilq operations.
#[derive(Error, Debug)]
pub enum AnvilError {
    /// Broker connection failed or was lost
    #[error("Connection error: {message}")]
    Connection {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The channel is currently disconnected from the broker
    #[error("Not connected to broker")]
    NotConnected,

    /// A task envelope could not be serialized
    #[error("Encode error: {0}")]
    Encode(#[source] serde_json::Error),

    /// Bytes received from the broker are not a valid envelope
    #[error("Decode error: {0}")]
    Decode(#[source] serde_json::Error),

    /// The broker refused a publish (queue full, publish nacked)
    #[error("Publish rejected by broker: {message}")]
    PublishRejected {
        /// Error message
        message: String,
    },

    /// Handler failed in a way that may succeed on retry
    #[error("Transient handler failure: {message}")]
    HandlerTransient {
        /// Error message
        message: String,
    },

    /// Handler failed in a way that will never succeed
    #[error("Permanent handler failure: {message}")]
    HandlerPermanent {
        /// Error message
        message: String,
    },

    /// Operation timed out
    #[error("Operation timed out after {timeout_ms} ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Unrecoverable condition (declaration mismatch, auth failure)
    #[error("Fatal error: {message}")]
    Fatal {
        /// Error message
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Error message
        message: String,
    },

    /// Anvil is already running
    #[error("Anvil is already running")]
    AlreadyRunning,

    /// Anvil is not running
    #[error("Anvil is not running")]
    NotRunning,

    /// AMQP protocol error
    #[cfg(feature = "amqp")]
    #[cfg_attr(docsrs, doc(cfg(feature = "amqp")))]
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
}

impl AnvilError {
    /// Create a new connection error
    pub fn connection<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a connection error without an underlying cause
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a publish rejection
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::PublishRejected {
            message: message.into(),
        }
    }

    /// Handler failure worth retrying
    pub fn transient(message: impl Into<String>) -> Self {
        Self::HandlerTransient {
            message: message.into(),
        }
    }

    /// Handler failure that no retry will fix
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::HandlerPermanent {
            message: message.into(),
        }
    }

    /// Create a fatal error
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. }
            | Self::NotConnected
            | Self::PublishRejected { .. }
            | Self::HandlerTransient { .. }
            | Self::Timeout { .. } => true,
            #[cfg(feature = "amqp")]
            Self::Amqp(_) => true,
            _ => false,
        }
    }

    /// Whether the error should terminate the affected process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    /// Whether the broker is unreachable right now (surfaced as 503 upstream).
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::NotConnected | Self::PublishRejected { .. } => true,
            #[cfg(feature = "amqp")]
            Self::Amqp(_) => true,
            _ => false,
        }
    }
}
