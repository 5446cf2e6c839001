/// Unified error handling for the slotgate proxy
///
/// Errors fall into three propagation classes: per-request errors become RESP
/// error replies, per-connection errors close one client connection, and
/// coordination errors are retried by the lifecycle watch loops.

use std::fmt;
use std::io;
use std::net::AddrParseError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::protocol::resp::RespParseError;

/// Main error type for proxy operations
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Framing-level decode failure; fatal to the one client connection
    #[error("Protocol error: {0}")]
    ProtocolDecode(#[from] RespParseError),

    /// Keys of a multi-key command hash to different slots
    #[error("Keys in request don't hash to the same slot")]
    CrossSlot,

    /// Pool exhausted, all servers unhealthy, or the slot is not served
    #[error("Backend unavailable: {message}")]
    BackendUnavailable { message: String },

    /// A read, write or watch against the coordination service failed
    #[error("Coordination service unavailable: {message}")]
    CoordinationUnavailable { message: String },

    /// An action log entry could not be decoded or applied
    #[error("Invalid action log entry {seq}: {message}")]
    InvalidActionLogEntry { seq: u64, message: String },

    /// Slot index outside of [0, slot_count)
    #[error("Invalid slot {slot} (slot count {slot_count})")]
    InvalidSlot { slot: usize, slot_count: usize },

    /// Command rejected by the router before reaching a backend
    #[error("{message}")]
    Command { message: String },

    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Address parsing errors
    #[error("Address parsing error: {0}")]
    AddressParse(#[from] AddrParseError),

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result type alias for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    pub fn backend_unavailable<S: Into<String>>(message: S) -> Self {
        ProxyError::BackendUnavailable {
            message: message.into(),
        }
    }

    pub fn coordination<S: Into<String>>(message: S) -> Self {
        ProxyError::CoordinationUnavailable {
            message: message.into(),
        }
    }

    pub fn invalid_action<S: Into<String>>(seq: u64, message: S) -> Self {
        ProxyError::InvalidActionLogEntry {
            seq,
            message: message.into(),
        }
    }

    pub fn command<S: Into<String>>(message: S) -> Self {
        ProxyError::Command {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        ProxyError::Timeout {
            operation: operation.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        ProxyError::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable (can retry)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProxyError::Network(_)
                | ProxyError::BackendUnavailable { .. }
                | ProxyError::CoordinationUnavailable { .. }
                | ProxyError::Timeout { .. }
        )
    }

    /// Whether the error must close the client connection it occurred on
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, ProxyError::ProtocolDecode(_) | ProxyError::Network(_))
    }

    /// RESP error message sent to the client for a per-request failure
    ///
    /// The first word follows the Redis convention of an upper-case error code.
    pub fn reply_message(&self) -> String {
        match self {
            ProxyError::CrossSlot => {
                "CROSSSLOT Keys in request don't hash to the same slot".to_string()
            }
            ProxyError::BackendUnavailable { message } => {
                format!("ERR backend unavailable: {}", message)
            }
            ProxyError::Timeout { operation } => format!("ERR timeout: {}", operation),
            ProxyError::ProtocolDecode(e) => format!("ERR Protocol error: {}", e),
            ProxyError::Command { message } => message.clone(),
            other => format!("ERR {}", other),
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ProxyError::Config(_) => ErrorSeverity::Critical,
            ProxyError::Internal { .. } => ErrorSeverity::Critical,
            ProxyError::InvalidSlot { .. } => ErrorSeverity::Critical,
            ProxyError::Network(_) => ErrorSeverity::Warning,
            ProxyError::BackendUnavailable { .. } => ErrorSeverity::Warning,
            ProxyError::CoordinationUnavailable { .. } => ErrorSeverity::Warning,
            ProxyError::InvalidActionLogEntry { .. } => ErrorSeverity::Warning,
            ProxyError::Timeout { .. } => ErrorSeverity::Warning,
            ProxyError::CrossSlot | ProxyError::Command { .. } => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}
