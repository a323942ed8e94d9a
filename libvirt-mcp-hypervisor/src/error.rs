//! Error types for the hypervisor layer.

use thiserror::Error;

/// Errors surfaced by connection, query and lifecycle operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HypervisorError {
    /// Transport or session failure. The caller must reconnect.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The hypervisor rejected the request, or the input was malformed.
    #[error("Operation failed: {0}")]
    Operation(String),

    /// Denied by policy before reaching the hypervisor.
    #[error("Permission denied: {0}")]
    Permission(String),

    /// The named object does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl HypervisorError {
    /// Stable identifier used in protocol-level error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection_error",
            Self::Operation(_) => "operation_error",
            Self::Permission(_) => "permission_error",
            Self::NotFound(_) => "not_found",
        }
    }

    /// The message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Connection(m) | Self::Operation(m) | Self::Permission(m) | Self::NotFound(m) => m,
        }
    }
}

/// Result type alias for hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;
