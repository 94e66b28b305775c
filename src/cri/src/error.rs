//! CRI error type and its mapping onto gRPC status codes.

use kiln_core::error::KilnError;
use thiserror::Error;
use tonic::Status;

/// Errors returned by the CRI services.
#[derive(Debug, Error)]
pub enum CriError {
    /// Malformed request
    #[error("{0}")]
    InvalidArgument(String),

    /// Unknown sandbox, container or image
    #[error("{0}")]
    NotFound(String),

    /// Duplicate id or name
    #[error("{0}")]
    AlreadyExists(String),

    /// Operation not valid in the current state
    #[error("{0}")]
    FailedPrecondition(String),

    /// The daemon is shutting down
    #[error("{0}")]
    Cancelled(String),

    #[error("{0}")]
    Unimplemented(String),

    /// Collaborator failure or internal invariant violation
    #[error("{0}")]
    Internal(String),

    /// Typed collaborator error
    #[error(transparent)]
    Kiln(#[from] KilnError),
}

/// Result type for CRI operations.
pub type Result<T> = std::result::Result<T, CriError>;

impl CriError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(kind: &str, id: &str) -> Self {
        Self::NotFound(format!("{} {} not found", kind, id))
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::FailedPrecondition(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Wrap a collaborator failure with the verb and id it happened in.
    ///
    /// Image errors keep their type so they map to their own status codes;
    /// everything else becomes `Internal`.
    pub fn collaborator(verb: &str, id: &str, err: KilnError) -> Self {
        match err {
            KilnError::ImageNotFound(_)
            | KilnError::RegistryAuthError { .. }
            | KilnError::RegistryError { .. }
            | KilnError::InvalidImageReference(_) => Self::Kiln(err),
            other => Self::Internal(format!("{} {}: {}", verb, id, other)),
        }
    }
}

impl From<CriError> for Status {
    fn from(err: CriError) -> Self {
        match err {
            CriError::InvalidArgument(msg) => Status::invalid_argument(msg),
            CriError::NotFound(msg) => Status::not_found(msg),
            CriError::AlreadyExists(msg) => Status::already_exists(msg),
            CriError::FailedPrecondition(msg) => Status::failed_precondition(msg),
            CriError::Cancelled(msg) => Status::cancelled(msg),
            CriError::Unimplemented(msg) => Status::unimplemented(msg),
            CriError::Internal(msg) => Status::internal(msg),
            CriError::Kiln(err) => kiln_error_to_status(err),
        }
    }
}

/// Convert a KilnError to a gRPC Status.
pub fn kiln_error_to_status(err: KilnError) -> Status {
    match err {
        KilnError::ImageNotFound(msg) => Status::not_found(format!("image not found: {}", msg)),
        KilnError::RegistryAuthError { registry, message } => {
            Status::permission_denied(format!("{}: {}", registry, message))
        }
        KilnError::RegistryError { registry, message } => {
            Status::unavailable(format!("{}: {}", registry, message))
        }
        KilnError::InvalidImageReference(msg) => Status::invalid_argument(msg),
        KilnError::ConfigError(msg) => Status::invalid_argument(msg),
        KilnError::TimeoutError(msg) => Status::deadline_exceeded(msg),
        other => Status::internal(other.to_string()),
    }
}
