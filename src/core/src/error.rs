use thiserror::Error;

/// Kiln error types
#[derive(Error, Debug)]
pub enum KilnError {
    /// Configuration is missing, unreadable or self-contradictory
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// OCI runtime or supervisor invocation failed
    #[error("Runtime error: {id}: {message}")]
    RuntimeError { id: String, message: String },

    /// Image reference cannot be parsed
    #[error("Invalid image reference: {0}")]
    InvalidImageReference(String),

    /// Image is not present in local storage or the registry
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    /// Registry rejected our credentials
    #[error("Registry authentication failed: {registry} - {message}")]
    RegistryAuthError { registry: String, message: String },

    /// Any other registry failure
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// Local image storage failure
    #[error("Image storage error: {0}")]
    ImageStoreError(String),

    /// Network namespace or CNI failure
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Exit artifact exists but cannot be interpreted
    #[error("Corrupt exit artifact {path}: {message}")]
    ExitArtifactError { path: String, message: String },

    /// Timeout error
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl KilnError {
    /// Shorthand for a runtime invocation failure on `id`.
    pub fn runtime(id: impl Into<String>, message: impl Into<String>) -> Self {
        KilnError::RuntimeError {
            id: id.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for KilnError {
    fn from(err: serde_yaml::Error) -> Self {
        KilnError::SerializationError(err.to_string())
    }
}

/// Result type alias for kiln operations
pub type Result<T> = std::result::Result<T, KilnError>;
