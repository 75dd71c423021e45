//! Error taxonomy shared by the lifecycle engine and its front ends.

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The image builder exited non-zero or the service type has no recipe.
    #[error("failed to build image '{image}': {output}")]
    BuildFailure { image: String, output: String },

    /// The container runtime refused to start or stop a container.
    #[error("container runtime failure for '{container}': {reason}")]
    RuntimeFailure { container: String, reason: String },

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("{kind} already exists: {name}")]
    Conflict { kind: &'static str, name: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn conflict(kind: &'static str, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            name: name.into(),
        }
    }

    /// Client errors are reported verbatim; everything else is hidden behind a trace id.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::Unauthorized(_)
                | Self::ConfigurationError(_)
                | Self::Conflict { .. }
        )
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(error: sqlx::Error) -> Self {
        Self::Internal(error.into())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        Self::Internal(error.into())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(error: std::io::Error) -> Self {
        Self::Internal(error.into())
    }
}
