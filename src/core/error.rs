use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunStateError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Tag '{tag}' is already held by active run '{holder}'")]
    AlreadyOwned { tag: String, holder: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Run '{0}' already exists")]
    RunExists(String),

    #[error("Stream '{stream}' read error: {message}")]
    StreamRead { stream: String, message: String },

    #[error("Patch error: {0}")]
    Patch(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Closed: {0}")]
    Closed(String),
}

impl RunStateError {
    pub fn stream_read(stream: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StreamRead {
            stream: stream.into(),
            message: message.into(),
        }
    }

    /// Errors a caller may reasonably retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Backend(_) | Self::StreamRead { .. } | Self::LockError(_)
        )
    }

    /// True for a unique claim rejected because a live run holds the tag.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::AlreadyOwned { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, RunStateError>;

impl<T> From<std::sync::PoisonError<T>> for RunStateError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for RunStateError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<json_patch::PatchError> for RunStateError {
    fn from(err: json_patch::PatchError) -> Self {
        Self::Patch(err.to_string())
    }
}
