use crate::domain::schedule::ScheduleError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Credential error: {0}")]
    Credential(String),
    #[error("Collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),
    #[error("No filter client identifier for {0}")]
    NoIdentifier(String),
    #[error("Action failed: {0}")]
    ActionFailed(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("State error: {0}")]
    State(String),
}

impl From<ScheduleError> for InfraError {
    fn from(error: ScheduleError) -> Self {
        InfraError::InvalidConfig(error.to_string())
    }
}

impl InfraError {
    pub fn lock_poisoned(name: &str, error: impl std::fmt::Display) -> Self {
        InfraError::State(format!("{name} lock poisoned: {error}"))
    }

    /// True for failures that abort a recalculation pass and are retried on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InfraError::CollaboratorUnavailable(_) | InfraError::Io(_) | InfraError::Sqlite(_)
        )
    }
}
