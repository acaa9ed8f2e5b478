use thiserror::Error;

use crate::action::ActionStatus;

#[derive(Debug, Error)]
pub enum TickdError {
    #[error("store error: {0}")]
    Store(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("action not found: {0}")]
    ActionNotFound(String),

    #[error("invalid transition for action {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: ActionStatus,
        to: ActionStatus,
    },

    #[error("unknown action type '{0}'")]
    InvalidActionType(String),

    #[error("unknown mode '{0}': must be proof or real")]
    InvalidMode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for TickdError {
    fn from(e: rusqlite::Error) -> Self {
        TickdError::Store(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TickdError>;
