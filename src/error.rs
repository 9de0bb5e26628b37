//! Error type shared by every component of the runtime.
//!
//! Precondition violations (scheduling on a stopped actor, touching an
//! undeclared item field, registering a processor after start) are returned
//! synchronously at the call site. Fetch failures travel back across the
//! bridge to the awaiting action. Action and callback failures never cross an
//! actor boundary: they are logged where they happen.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = SpiderError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SpiderError {
    /// The actor is stopping or stopped and no longer accepts work.
    #[error("actor '{0}' is not accepting work")]
    ActorStopped(String),

    /// The operation is not valid for the actor's current lifecycle state.
    #[error("actor '{actor}': {reason}")]
    InvalidState { actor: String, reason: String },

    /// A unit of work scheduled on an actor was dropped before it produced a result.
    #[error("work scheduled on actor '{0}' was cancelled")]
    Cancelled(String),

    /// The action queue has begun stopping.
    #[error("action queue of spider '{0}' is closed")]
    SchedulerClosed(String),

    /// The operation must run on an actor thread.
    #[error("not running on an actor thread")]
    NotInActor,

    #[error("item '{item}' has no field named '{field}'")]
    UnknownField { item: String, field: String },

    #[error("field '{field}' of item '{item}' is not set")]
    MissingField { item: String, field: String },

    #[error("processor '{0}' is already registered")]
    DuplicateProcessor(String),

    #[error("processor '{0}' is not registered")]
    UnknownProcessor(String),

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("response body is not valid {0}")]
    Decode(&'static str),

    #[error("invalid settings: {0}")]
    Settings(String),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    GeneralError(String),
}

impl SpiderError {
    /// Returns `true` for failures that mean the work never ran to completion
    /// because its actor went away.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SpiderError::Cancelled(_) | SpiderError::ActorStopped(_))
    }

    pub(crate) fn invalid_state(actor: &str, reason: impl Into<String>) -> Self {
        SpiderError::InvalidState {
            actor: actor.to_string(),
            reason: reason.into(),
        }
    }
}
