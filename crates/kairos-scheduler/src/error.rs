use kairos_core::{KairosError, TriggerKind};
use kairos_store::StoreError;
use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The task subsystem is disabled or the engine is not running.
    #[error("scheduled task engine is not active: {0}")]
    EngineNotActive(String),

    /// `start()` was called on an engine that has already been shut down.
    #[error("scheduled task engine has been shut down; construct a new engine to restart")]
    EngineShutDown,

    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    /// Interval expressions take exactly five fields.
    #[error("invalid interval expression {expression:?}: {reason}")]
    InvalidIntervalExpression { expression: String, reason: String },

    /// An interval field is neither an integer nor `*`.
    #[error("invalid interval field {field}: {value:?}")]
    InvalidIntervalField { field: &'static str, value: String },

    #[error("invalid date expression {expression:?}")]
    InvalidDateExpression { expression: String },

    #[error("unknown timezone: {0}")]
    InvalidTimezone(String),

    /// The trigger kind needs an expression and none was given.
    #[error("{kind} trigger requires an expression")]
    MissingExpression { kind: TriggerKind },

    /// The trigger has no fire time inside its bounds.
    #[error("trigger for job {id} will never fire")]
    TriggerNeverFires { id: String },

    /// No handler is registered under the module part of the reference.
    #[error("handler module not found: {0}")]
    HandlerModuleNotFound(String),

    /// The module is known but the symbol is not registered in it.
    #[error("handler class not found: {0}")]
    HandlerClassNotFound(String),

    /// The parameter bag does not construct the handler.
    #[error("handler parameters {params:?} rejected: {reason}")]
    HandlerParamError { params: String, reason: String },

    #[error("job already exists: {id}")]
    JobAlreadyExists { id: String },

    #[error("job not found: {id}")]
    JobNotFound { id: String },

    /// Active tasks must be stopped before they can be deleted.
    #[error("task {id} is still active; stop it first")]
    TaskStillActive { id: String },

    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SchedulerError {
    /// Short, stable error code for logs and API layers.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::EngineNotActive(_) => "ENGINE_NOT_ACTIVE",
            SchedulerError::EngineShutDown => "ENGINE_SHUT_DOWN",
            SchedulerError::InvalidCronExpression { .. } => "INVALID_CRON_EXPRESSION",
            SchedulerError::InvalidIntervalExpression { .. } => "INVALID_INTERVAL_EXPRESSION",
            SchedulerError::InvalidIntervalField { .. } => "INVALID_INTERVAL_FIELD",
            SchedulerError::InvalidDateExpression { .. } => "INVALID_DATE_EXPRESSION",
            SchedulerError::InvalidTimezone(_) => "INVALID_TIMEZONE",
            SchedulerError::MissingExpression { .. } => "MISSING_EXPRESSION",
            SchedulerError::TriggerNeverFires { .. } => "TRIGGER_NEVER_FIRES",
            SchedulerError::HandlerModuleNotFound(_) => "HANDLER_MODULE_NOT_FOUND",
            SchedulerError::HandlerClassNotFound(_) => "HANDLER_CLASS_NOT_FOUND",
            SchedulerError::HandlerParamError { .. } => "HANDLER_PARAM_ERROR",
            SchedulerError::JobAlreadyExists { .. } => "JOB_ALREADY_EXISTS",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::TaskStillActive { .. } => "TASK_STILL_ACTIVE",
            SchedulerError::Config(_) => "CONFIG_ERROR",
            SchedulerError::Store(_) => "STORE_ERROR",
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Malformed trigger input, surfaced before any registration attempt.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SchedulerError::InvalidCronExpression { .. }
                | SchedulerError::InvalidIntervalExpression { .. }
                | SchedulerError::InvalidIntervalField { .. }
                | SchedulerError::InvalidDateExpression { .. }
                | SchedulerError::InvalidTimezone(_)
                | SchedulerError::MissingExpression { .. }
                | SchedulerError::TriggerNeverFires { .. }
        )
    }

    /// Handler lookup or construction failed.
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            SchedulerError::HandlerModuleNotFound(_)
                | SchedulerError::HandlerClassNotFound(_)
                | SchedulerError::HandlerParamError { .. }
        )
    }
}

impl From<KairosError> for SchedulerError {
    fn from(e: KairosError) -> Self {
        match e {
            KairosError::InvalidTimezone(name) => SchedulerError::InvalidTimezone(name),
            KairosError::Serialization(e) => SchedulerError::Serialization(e),
            KairosError::Config(msg) => SchedulerError::Config(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_keep_their_meaning() {
        let err = SchedulerError::from(KairosError::Config("bad toml".to_string()));
        assert!(matches!(&err, SchedulerError::Config(msg) if msg == "bad toml"));
        assert_eq!(err.code(), "CONFIG_ERROR");
        assert!(!err.is_validation());

        let err = SchedulerError::from(KairosError::InvalidTimezone("Mars/Base".to_string()));
        assert!(err.is_validation());
        assert_eq!(err.code(), "INVALID_TIMEZONE");
    }
}
