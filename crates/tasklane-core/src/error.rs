use thiserror::Error;

use crate::codec::CodecError;
use crate::ports::StoreError;

/// Operational classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Worth retrying later (store blip, lease race).
    Transient,
    /// Retrying cannot help (bad input, unknown function).
    Permanent,
    /// Backing infrastructure is down or misconfigured.
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("backing store: {0}")]
    Store(#[from] StoreError),

    #[error("serialization: {0}")]
    Codec(#[from] CodecError),

    #[error("configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Unknown task function: {0}")]
    UnknownFunction(String),

    #[error("duplicate task function: {0}")]
    DuplicateFunction(String),

    #[error("missing task functions: {0:?}")]
    MissingFunctions(Vec<String>),

    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("task {0} is not a recurring definition with a cron expression")]
    NotRecurring(String),

    #[error("failed to build execution pool: {0}")]
    PoolBuild(String),

    #[error("task processor is not initialized")]
    NotInitialized,
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::Store(StoreError::Unavailable(_)) => ErrorKind::Infrastructure,
            TaskError::Store(_) => ErrorKind::Transient,
            TaskError::Config(_) | TaskError::PoolBuild(_) | TaskError::NotInitialized => {
                ErrorKind::Infrastructure
            }
            TaskError::Codec(_)
            | TaskError::UnknownFunction(_)
            | TaskError::DuplicateFunction(_)
            | TaskError::MissingFunctions(_)
            | TaskError::InvalidCron { .. }
            | TaskError::NotRecurring(_) => ErrorKind::Permanent,
        }
    }
}

pub type Result<T, E = TaskError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::store_down(TaskError::Store(StoreError::Unavailable("refused".into())), ErrorKind::Infrastructure)]
    #[case::store_op(TaskError::Store(StoreError::WrongType("k".into())), ErrorKind::Transient)]
    #[case::unknown_fn(TaskError::UnknownFunction("nope".into()), ErrorKind::Permanent)]
    #[case::bad_cron(TaskError::InvalidCron { expression: "x".into(), reason: "y".into() }, ErrorKind::Permanent)]
    fn classifies_errors(#[case] err: TaskError, #[case] kind: ErrorKind) {
        assert_eq!(err.kind(), kind);
    }

    #[test]
    fn messages_name_the_culprit() {
        let err = TaskError::UnknownFunction("arbitrage_scan_task".into());
        assert_eq!(err.to_string(), "Unknown task function: arbitrage_scan_task");
    }
}
