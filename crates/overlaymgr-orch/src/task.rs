//! Reconciliation outcome types.
//!
//! A reconciler reports failure as a [`TaskError`]; the dispatcher only
//! looks at its [`TaskStatus`] to pick a redelivery delay.

use thiserror::Error;

/// Classification of one reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Success,
    /// Declared resource or environment is invalid; redelivered slowly
    InvalidEntry,
    /// Kernel or tool failure; redelivered slowly
    Failed,
    /// Transient; redelivered with exponential backoff
    NeedRetry,
    /// Nothing to converge
    Ignore,
}

impl TaskStatus {
    /// True when the notification is done with and needs no redelivery.
    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Ignore)
    }

    pub fn is_retryable(&self) -> bool {
        *self == TaskStatus::NeedRetry
    }

    pub fn is_failure(&self) -> bool {
        !self.is_success() && !self.is_retryable()
    }
}

/// Failure of one reconcile pass.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("invalid resource or environment: {message}")]
    InvalidEntry { message: String },

    #[error("reconcile failed: {message}")]
    Failed { message: String },

    #[error("retry pending: {reason}")]
    NeedRetry { reason: String },

    #[error("skipped: {reason}")]
    Ignored { reason: String },
}

impl TaskError {
    pub fn invalid_entry(message: impl Into<String>) -> Self {
        TaskError::InvalidEntry {
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed {
            message: message.into(),
        }
    }

    pub fn need_retry(reason: impl Into<String>) -> Self {
        TaskError::NeedRetry {
            reason: reason.into(),
        }
    }

    pub fn ignored(reason: impl Into<String>) -> Self {
        TaskError::Ignored {
            reason: reason.into(),
        }
    }

    pub fn to_status(&self) -> TaskStatus {
        TaskStatus::from(self)
    }
}

impl From<&TaskError> for TaskStatus {
    fn from(err: &TaskError) -> Self {
        match err {
            TaskError::InvalidEntry { .. } => TaskStatus::InvalidEntry,
            TaskError::Failed { .. } => TaskStatus::Failed,
            TaskError::NeedRetry { .. } => TaskStatus::NeedRetry,
            TaskError::Ignored { .. } => TaskStatus::Ignore,
        }
    }
}

/// Result of one reconcile pass.
pub type TaskResult<T> = Result<T, TaskError>;
