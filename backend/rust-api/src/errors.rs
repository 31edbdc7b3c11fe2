use thiserror::Error;

use crate::services::store::StoreError;

/// Domain errors surfaced by the exam services.
#[derive(Debug, Error)]
pub enum ExamError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{message}")]
    StateConflict {
        reason: &'static str,
        message: String,
    },

    #[error("Could not reserve question slot {order} after {attempts} attempts")]
    AssignmentExhausted { order: u32, attempts: usize },

    #[error("Question generation failed: {0}")]
    GenerationFailed(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ExamError {
    pub fn state_conflict(reason: &'static str, message: impl Into<String>) -> Self {
        ExamError::StateConflict {
            reason,
            message: message.into(),
        }
    }

    /// Machine-readable reason code sent to clients.
    pub fn reason(&self) -> &'static str {
        match self {
            ExamError::Validation(_) => "validation_error",
            ExamError::NotFound(_) => "not_found",
            ExamError::Forbidden(_) => "forbidden",
            ExamError::StateConflict { reason, .. } => reason,
            ExamError::AssignmentExhausted { .. } => "assignment_exhausted",
            ExamError::GenerationFailed(_) => "question_unavailable",
            ExamError::Store(_) => "store_unavailable",
            ExamError::Internal(_) => "internal_error",
        }
    }
}

pub type ExamResult<T> = Result<T, ExamError>;
