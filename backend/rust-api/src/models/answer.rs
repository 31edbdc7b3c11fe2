use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SubmitAnswerRequest {
    #[validate(length(min = 1, message = "question_id is required"))]
    pub question_id: String,
    #[validate(range(max = 3, message = "user_answer_index must be between 0 and 3"))]
    pub user_answer_index: u8,
    #[serde(default)]
    #[validate(range(max = 86400, message = "time_spent_seconds must be at most 86400"))]
    pub time_spent_seconds: u32,
}

/// Deliberately carries no correctness information.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitAnswerResponse {
    pub recorded: bool,
    pub progress: AnswerProgress,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnswerProgress {
    pub questions_answered: u32,
    pub total_questions: u32,
    pub is_complete: bool,
}
