use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use self::question::PublicQuestion;

pub mod answer;
pub mod question;
pub mod recovery;
pub mod results;
pub mod selection;

/// Fixed exam length.
pub const TOTAL_QUESTIONS: u32 = 60;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    InProgress,
    Completed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::InProgress => "in_progress",
            AttemptStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AttemptMetadata {
    #[serde(default)]
    pub session_count: u32,
    #[serde(default)]
    pub pause_count: u32,
    #[serde(default)]
    pub time_spent_seconds: u64,
    #[serde(default)]
    pub last_session_at: Option<DateTime<Utc>>,
}

/// One evaluation run for one user (`attempts` collection).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    #[serde(rename = "_id")]
    pub id: String,
    pub user_id: String,
    pub status: AttemptStatus,
    pub total_questions: u32,
    pub questions_answered: u32,
    pub correct_count: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: AttemptMetadata,
}

impl Attempt {
    pub fn new(id: String, user_id: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            user_id,
            status: AttemptStatus::InProgress,
            total_questions: TOTAL_QUESTIONS,
            questions_answered: 0,
            correct_count: 0,
            started_at: now,
            completed_at: None,
            metadata: AttemptMetadata {
                session_count: 1,
                pause_count: 0,
                time_spent_seconds: 0,
                last_session_at: Some(now),
            },
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == AttemptStatus::Completed
    }

    /// Client projection; the running score stays hidden until completion.
    pub fn view(&self) -> AttemptView {
        AttemptView {
            id: self.id.clone(),
            status: self.status,
            total_questions: self.total_questions,
            questions_answered: self.questions_answered,
            correct_count: if self.is_completed() {
                Some(self.correct_count)
            } else {
                None
            },
            started_at: self.started_at,
            completed_at: self.completed_at,
            metadata: self.metadata.clone(),
        }
    }
}

/// Binding of one bank question to one slot of one attempt (`attempt_questions`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptQuestion {
    #[serde(rename = "_id")]
    pub id: String,
    pub attempt_id: String,
    pub question_id: String,
    pub question_order: u32,
    pub user_answer_index: Option<u8>,
    pub is_correct: Option<bool>,
    pub answered_at: Option<DateTime<Utc>>,
    pub time_spent_seconds: Option<u32>,
    pub assigned_at: DateTime<Utc>,
}

impl AttemptQuestion {
    pub fn new(attempt_id: &str, question_id: &str, question_order: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            attempt_id: attempt_id.to_string(),
            question_id: question_id.to_string(),
            question_order,
            user_answer_index: None,
            is_correct: None,
            answered_at: None,
            time_spent_seconds: None,
            assigned_at: Utc::now(),
        }
    }

    pub fn is_answered(&self) -> bool {
        self.user_answer_index.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptView {
    pub id: String,
    pub status: AttemptStatus,
    pub total_questions: u32,
    pub questions_answered: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correct_count: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: AttemptMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateAttemptResponse {
    pub attempt_id: String,
    pub total_questions: u32,
    pub status: AttemptStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AttemptDetailsResponse {
    pub attempt: AttemptView,
    pub next_question: Option<PublicQuestion>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AttemptEnvelope {
    pub attempt: AttemptView,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AttemptListResponse {
    pub attempts: Vec<AttemptView>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PauseAttemptRequest {
    #[serde(default)]
    pub time_spent_seconds: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResetResponse {
    pub deleted_attempts: u64,
}
