use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::question::{BloomLevel, Citation, Difficulty};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptResults {
    pub attempt_id: String,
    pub summary: ResultsSummary,
    pub by_topic: Vec<CategoryAccuracy>,
    pub by_subtopic: Vec<CategoryAccuracy>,
    pub by_bloom_level: Vec<CategoryAccuracy>,
    pub by_difficulty: Vec<CategoryAccuracy>,
    pub weak_areas: Vec<WeakArea>,
    pub review: Vec<QuestionReview>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsSummary {
    pub total_questions: u32,
    pub answered: u32,
    pub correct: u32,
    pub score_percent: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub time_spent_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryAccuracy {
    pub category: String,
    pub total: u32,
    pub correct: u32,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeakArea {
    pub subtopic: String,
    pub topic: String,
    pub total: u32,
    pub correct: u32,
    pub accuracy: f64,
    pub recommendation: String,
    pub citation: Option<Citation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionReview {
    pub question_order: u32,
    pub question_id: String,
    pub topic: String,
    pub subtopic: Option<String>,
    pub difficulty: Difficulty,
    pub bloom_level: BloomLevel,
    pub question: String,
    pub code: Option<String>,
    pub options: Vec<String>,
    pub user_answer_index: Option<u8>,
    pub correct_index: u8,
    pub is_correct: bool,
    pub explanation: String,
    pub citations: Vec<Citation>,
}
