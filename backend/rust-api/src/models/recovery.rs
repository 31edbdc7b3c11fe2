use serde::{Deserialize, Serialize};

use super::AttemptStatus;

/// Outcome of the counter-vs-rows reconciliation ("fix").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixReport {
    pub attempt_id: String,
    pub fixed: bool,
    pub previous_status: AttemptStatus,
    pub status: AttemptStatus,
    pub expected_questions: u32,
    pub actual_questions: u32,
    pub questions_answered: u32,
    pub message: String,
}

/// Outcome of the missing-order backfill ("recover").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoverReport {
    pub attempt_id: String,
    pub recovered: bool,
    pub status: AttemptStatus,
    pub missing_orders: Vec<u32>,
    pub results: Vec<BackfillResult>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackfillResult {
    #[serde(rename = "order")]
    pub question_order: u32,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
