use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;

use crate::utils::similarity::normalize_text;

pub const OPTIONS_PER_QUESTION: usize = 4;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub const ALL: [Difficulty; 3] = [Difficulty::Easy, Difficulty::Medium, Difficulty::Hard];

    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "Easy",
            Difficulty::Medium => "Medium",
            Difficulty::Hard => "Hard",
        }
    }
}

impl FromStr for Difficulty {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "easy" => Ok(Difficulty::Easy),
            "medium" => Ok(Difficulty::Medium),
            "hard" => Ok(Difficulty::Hard),
            _ => Err(format!("Invalid difficulty: {}", value)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BloomLevel {
    Remember,
    Understand,
    Apply,
    Analyze,
    Evaluate,
    Create,
}

impl BloomLevel {
    pub const ALL: [BloomLevel; 6] = [
        BloomLevel::Remember,
        BloomLevel::Understand,
        BloomLevel::Apply,
        BloomLevel::Analyze,
        BloomLevel::Evaluate,
        BloomLevel::Create,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BloomLevel::Remember => "Remember",
            BloomLevel::Understand => "Understand",
            BloomLevel::Apply => "Apply",
            BloomLevel::Analyze => "Analyze",
            BloomLevel::Evaluate => "Evaluate",
            BloomLevel::Create => "Create",
        }
    }
}

impl FromStr for BloomLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "remember" => Ok(BloomLevel::Remember),
            "understand" => Ok(BloomLevel::Understand),
            "apply" => Ok(BloomLevel::Apply),
            "analyze" | "analyse" => Ok(BloomLevel::Analyze),
            "evaluate" => Ok(BloomLevel::Evaluate),
            "create" => Ok(BloomLevel::Create),
            _ => Err(format!("Invalid bloom level: {}", value)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

/// Reusable multiple-choice item stored in the `questions` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankQuestion {
    #[serde(rename = "_id")]
    pub id: String,
    pub topic: String,
    #[serde(default)]
    pub subtopic: Option<String>,
    pub difficulty: Difficulty,
    pub bloom_level: BloomLevel,
    pub question: String,
    #[serde(default)]
    pub code: Option<String>,
    pub options: Vec<String>,
    pub correct_index: u8,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub embedding: Vec<f32>,
    pub content_key: String,
    #[serde(default)]
    pub review: Option<QualityReview>,
    pub created_at: DateTime<Utc>,
}

impl BankQuestion {
    pub fn is_coding(&self) -> bool {
        self.code
            .as_deref()
            .map(|code| !code.trim().is_empty())
            .unwrap_or(false)
    }

    /// Structural invariants every stored question must satisfy.
    pub fn is_well_formed(&self) -> bool {
        self.options.len() == OPTIONS_PER_QUESTION
            && (self.correct_index as usize) < OPTIONS_PER_QUESTION
            && self.options.iter().all(|option| !option.trim().is_empty())
            && !self.question.trim().is_empty()
    }

    /// Candidate-facing projection: never carries the answer, explanation or citations.
    pub fn public_view(&self, question_order: u32) -> PublicQuestion {
        PublicQuestion {
            id: self.id.clone(),
            question_order,
            topic: self.topic.clone(),
            subtopic: self.subtopic.clone(),
            difficulty: self.difficulty,
            bloom_level: self.bloom_level,
            question: self.question.clone(),
            code: self.code.clone(),
            options: self.options.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublicQuestion {
    pub id: String,
    pub question_order: u32,
    pub topic: String,
    pub subtopic: Option<String>,
    pub difficulty: Difficulty,
    pub bloom_level: BloomLevel,
    pub question: String,
    pub code: Option<String>,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    Approve,
    Revise,
}

/// Advisory output of the quality judge; never gates assignment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityReview {
    pub verdict: ReviewVerdict,
    #[serde(default)]
    pub notes: String,
}

/// Grounding passage from the retrieval corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    #[serde(rename = "_id")]
    pub id: String,
    pub topic: String,
    #[serde(default)]
    pub subtopic: Option<String>,
    pub source: String,
    #[serde(default)]
    pub url: Option<String>,
    pub text: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
}

/// Dedup hash over the normalised prompt and options.
pub fn content_key(question: &str, options: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_text(question).as_bytes());
    for option in options {
        hasher.update(b"\x1f");
        hasher.update(normalize_text(option).as_bytes());
    }
    hex::encode(hasher.finalize())
}
