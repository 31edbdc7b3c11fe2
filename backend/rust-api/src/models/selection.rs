use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::question::{BloomLevel, Difficulty};

/// Target profile for the next slot. Advisory, produced fresh per call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectionCriteria {
    pub difficulty: Difficulty,
    pub coding_mode: bool,
    pub preferred_topic: String,
    pub preferred_subtopic: Option<String>,
    pub preferred_bloom_level: BloomLevel,
    pub reasoning: String,
    pub source: CriteriaSource,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CriteriaSource {
    Llm,
    Fallback,
}

/// Coverage of the questions assigned so far in one attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Distributions {
    pub easy_count: u32,
    pub medium_count: u32,
    pub hard_count: u32,
    pub coding_count: u32,
    pub topic_distribution: HashMap<String, u32>,
    pub subtopic_distribution: HashMap<String, u32>,
    pub bloom_distribution: HashMap<String, u32>,
}

impl Distributions {
    pub fn assigned(&self) -> u32 {
        self.easy_count + self.medium_count + self.hard_count
    }

    pub fn topic_count(&self, topic: &str) -> u32 {
        count_case_insensitive(&self.topic_distribution, topic)
    }
}

pub(crate) fn count_case_insensitive(histogram: &HashMap<String, u32>, key: &str) -> u32 {
    let key = key.trim().to_lowercase();
    histogram
        .iter()
        .filter(|(name, _)| name.trim().to_lowercase() == key)
        .map(|(_, count)| *count)
        .sum()
}

/// One ontology entry: a topic and its known subtopics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicEntry {
    pub topic: String,
    #[serde(default)]
    pub subtopics: Vec<String>,
}
