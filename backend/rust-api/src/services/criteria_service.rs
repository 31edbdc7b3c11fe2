//! Decides the target profile for the next slot of an attempt.
//!
//! The language model gets the current deficits and coverage and proposes a
//! profile. Its answer is validated field by field; anything missing, unknown or
//! contradicting the quotas sends the call down the deterministic weighted path,
//! which never fails.

use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::metrics::record_fallback;
use crate::models::question::{BloomLevel, Difficulty};
use crate::models::selection::{CriteriaSource, Distributions, SelectionCriteria, TopicEntry};
use crate::services::llm::{parse_json, LlmError, LlmProvider, Validated};
use crate::services::ontology_service::fallback_topics;
use crate::utils::retry::{retry_async_if, RetryConfig};
use crate::utils::sampling::{pick_least_covered, weighted_index};

const EASY_SHARE: f64 = 0.5;
const MEDIUM_SHARE: f64 = 1.0 / 3.0;
const CODING_SHARE: f64 = 0.35;

const MAX_REASONING_CHARS: usize = 300;

/// Per-attempt quotas: 30/20/10 and 21 coding for a 60-question attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Targets {
    pub easy: u32,
    pub medium: u32,
    pub hard: u32,
    pub coding: u32,
}

impl Targets {
    pub fn for_total(total: u32) -> Self {
        let easy = (total as f64 * EASY_SHARE).round() as u32;
        let medium = ((total as f64 * MEDIUM_SHARE).round() as u32).min(total - easy.min(total));
        let hard = total.saturating_sub(easy + medium);
        let coding = ((total as f64 * CODING_SHARE).ceil() as u32).min(total);
        Self {
            easy,
            medium,
            hard,
            coding,
        }
    }
}

/// What is still owed against [`Targets`] given the slots already assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deficits {
    pub easy: u32,
    pub medium: u32,
    pub hard: u32,
    pub coding: u32,
    pub assigned: u32,
    pub remaining: u32,
}

impl Deficits {
    pub fn compute(total: u32, distributions: &Distributions) -> Self {
        let targets = Targets::for_total(total);
        let assigned = distributions.assigned();
        Self {
            easy: targets.easy.saturating_sub(distributions.easy_count),
            medium: targets.medium.saturating_sub(distributions.medium_count),
            hard: targets.hard.saturating_sub(distributions.hard_count),
            coding: targets.coding.saturating_sub(distributions.coding_count),
            assigned,
            remaining: total.saturating_sub(assigned),
        }
    }

    pub fn for_difficulty(&self, difficulty: Difficulty) -> u32 {
        match difficulty {
            Difficulty::Easy => self.easy,
            Difficulty::Medium => self.medium,
            Difficulty::Hard => self.hard,
        }
    }

    fn any_difficulty_owed(&self) -> bool {
        self.easy + self.medium + self.hard > 0
    }
}

/// Everything the selector looks at for one decision.
#[derive(Debug, Clone)]
pub struct CriteriaInput<'a> {
    pub attempt_id: &'a str,
    pub total_questions: u32,
    pub questions_answered: u32,
    pub distributions: &'a Distributions,
    pub topics: &'a [TopicEntry],
}

/// Shape requested from the model. Every field is optional so a partial answer
/// still parses and is then rejected by [`validate_llm_criteria`].
#[derive(Debug, Default, Deserialize)]
pub struct RawCriteria {
    pub difficulty: Option<String>,
    pub coding_mode: Option<bool>,
    pub preferred_topic: Option<String>,
    pub preferred_subtopic: Option<String>,
    pub preferred_bloom_level: Option<String>,
    pub reasoning: Option<String>,
}

pub struct CriteriaService {
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
}

impl CriteriaService {
    pub fn new(llm: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    pub async fn select<R: Rng + ?Sized>(
        &self,
        input: &CriteriaInput<'_>,
        rng: &mut R,
    ) -> SelectionCriteria {
        let topics = effective_topics(input.topics);
        let deficits = Deficits::compute(input.total_questions, input.distributions);

        match self.ask_model(input, &topics, &deficits).await {
            Ok(criteria) => {
                tracing::debug!(
                    "LLM criteria for attempt {}: {} coding={} topic={} ({})",
                    input.attempt_id,
                    criteria.difficulty.as_str(),
                    criteria.coding_mode,
                    criteria.preferred_topic,
                    criteria.reasoning
                );
                criteria
            }
            Err(reason) => {
                tracing::warn!(
                    "Criteria selection for attempt {} fell back: {}",
                    input.attempt_id,
                    reason
                );
                record_fallback("criteria");
                fallback_criteria(input.distributions, &deficits, &topics, rng)
            }
        }
    }

    async fn ask_model(
        &self,
        input: &CriteriaInput<'_>,
        topics: &[TopicEntry],
        deficits: &Deficits,
    ) -> Result<SelectionCriteria, String> {
        let user_prompt = build_prompt(input, topics, deficits);
        let prompt = user_prompt.as_str();
        let llm = &self.llm;
        let timeout = self.timeout;

        let raw = retry_async_if(
            RetryConfig::provider(),
            || async move {
                tokio::time::timeout(timeout, llm.complete(SYSTEM_PROMPT, prompt))
                    .await
                    .map_err(|_| LlmError::Timeout(timeout))?
            },
            LlmError::is_retryable,
        )
        .await
        .map_err(|e| e.to_string())?;

        let parsed: RawCriteria = parse_json(&raw).map_err(|e| e.to_string())?;
        validate_llm_criteria(parsed, topics, deficits).into_result()
    }
}

const SYSTEM_PROMPT: &str = "You plan a 60-question frontend engineering exam one question at a time. \
Reply with a single JSON object with exactly these keys: difficulty (Easy|Medium|Hard), \
coding_mode (boolean), preferred_topic (one of the listed topics), preferred_subtopic \
(one of that topic's subtopics), preferred_bloom_level (Remember|Understand|Apply|Analyze|Evaluate|Create), \
reasoning (one short sentence). Never choose a difficulty whose remaining quota is zero \
while another difficulty is still owed.";

fn build_prompt(input: &CriteriaInput<'_>, topics: &[TopicEntry], deficits: &Deficits) -> String {
    let payload = serde_json::json!({
        "questions_answered": input.questions_answered,
        "total_questions": input.total_questions,
        "assigned": deficits.assigned,
        "remaining": deficits.remaining,
        "remaining_quota": {
            "Easy": deficits.easy,
            "Medium": deficits.medium,
            "Hard": deficits.hard,
            "coding": deficits.coding,
        },
        "coverage": {
            "topics": input.distributions.topic_distribution,
            "subtopics": input.distributions.subtopic_distribution,
            "bloom_levels": input.distributions.bloom_distribution,
        },
        "topics": topics,
    });
    format!("Choose the profile of the next question.\n{}", payload)
}

fn effective_topics(topics: &[TopicEntry]) -> Vec<TopicEntry> {
    if topics.is_empty() {
        fallback_topics()
    } else {
        topics.to_vec()
    }
}

/// Checks model output against the known ontology and the remaining quotas.
pub fn validate_llm_criteria(
    raw: RawCriteria,
    topics: &[TopicEntry],
    deficits: &Deficits,
) -> Validated<SelectionCriteria> {
    let difficulty = match raw.difficulty.as_deref().map(str::parse::<Difficulty>) {
        Some(Ok(difficulty)) => difficulty,
        Some(Err(e)) => return Validated::Invalid(e),
        None => return Validated::Invalid("missing difficulty".into()),
    };
    if deficits.for_difficulty(difficulty) == 0 && deficits.any_difficulty_owed() {
        return Validated::Invalid(format!(
            "difficulty {} has no remaining quota",
            difficulty.as_str()
        ));
    }

    let Some(coding_mode) = raw.coding_mode else {
        return Validated::Invalid("missing coding_mode".into());
    };

    let Some(topic_entry) = raw.preferred_topic.as_deref().and_then(|wanted| {
        topics
            .iter()
            .find(|entry| entry.topic.eq_ignore_ascii_case(wanted.trim()))
    }) else {
        return Validated::Invalid(format!(
            "unknown preferred_topic {:?}",
            raw.preferred_topic
        ));
    };

    let preferred_subtopic = match raw.preferred_subtopic.as_deref().map(str::trim) {
        Some(wanted) if !wanted.is_empty() => {
            if topic_entry.subtopics.is_empty() {
                Some(wanted.to_string())
            } else {
                match topic_entry
                    .subtopics
                    .iter()
                    .find(|s| s.eq_ignore_ascii_case(wanted))
                {
                    Some(known) => Some(known.clone()),
                    None => {
                        return Validated::Invalid(format!(
                            "subtopic {} is not part of {}",
                            wanted, topic_entry.topic
                        ))
                    }
                }
            }
        }
        _ => return Validated::Invalid("missing preferred_subtopic".into()),
    };

    let preferred_bloom_level = match raw
        .preferred_bloom_level
        .as_deref()
        .map(str::parse::<BloomLevel>)
    {
        Some(Ok(level)) => level,
        Some(Err(e)) => return Validated::Invalid(e),
        None => return Validated::Invalid("missing preferred_bloom_level".into()),
    };

    let reasoning = match raw.reasoning.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => text.chars().take(MAX_REASONING_CHARS).collect(),
        _ => return Validated::Invalid("missing reasoning".into()),
    };

    Validated::Valid(SelectionCriteria {
        difficulty,
        coding_mode,
        preferred_topic: topic_entry.topic.clone(),
        preferred_subtopic,
        preferred_bloom_level,
        reasoning,
        source: CriteriaSource::Llm,
    })
}

/// Deterministic weighted choice used whenever the model cannot be trusted.
pub fn fallback_criteria<R: Rng + ?Sized>(
    distributions: &Distributions,
    deficits: &Deficits,
    topics: &[TopicEntry],
    rng: &mut R,
) -> SelectionCriteria {
    let weights: Vec<f64> = Difficulty::ALL
        .iter()
        .map(|d| deficits.for_difficulty(*d) as f64)
        .collect();
    let difficulty = weighted_index(&weights, rng)
        .map(|index| Difficulty::ALL[index])
        .unwrap_or(Difficulty::Medium);

    let coding_mode = fallback_coding_mode(deficits, rng);

    let topics = effective_topics(topics);
    let names: Vec<String> = topics.iter().map(|t| t.topic.clone()).collect();
    let preferred_topic = pick_least_covered(&names, &distributions.topic_distribution, rng)
        .unwrap_or_else(|| "JavaScript".to_string());

    let preferred_subtopic = topics
        .iter()
        .find(|t| t.topic == preferred_topic)
        .and_then(|t| pick_least_covered(&t.subtopics, &distributions.subtopic_distribution, rng));

    let levels: Vec<String> = BloomLevel::ALL
        .iter()
        .map(|level| level.as_str().to_string())
        .collect();
    let preferred_bloom_level = pick_least_covered(&levels, &distributions.bloom_distribution, rng)
        .and_then(|level| level.parse().ok())
        .unwrap_or(BloomLevel::Understand);

    SelectionCriteria {
        reasoning: format!(
            "fallback: owed easy={} medium={} hard={} coding={} of {} remaining",
            deficits.easy, deficits.medium, deficits.hard, deficits.coding, deficits.remaining
        ),
        difficulty,
        coding_mode,
        preferred_topic,
        preferred_subtopic,
        preferred_bloom_level,
        source: CriteriaSource::Fallback,
    }
}

/// Forced once the attempt is half done with coding still owed, or when every
/// remaining slot is needed to reach the floor; otherwise drawn with the owed ratio.
fn fallback_coding_mode<R: Rng + ?Sized>(deficits: &Deficits, rng: &mut R) -> bool {
    if deficits.coding == 0 {
        return false;
    }
    let total = deficits.assigned + deficits.remaining;
    if deficits.assigned * 2 >= total || deficits.coding >= deficits.remaining {
        return true;
    }
    let probability = (deficits.coding as f64 / deficits.remaining.max(1) as f64).clamp(0.0, 1.0);
    rng.random_bool(probability)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    struct ScriptedLlm(Result<String, ()>);

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, LlmError> {
            self.0
                .clone()
                .map_err(|_| LlmError::Malformed("scripted failure".into()))
        }
    }

    fn raw_valid() -> RawCriteria {
        RawCriteria {
            difficulty: Some("medium".into()),
            coding_mode: Some(true),
            preferred_topic: Some("react".into()),
            preferred_subtopic: Some("hooks".into()),
            preferred_bloom_level: Some("Apply".into()),
            reasoning: Some("React hooks are under-covered".into()),
        }
    }

    fn counts(easy: u32, medium: u32, hard: u32, coding: u32) -> Distributions {
        Distributions {
            easy_count: easy,
            medium_count: medium,
            hard_count: hard,
            coding_count: coding,
            ..Default::default()
        }
    }

    #[test]
    fn targets_split_sixty_as_thirty_twenty_ten() {
        let targets = Targets::for_total(60);
        assert_eq!(
            targets,
            Targets {
                easy: 30,
                medium: 20,
                hard: 10,
                coding: 21
            }
        );
        let small = Targets::for_total(6);
        assert_eq!(small.easy + small.medium + small.hard, 6);
    }

    #[test]
    fn valid_model_output_is_canonicalised() {
        let deficits = Deficits::compute(60, &Distributions::default());
        let criteria = validate_llm_criteria(raw_valid(), &fallback_topics(), &deficits)
            .into_result()
            .unwrap();
        assert_eq!(criteria.preferred_topic, "React");
        assert_eq!(criteria.preferred_subtopic.as_deref(), Some("Hooks"));
        assert_eq!(criteria.difficulty, Difficulty::Medium);
        assert_eq!(criteria.source, CriteriaSource::Llm);
    }

    #[test]
    fn model_output_with_unknown_or_missing_fields_is_rejected() {
        let deficits = Deficits::compute(60, &Distributions::default());
        let topics = fallback_topics();

        let mut unknown_topic = raw_valid();
        unknown_topic.preferred_topic = Some("Cobol".into());
        assert!(matches!(
            validate_llm_criteria(unknown_topic, &topics, &deficits),
            Validated::Invalid(_)
        ));

        let mut missing = raw_valid();
        missing.coding_mode = None;
        assert!(matches!(
            validate_llm_criteria(missing, &topics, &deficits),
            Validated::Invalid(_)
        ));

        let mut bad_bloom = raw_valid();
        bad_bloom.preferred_bloom_level = Some("Memorize".into());
        assert!(matches!(
            validate_llm_criteria(bad_bloom, &topics, &deficits),
            Validated::Invalid(_)
        ));
    }

    #[test]
    fn model_cannot_pick_an_exhausted_difficulty() {
        let deficits = Deficits::compute(60, &counts(10, 20, 0, 0));
        let mut raw = raw_valid();
        raw.difficulty = Some("Medium".into());
        assert!(matches!(
            validate_llm_criteria(raw, &fallback_topics(), &deficits),
            Validated::Invalid(_)
        ));
    }

    #[test]
    fn fallback_never_picks_an_exhausted_tier() {
        let distributions = counts(30, 20, 0, 0);
        let deficits = Deficits::compute(60, &distributions);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let criteria = fallback_criteria(&distributions, &deficits, &[], &mut rng);
            assert_eq!(criteria.difficulty, Difficulty::Hard);
            assert_eq!(criteria.source, CriteriaSource::Fallback);
        }
    }

    #[test]
    fn coding_is_forced_late_while_owed() {
        let deficits = Deficits::compute(60, &counts(20, 10, 5, 3));
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..20 {
            assert!(fallback_coding_mode(&deficits, &mut rng));
        }

        let satisfied = Deficits::compute(60, &counts(20, 10, 5, 21));
        assert!(!fallback_coding_mode(&satisfied, &mut rng));
    }

    #[test]
    fn fallback_prefers_uncovered_topics() {
        let mut distributions = Distributions::default();
        let topics = vec![
            TopicEntry {
                topic: "CSS".into(),
                subtopics: vec!["Grid".into()],
            },
            TopicEntry {
                topic: "HTML".into(),
                subtopics: vec![],
            },
        ];
        distributions.topic_distribution = HashMap::from([("CSS".to_string(), 40)]);
        let deficits = Deficits::compute(60, &distributions);
        let mut rng = StdRng::seed_from_u64(11);

        let html = (0..200)
            .filter(|_| {
                fallback_criteria(&distributions, &deficits, &topics, &mut rng).preferred_topic
                    == "HTML"
            })
            .count();
        assert!(html > 150, "HTML picked {} times", html);
    }

    #[tokio::test]
    async fn select_uses_valid_model_output() {
        let json = serde_json::json!({
            "difficulty": "Easy",
            "coding_mode": false,
            "preferred_topic": "CSS",
            "preferred_subtopic": "Grid",
            "preferred_bloom_level": "Remember",
            "reasoning": "CSS is uncovered",
        })
        .to_string();
        let service = CriteriaService::new(Arc::new(ScriptedLlm(Ok(json))), Duration::from_secs(1));
        let distributions = Distributions::default();
        let topics = fallback_topics();
        let input = CriteriaInput {
            attempt_id: "a1",
            total_questions: 60,
            questions_answered: 0,
            distributions: &distributions,
            topics: &topics,
        };
        let criteria = service
            .select(&input, &mut StdRng::seed_from_u64(1))
            .await;
        assert_eq!(criteria.source, CriteriaSource::Llm);
        assert_eq!(criteria.preferred_topic, "CSS");
    }

    #[tokio::test]
    async fn select_falls_back_on_garbage() {
        let service = CriteriaService::new(
            Arc::new(ScriptedLlm(Ok("I think React".into()))),
            Duration::from_secs(1),
        );
        let distributions = Distributions::default();
        let input = CriteriaInput {
            attempt_id: "a1",
            total_questions: 60,
            questions_answered: 0,
            distributions: &distributions,
            topics: &[],
        };
        let criteria = service
            .select(&input, &mut StdRng::seed_from_u64(1))
            .await;
        assert_eq!(criteria.source, CriteriaSource::Fallback);
    }
}
