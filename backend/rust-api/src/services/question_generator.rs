//! Drafts a new bank question when no stored candidate is acceptable.
//!
//! Pipeline: retrieve grounding passages, ask the model for a draft, validate it,
//! dedupe it, persist it. A draft that fails validation is retried (strict,
//! relaxed, then strict again with the earlier problems spelled out); after the
//! last try the caller gets an error and nothing is assigned.

use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{ExamError, ExamResult};
use crate::metrics::record_fallback;
use crate::models::question::{
    content_key, BankQuestion, Citation, DocumentChunk, QualityReview, ReviewVerdict,
    OPTIONS_PER_QUESTION,
};
use crate::models::selection::SelectionCriteria;
use crate::services::candidate_scorer::{AskedContext, ATTEMPT_SIMILARITY_HIGH, TEXT_OVERLAP_HIGH};
use crate::services::llm::{embed_one, parse_json, EmbeddingProvider, LlmError, LlmProvider, Validated};
use crate::services::store::ExamStore;
use crate::utils::similarity::{jaccard_similarity, max_cosine_similarity};

pub const MAX_GENERATION_ATTEMPTS: usize = 3;
const CONTEXT_PASSAGES: usize = 6;
const JUDGE_NEIGHBORS: usize = 3;
const EXCERPT_CHARS: usize = 240;

lazy_static! {
    static ref FENCED_BLOCK: Regex =
        Regex::new(r"(?s)^```[A-Za-z0-9_+\-]*[ \t]*\r?\n(.*?)\r?\n?```$").unwrap();
}

/// How forgiving draft validation is on one try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    Strict,
    Relaxed,
}

impl ValidationMode {
    fn code_line_bounds(&self) -> (usize, usize) {
        match self {
            ValidationMode::Strict => (3, 50),
            ValidationMode::Relaxed => (2, 60),
        }
    }

    /// Try 1 strict, try 2 relaxed, last try strict.
    pub fn for_attempt(attempt: usize) -> Self {
        if attempt == 2 {
            ValidationMode::Relaxed
        } else {
            ValidationMode::Strict
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCitation {
    pub source: Option<String>,
    pub url: Option<String>,
    pub excerpt: Option<String>,
}

/// Draft as returned by the model, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawDraft {
    pub question: Option<String>,
    pub code: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
    pub correct_index: Option<i64>,
    pub explanation: Option<String>,
    #[serde(default)]
    pub citations: Vec<RawCitation>,
}

/// A draft that passed structural validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidDraft {
    pub question: String,
    pub code: Option<String>,
    pub options: Vec<String>,
    pub correct_index: u8,
    pub explanation: String,
    pub citations: Vec<Citation>,
}

#[derive(Debug, Clone)]
pub struct GeneratedQuestion {
    pub question: BankQuestion,
    /// The draft matched a stored question, which is served instead.
    pub reused: bool,
}

#[derive(Debug, Deserialize)]
struct JudgeReply {
    verdict: Option<String>,
    notes: Option<String>,
}

pub struct QuestionGenerator {
    store: Arc<dyn ExamStore>,
    llm: Arc<dyn LlmProvider>,
    embeddings: Arc<dyn EmbeddingProvider>,
    timeout: Duration,
    judge_enabled: bool,
}

impl QuestionGenerator {
    pub fn new(
        store: Arc<dyn ExamStore>,
        llm: Arc<dyn LlmProvider>,
        embeddings: Arc<dyn EmbeddingProvider>,
        timeout: Duration,
        judge_enabled: bool,
    ) -> Self {
        Self {
            store,
            llm,
            embeddings,
            timeout,
            judge_enabled,
        }
    }

    pub async fn generate(
        &self,
        attempt_id: &str,
        criteria: &SelectionCriteria,
        asked: &AskedContext,
    ) -> ExamResult<GeneratedQuestion> {
        let context = self.retrieve_context(criteria).await;
        let mut problems: Vec<String> = Vec::new();

        for attempt in 1..=MAX_GENERATION_ATTEMPTS {
            let mode = ValidationMode::for_attempt(attempt);
            let prompt = build_prompt(criteria, &context, mode, &problems);

            let raw = match self.call_model(GENERATOR_SYSTEM_PROMPT, &prompt).await {
                Ok(raw) => raw,
                Err(LlmError::NotConfigured) => {
                    return Err(ExamError::GenerationFailed(
                        "no language model configured and no bank candidate matched".to_string(),
                    ))
                }
                Err(e) => {
                    tracing::warn!(
                        "Generation try {}/{} for attempt {} failed: {}",
                        attempt,
                        MAX_GENERATION_ATTEMPTS,
                        attempt_id,
                        e
                    );
                    problems.push(e.to_string());
                    continue;
                }
            };

            let draft = match parse_json::<RawDraft>(&raw)
                .map_err(|e| e.to_string())
                .and_then(|raw| validate_draft(raw, criteria.coding_mode, mode).into_result())
            {
                Ok(draft) => draft,
                Err(problem) => {
                    tracing::warn!(
                        "Draft {}/{} ({:?}) for attempt {} rejected: {}",
                        attempt,
                        MAX_GENERATION_ATTEMPTS,
                        mode,
                        attempt_id,
                        problem
                    );
                    problems.push(problem);
                    continue;
                }
            };

            match self.finalize(draft, criteria, &context, asked).await {
                Ok(generated) => {
                    tracing::info!(
                        "Generated question {} for attempt {} (topic={}, reused={}, try={})",
                        generated.question.id,
                        attempt_id,
                        generated.question.topic,
                        generated.reused,
                        attempt
                    );
                    return Ok(generated);
                }
                Err(FinalizeError::Rejected(problem)) => {
                    tracing::warn!("Draft for attempt {} rejected: {}", attempt_id, problem);
                    problems.push(problem);
                }
                Err(FinalizeError::Fatal(e)) => return Err(e),
            }
        }

        tracing::error!(
            "Question generation exhausted {} tries for attempt {}",
            MAX_GENERATION_ATTEMPTS,
            attempt_id
        );
        Err(ExamError::GenerationFailed(problems.join("; ")))
    }

    async fn call_model(&self, system: &str, user: &str) -> Result<String, LlmError> {
        tokio::time::timeout(self.timeout, self.llm.complete(system, user))
            .await
            .map_err(|_| LlmError::Timeout(self.timeout))?
    }

    async fn retrieve_context(&self, criteria: &SelectionCriteria) -> Vec<DocumentChunk> {
        let query = format!(
            "{} {} {}",
            criteria.preferred_topic,
            criteria.preferred_subtopic.as_deref().unwrap_or_default(),
            criteria.preferred_bloom_level.as_str()
        );
        let Some(embedding) = embed_one(self.embeddings.as_ref(), &query).await else {
            record_fallback("retrieval");
            return Vec::new();
        };

        match self
            .store
            .search_documents(
                &embedding,
                Some(&criteria.preferred_topic),
                criteria.preferred_subtopic.as_deref(),
                CONTEXT_PASSAGES,
            )
            .await
        {
            Ok(chunks) => chunks.into_iter().map(|scored| scored.chunk).collect(),
            Err(e) => {
                tracing::warn!("Context retrieval failed, drafting without grounding: {}", e);
                record_fallback("retrieval");
                Vec::new()
            }
        }
    }

    async fn finalize(
        &self,
        draft: ValidDraft,
        criteria: &SelectionCriteria,
        context: &[DocumentChunk],
        asked: &AskedContext,
    ) -> Result<GeneratedQuestion, FinalizeError> {
        let text_overlap = asked
            .texts
            .iter()
            .map(|text| jaccard_similarity(&draft.question, text))
            .fold(0.0_f64, f64::max);
        if text_overlap > TEXT_OVERLAP_HIGH {
            return Err(FinalizeError::Rejected(
                "draft repeats a question already asked in this attempt".to_string(),
            ));
        }

        let embedding = embed_one(self.embeddings.as_ref(), &embedding_text(&draft))
            .await
            .unwrap_or_default();
        if !embedding.is_empty()
            && max_cosine_similarity(&embedding, asked.embeddings.iter().map(|e| e.as_slice()))
                > ATTEMPT_SIMILARITY_HIGH
        {
            return Err(FinalizeError::Rejected(
                "draft is a near-duplicate of an asked question".to_string(),
            ));
        }

        let key = content_key(&draft.question, &draft.options);
        let citations = if draft.citations.is_empty() {
            context.iter().take(2).map(citation_from_chunk).collect()
        } else {
            draft.citations.clone()
        };

        let mut question = BankQuestion {
            id: uuid::Uuid::new_v4().to_string(),
            topic: criteria.preferred_topic.clone(),
            subtopic: criteria.preferred_subtopic.clone(),
            difficulty: criteria.difficulty,
            bloom_level: criteria.preferred_bloom_level,
            question: draft.question,
            code: draft.code,
            options: draft.options,
            correct_index: draft.correct_index,
            explanation: draft.explanation,
            citations,
            embedding,
            content_key: key.clone(),
            review: None,
            created_at: Utc::now(),
        };

        if self.judge_enabled {
            question.review = self.judge(&question).await;
        }

        match self.store.insert_question(&question).await {
            Ok(()) => Ok(GeneratedQuestion {
                question,
                reused: false,
            }),
            Err(e) if e.is_conflict() => {
                let existing = self
                    .store
                    .find_question_by_content_key(&key)
                    .await
                    .map_err(|e| FinalizeError::Fatal(e.into()))?;
                match existing {
                    Some(stored) if !asked.question_ids.contains(&stored.id) => {
                        Ok(GeneratedQuestion {
                            question: stored,
                            reused: true,
                        })
                    }
                    _ => Err(FinalizeError::Rejected(
                        "draft duplicates a stored question already asked in this attempt"
                            .to_string(),
                    )),
                }
            }
            Err(e) => Err(FinalizeError::Fatal(e.into())),
        }
    }

    /// Advisory review against the closest bank questions. Any failure yields `None`.
    async fn judge(&self, question: &BankQuestion) -> Option<QualityReview> {
        let neighbors = if question.embedding.is_empty() {
            Vec::new()
        } else {
            let ids: Vec<String> = self
                .store
                .nearest_questions(&question.embedding, Some(&question.topic), JUDGE_NEIGHBORS)
                .await
                .ok()?
                .into_iter()
                .map(|n| n.question_id)
                .collect();
            self.store.get_questions(&ids).await.ok()?
        };

        let prompt = serde_json::json!({
            "draft": {
                "question": question.question,
                "code": question.code,
                "options": question.options,
                "correct_index": question.correct_index,
                "explanation": question.explanation,
            },
            "neighbors": neighbors.iter().map(|n| &n.question).collect::<Vec<_>>(),
        })
        .to_string();

        let reply = match self.call_model(JUDGE_SYSTEM_PROMPT, &prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!("Judge skipped: {}", e);
                return None;
            }
        };
        let parsed: JudgeReply = parse_json(&reply).ok()?;
        let verdict = match parsed.verdict.as_deref().map(|v| v.trim().to_lowercase()) {
            Some(v) if v == "approve" => ReviewVerdict::Approve,
            Some(v) if v == "revise" => ReviewVerdict::Revise,
            _ => return None,
        };
        let review = QualityReview {
            verdict,
            notes: parsed.notes.unwrap_or_default(),
        };
        tracing::info!(
            "Judge verdict for draft {}: {:?} {}",
            question.content_key,
            review.verdict,
            review.notes
        );
        Some(review)
    }
}

enum FinalizeError {
    /// The draft is unusable; try again.
    Rejected(String),
    Fatal(ExamError),
}

const GENERATOR_SYSTEM_PROMPT: &str = "You write multiple-choice questions for a frontend engineering exam. \
Reply with one JSON object: question (string), code (string or null), options (array of exactly 4 distinct strings), \
correct_index (0-3), explanation (string), citations (array of {source, url, excerpt}). \
Ground the question in the supplied passages when they are relevant.";

const JUDGE_SYSTEM_PROMPT: &str = "You review a drafted exam question against similar existing questions. \
Reply with one JSON object: verdict (\"approve\" or \"revise\"), notes (one or two sentences).";

fn build_prompt(
    criteria: &SelectionCriteria,
    context: &[DocumentChunk],
    mode: ValidationMode,
    problems: &[String],
) -> String {
    let mut prompt = format!(
        "Topic: {}\nSubtopic: {}\nDifficulty: {}\nBloom level: {}\n",
        criteria.preferred_topic,
        criteria.preferred_subtopic.as_deref().unwrap_or("any"),
        criteria.difficulty.as_str(),
        criteria.preferred_bloom_level.as_str(),
    );

    let (min_lines, max_lines) = mode.code_line_bounds();
    if criteria.coding_mode {
        prompt.push_str(&format!(
            "This is a coding question: put a snippet of {}-{} lines in `code` as a fenced block (```lang ... ```). \
Do not repeat the code inside `question`.\n",
            min_lines, max_lines
        ));
    } else {
        prompt.push_str("This is a conceptual question: set `code` to null.\n");
    }

    if !context.is_empty() {
        prompt.push_str("\nPassages:\n");
        for (i, chunk) in context.iter().enumerate() {
            prompt.push_str(&format!("[{}] {}: {}\n", i + 1, chunk.source, chunk.text));
        }
    }

    if !problems.is_empty() {
        prompt.push_str("\nEarlier drafts were rejected for these reasons, avoid them:\n");
        for problem in problems {
            prompt.push_str(&format!("- {}\n", problem));
        }
    }
    prompt
}

fn embedding_text(draft: &ValidDraft) -> String {
    match draft.code.as_deref() {
        Some(code) => format!("{}\n{}", draft.question, code),
        None => draft.question.clone(),
    }
}

fn citation_from_chunk(chunk: &DocumentChunk) -> Citation {
    Citation {
        source: chunk.source.clone(),
        url: chunk.url.clone(),
        excerpt: Some(chunk.text.chars().take(EXCERPT_CHARS).collect()),
    }
}

/// Returns the snippet inside a ```lang fence, or `None` when it is not fenced.
pub fn unfence(code: &str) -> Option<String> {
    FENCED_BLOCK
        .captures(code.trim())
        .and_then(|captures| captures.get(1))
        .map(|body| body.as_str().to_string())
}

fn code_lines(code: &str) -> usize {
    code.lines().filter(|line| !line.trim().is_empty()).count()
}

/// Structural checks on a model draft.
pub fn validate_draft(raw: RawDraft, coding_mode: bool, mode: ValidationMode) -> Validated<ValidDraft> {
    let question = raw.question.as_deref().map(str::trim).unwrap_or_default();
    if question.is_empty() {
        return Validated::Invalid("question text is empty".into());
    }

    if raw.options.len() != OPTIONS_PER_QUESTION {
        return Validated::Invalid(format!(
            "expected {} options, got {}",
            OPTIONS_PER_QUESTION,
            raw.options.len()
        ));
    }
    let options: Vec<String> = raw.options.iter().map(|o| o.trim().to_string()).collect();
    if options.iter().any(|o| o.is_empty()) {
        return Validated::Invalid("an option is empty".into());
    }
    let distinct: HashSet<String> = options.iter().map(|o| o.to_lowercase()).collect();
    if distinct.len() != options.len() {
        return Validated::Invalid("options are not distinct".into());
    }

    let correct_index = match raw.correct_index {
        Some(index) if (0..OPTIONS_PER_QUESTION as i64).contains(&index) => index as u8,
        other => return Validated::Invalid(format!("correct_index {:?} out of range", other)),
    };

    let raw_code = raw
        .code
        .as_deref()
        .map(str::trim)
        .filter(|code| !code.is_empty());

    let code = if coding_mode {
        let Some(raw_code) = raw_code else {
            return Validated::Invalid("coding question without code".into());
        };
        let body = match (unfence(raw_code), mode) {
            (Some(body), _) => body,
            (None, ValidationMode::Relaxed) if !raw_code.contains("```") => raw_code.to_string(),
            (None, _) => return Validated::Invalid("code is not a fenced block".into()),
        };
        let (min_lines, max_lines) = mode.code_line_bounds();
        let lines = code_lines(&body);
        if lines < min_lines || lines > max_lines {
            return Validated::Invalid(format!(
                "code has {} lines, expected {}-{}",
                lines, min_lines, max_lines
            ));
        }
        if question.contains("```") {
            return Validated::Invalid("question prose contains a code fence".into());
        }
        let first_line = body.lines().map(str::trim).find(|line| line.len() >= 8);
        if let Some(first_line) = first_line {
            if question.contains(first_line) {
                return Validated::Invalid("code is duplicated inside the question".into());
            }
        }
        Some(body)
    } else {
        match (raw_code, mode) {
            (Some(_), ValidationMode::Strict) => {
                return Validated::Invalid("conceptual question must not carry code".into())
            }
            _ => None,
        }
    };

    let citations = raw
        .citations
        .into_iter()
        .filter_map(|c| {
            let source = c.source.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())?;
            Some(Citation {
                source,
                url: c.url.filter(|u| !u.trim().is_empty()),
                excerpt: c.excerpt.filter(|e| !e.trim().is_empty()),
            })
        })
        .collect();

    Validated::Valid(ValidDraft {
        question: question.to_string(),
        code,
        options,
        correct_index,
        explanation: raw.explanation.unwrap_or_default().trim().to_string(),
        citations,
    })
}
