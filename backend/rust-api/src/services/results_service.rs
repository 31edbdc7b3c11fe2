use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::{ExamError, ExamResult};
use crate::models::question::Citation;
use crate::models::results::{
    AttemptResults, CategoryAccuracy, QuestionReview, ResultsSummary, WeakArea,
};
use crate::models::Attempt;
use crate::services::attempt_service::load_owned;
use crate::services::distribution::{load_assigned, AssignedQuestion};
use crate::services::store::ExamStore;
use crate::services::AppState;

/// Subtopics below this accuracy (percent) are weak areas.
pub const WEAK_AREA_THRESHOLD: f64 = 50.0;
pub const WEAK_AREA_MIN_QUESTIONS: u32 = 3;
pub const MAX_WEAK_AREAS: usize = 5;

pub struct ResultsService {
    store: Arc<dyn ExamStore>,
}

impl ResultsService {
    pub fn new(state: &AppState) -> Self {
        Self {
            store: state.store.clone(),
        }
    }

    pub async fn get_results(&self, user_id: &str, attempt_id: &str) -> ExamResult<AttemptResults> {
        let attempt = load_owned(self.store.as_ref(), user_id, attempt_id).await?;
        if !attempt.is_completed() {
            return Err(ExamError::state_conflict(
                "attempt_not_completed",
                "Results are available once the attempt is completed",
            ));
        }

        let assigned = load_assigned(self.store.as_ref(), &attempt.id).await?;
        tracing::info!(
            "Computing results for attempt {} over {} questions",
            attempt.id,
            assigned.len()
        );
        Ok(aggregate(&attempt, &assigned))
    }
}

/// Builds the full breakdown from joined rows. Correctness comes from the rows,
/// not from the attempt counters.
pub fn aggregate(attempt: &Attempt, assigned: &[AssignedQuestion]) -> AttemptResults {
    let answered = assigned.iter().filter(|a| a.row.is_answered()).count() as u32;
    let correct = assigned.iter().filter(|a| is_correct(a)).count() as u32;

    let summary = ResultsSummary {
        total_questions: attempt.total_questions,
        answered,
        correct,
        score_percent: percent(correct, attempt.total_questions),
        started_at: attempt.started_at,
        completed_at: attempt.completed_at,
        time_spent_seconds: attempt.metadata.time_spent_seconds,
    };

    let by_topic = accuracy_by(assigned, |a| Some(a.question.topic.as_str()));
    let by_subtopic = accuracy_by(assigned, |a| a.question.subtopic.as_deref());
    let by_bloom_level = accuracy_by(assigned, |a| Some(a.question.bloom_level.as_str()));
    let by_difficulty = accuracy_by(assigned, |a| Some(a.question.difficulty.as_str()));
    let weak_areas = weak_areas(assigned, &by_subtopic);

    let review = assigned
        .iter()
        .map(|a| QuestionReview {
            question_order: a.row.question_order,
            question_id: a.question.id.clone(),
            topic: a.question.topic.clone(),
            subtopic: a.question.subtopic.clone(),
            difficulty: a.question.difficulty,
            bloom_level: a.question.bloom_level,
            question: a.question.question.clone(),
            code: a.question.code.clone(),
            options: a.question.options.clone(),
            user_answer_index: a.row.user_answer_index,
            correct_index: a.question.correct_index,
            is_correct: is_correct(a),
            explanation: a.question.explanation.clone(),
            citations: a.question.citations.clone(),
        })
        .collect();

    AttemptResults {
        attempt_id: attempt.id.clone(),
        summary,
        by_topic,
        by_subtopic,
        by_bloom_level,
        by_difficulty,
        weak_areas,
        review,
    }
}

fn is_correct(assigned: &AssignedQuestion) -> bool {
    assigned.row.is_correct == Some(true)
}

/// Percentage rounded to two decimals; zero when `total` is zero.
pub fn percent(correct: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (correct as f64 / total as f64 * 10_000.0).round() / 100.0
}

fn group_key(label: &str) -> String {
    label.trim().to_lowercase()
}

/// Groups by a case-normalised label; the first spelling seen is displayed.
fn accuracy_by<F>(assigned: &[AssignedQuestion], label: F) -> Vec<CategoryAccuracy>
where
    F: Fn(&AssignedQuestion) -> Option<&str>,
{
    let mut groups: HashMap<String, CategoryAccuracy> = HashMap::new();
    for a in assigned {
        let Some(name) = label(a).filter(|l| !l.trim().is_empty()) else {
            continue;
        };
        let entry = groups
            .entry(group_key(name))
            .or_insert_with(|| CategoryAccuracy {
                category: name.trim().to_string(),
                total: 0,
                correct: 0,
                accuracy: 0.0,
            });
        entry.total += 1;
        if is_correct(a) {
            entry.correct += 1;
        }
    }

    let mut categories: Vec<CategoryAccuracy> = groups
        .into_values()
        .map(|mut c| {
            c.accuracy = percent(c.correct, c.total);
            c
        })
        .collect();
    categories.sort_by(|a, b| group_key(&a.category).cmp(&group_key(&b.category)));
    categories
}

fn weak_areas(assigned: &[AssignedQuestion], by_subtopic: &[CategoryAccuracy]) -> Vec<WeakArea> {
    let mut weak: Vec<&CategoryAccuracy> = by_subtopic
        .iter()
        .filter(|c| c.total >= WEAK_AREA_MIN_QUESTIONS && c.accuracy < WEAK_AREA_THRESHOLD)
        .collect();
    weak.sort_by(|a, b| {
        a.accuracy
            .partial_cmp(&b.accuracy)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.category.cmp(&b.category))
    });

    weak.into_iter()
        .take(MAX_WEAK_AREAS)
        .map(|category| {
            let key = group_key(&category.category);
            let members: Vec<&AssignedQuestion> = assigned
                .iter()
                .filter(|a| a.question.subtopic.as_deref().map(group_key).as_deref() == Some(key.as_str()))
                .collect();
            let topic = members
                .first()
                .map(|a| a.question.topic.clone())
                .unwrap_or_default();
            WeakArea {
                subtopic: category.category.clone(),
                recommendation: recommendation(&topic, category),
                citation: representative_citation(&members),
                topic,
                total: category.total,
                correct: category.correct,
                accuracy: category.accuracy,
            }
        })
        .collect()
}

/// Prefers a citation from a question the candidate missed.
fn representative_citation(members: &[&AssignedQuestion]) -> Option<Citation> {
    members
        .iter()
        .filter(|a| !is_correct(a))
        .chain(members.iter().filter(|a| is_correct(a)))
        .find_map(|a| a.question.citations.first().cloned())
}

fn recommendation(topic: &str, category: &CategoryAccuracy) -> String {
    let focus = if category.correct == 0 {
        "Start from the fundamentals"
    } else {
        "Revisit the core concepts"
    };
    format!(
        "{} of {} ({}): {} of {} answered correctly. {} and practise with small, focused examples.",
        category.category,
        topic,
        format_percent(category.accuracy),
        category.correct,
        category.total,
        focus
    )
}

fn format_percent(value: f64) -> String {
    format!("{:.0}%", value)
}
