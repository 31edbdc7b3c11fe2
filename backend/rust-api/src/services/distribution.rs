use std::collections::HashMap;

use crate::models::question::{BankQuestion, Difficulty};
use crate::models::selection::Distributions;
use crate::models::AttemptQuestion;
use crate::services::store::{ExamStore, StoreResult};

/// An attempt slot joined with the bank question it holds.
#[derive(Debug, Clone)]
pub struct AssignedQuestion {
    pub row: AttemptQuestion,
    pub question: BankQuestion,
}

/// Loads every assigned slot of an attempt, ordered, with its bank question.
///
/// Rows whose question has vanished from the bank are dropped with a warning.
pub async fn load_assigned(
    store: &dyn ExamStore,
    attempt_id: &str,
) -> StoreResult<Vec<AssignedQuestion>> {
    let rows = store.list_attempt_questions(attempt_id).await?;
    let ids: Vec<String> = rows.iter().map(|row| row.question_id.clone()).collect();
    let mut bank: HashMap<String, BankQuestion> = store
        .get_questions(&ids)
        .await?
        .into_iter()
        .map(|q| (q.id.clone(), q))
        .collect();

    let mut assigned = Vec::with_capacity(rows.len());
    for row in rows {
        // the same bank question is never held twice in one attempt
        match bank.remove(&row.question_id) {
            Some(question) => assigned.push(AssignedQuestion { row, question }),
            None => tracing::warn!(
                "Attempt {} slot {} references missing question {}",
                attempt_id,
                row.question_order,
                row.question_id
            ),
        }
    }
    Ok(assigned)
}

/// Folds assigned questions into coverage counts.
pub fn compute_distributions<'a, I>(questions: I) -> Distributions
where
    I: IntoIterator<Item = &'a BankQuestion>,
{
    let mut distributions = Distributions::default();
    for question in questions {
        match question.difficulty {
            Difficulty::Easy => distributions.easy_count += 1,
            Difficulty::Medium => distributions.medium_count += 1,
            Difficulty::Hard => distributions.hard_count += 1,
        }
        if question.is_coding() {
            distributions.coding_count += 1;
        }

        bump(&mut distributions.topic_distribution, &question.topic);
        if let Some(subtopic) = question.subtopic.as_deref() {
            bump(&mut distributions.subtopic_distribution, subtopic);
        }
        bump(
            &mut distributions.bloom_distribution,
            question.bloom_level.as_str(),
        );
    }
    distributions
}

fn bump(histogram: &mut HashMap<String, u32>, label: &str) {
    let label = label.trim();
    if label.is_empty() {
        return;
    }
    // merge case variants into the first spelling seen
    let key = histogram
        .keys()
        .find(|existing| existing.eq_ignore_ascii_case(label))
        .cloned()
        .unwrap_or_else(|| label.to_string());
    *histogram.entry(key).or_insert(0) += 1;
}
