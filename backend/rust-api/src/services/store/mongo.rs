use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, to_bson, Bson, Document};
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use mongodb::options::{IndexOptions, ReturnDocument};
use mongodb::{Collection, Database, IndexModel};
use serde::Deserialize;

use super::{
    rank_by_cosine, CandidateFilter, ExamStore, ProgressReset, RecordedAnswer, ScoredChunk,
    ScoredNeighbor, StoreError, StoreResult,
};
use crate::metrics::track_db_operation;
use crate::models::question::{BankQuestion, DocumentChunk};
use crate::models::selection::TopicEntry;
use crate::models::{Attempt, AttemptMetadata, AttemptQuestion, AttemptStatus};

const ATTEMPTS: &str = "attempts";
const ATTEMPT_QUESTIONS: &str = "attempt_questions";
const QUESTIONS: &str = "questions";
const DOCUMENTS: &str = "documents";
const ONTOLOGY: &str = "ontology";

const DUPLICATE_KEY: i32 = 11000;

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    #[serde(rename = "_id")]
    id: String,
    #[serde(default)]
    embedding: Vec<f32>,
}

pub struct MongoStore {
    db: Database,
}

impl MongoStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn attempts(&self) -> Collection<Attempt> {
        self.db.collection(ATTEMPTS)
    }

    fn attempt_questions(&self) -> Collection<AttemptQuestion> {
        self.db.collection(ATTEMPT_QUESTIONS)
    }

    fn questions(&self) -> Collection<BankQuestion> {
        self.db.collection(QUESTIONS)
    }

    fn documents(&self) -> Collection<DocumentChunk> {
        self.db.collection(DOCUMENTS)
    }

    /// Creates the uniqueness guarantees the assignment pipeline relies on.
    pub async fn ensure_indexes(&self) -> anyhow::Result<()> {
        let unique = || IndexOptions::builder().unique(true).build();

        self.attempt_questions()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "attempt_id": 1, "question_order": 1 })
                    .options(unique())
                    .build(),
            )
            .await
            .context("Failed to create attempt_questions slot index")?;

        self.attempts()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "user_id": 1, "status": 1 })
                    .build(),
            )
            .await
            .context("Failed to create attempts user index")?;

        // At most one running attempt per user, so concurrent creates cannot both land.
        self.attempts()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "user_id": 1 })
                    .options(
                        IndexOptions::builder()
                            .name("one_in_progress_per_user".to_string())
                            .unique(true)
                            .partial_filter_expression(
                                doc! { "status": AttemptStatus::InProgress.as_str() },
                            )
                            .build(),
                    )
                    .build(),
            )
            .await
            .context("Failed to create attempts in-progress index")?;

        self.questions()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "content_key": 1 })
                    .options(unique())
                    .build(),
            )
            .await
            .context("Failed to create questions content_key index")?;

        self.questions()
            .create_index(IndexModel::builder().keys(doc! { "topic": 1 }).build())
            .await
            .context("Failed to create questions topic index")?;

        tracing::info!("MongoDB indexes ensured");
        Ok(())
    }
}

fn is_duplicate_key(err: &MongoError) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => {
            write_error.code == DUPLICATE_KEY
        }
        ErrorKind::InsertMany(insert_error) => insert_error
            .write_errors
            .as_ref()
            .map(|errors| errors.iter().any(|e| e.code == DUPLICATE_KEY))
            .unwrap_or(false),
        _ => false,
    }
}

fn backend(err: MongoError, what: &str) -> StoreError {
    StoreError::Backend(anyhow::Error::new(err).context(what.to_string()))
}

fn label_regex(label: &str) -> Document {
    doc! { "$regex": format!("^{}$", regex::escape(label.trim())), "$options": "i" }
}

fn datetime_bson(value: Option<DateTime<Utc>>) -> StoreResult<Bson> {
    to_bson(&value)
        .context("Failed to encode timestamp")
        .map_err(StoreError::Backend)
}

#[async_trait]
impl ExamStore for MongoStore {
    async fn ping(&self) -> StoreResult<()> {
        self.db
            .run_command(doc! { "ping": 1 })
            .await
            .map(|_| ())
            .map_err(|e| backend(e, "MongoDB ping failed"))
    }

    async fn insert_attempt(&self, attempt: &Attempt) -> StoreResult<()> {
        track_db_operation("insert_one", ATTEMPTS, async {
            match self.attempts().insert_one(attempt).await {
                Ok(_) => Ok(()),
                Err(e) if is_duplicate_key(&e) => Err(StoreError::Conflict(format!(
                    "attempt {} collides with an existing attempt of user {}",
                    attempt.id, attempt.user_id
                ))),
                Err(e) => Err(backend(e, "Failed to insert attempt")),
            }
        })
        .await
    }

    async fn get_attempt(&self, attempt_id: &str) -> StoreResult<Option<Attempt>> {
        track_db_operation("find_one", ATTEMPTS, async {
            self.attempts()
                .find_one(doc! { "_id": attempt_id })
                .await
                .map_err(|e| backend(e, "Failed to load attempt"))
        })
        .await
    }

    async fn find_in_progress_attempt(&self, user_id: &str) -> StoreResult<Option<Attempt>> {
        // started_at is stored as an RFC 3339 string, so ordering happens here
        let attempts = track_db_operation("find", ATTEMPTS, async {
            self.attempts()
                .find(doc! { "user_id": user_id, "status": AttemptStatus::InProgress.as_str() })
                .await
                .map_err(|e| backend(e, "Failed to query attempts"))?
                .try_collect::<Vec<_>>()
                .await
                .map_err(|e| backend(e, "Failed to read attempts"))
        })
        .await?;
        Ok(attempts.into_iter().max_by_key(|a| a.started_at))
    }

    async fn list_attempts(&self, user_id: &str) -> StoreResult<Vec<Attempt>> {
        let mut attempts = track_db_operation("find", ATTEMPTS, async {
            self.attempts()
                .find(doc! { "user_id": user_id })
                .await
                .map_err(|e| backend(e, "Failed to query attempts"))?
                .try_collect::<Vec<_>>()
                .await
                .map_err(|e| backend(e, "Failed to read attempts"))
        })
        .await?;
        attempts.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(attempts)
    }

    async fn recent_completed_attempts(
        &self,
        user_id: &str,
        exclude_attempt_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<Attempt>> {
        let mut attempts = track_db_operation("find", ATTEMPTS, async {
            self.attempts()
                .find(doc! {
                    "user_id": user_id,
                    "status": AttemptStatus::Completed.as_str(),
                    "_id": { "$ne": exclude_attempt_id },
                })
                .await
                .map_err(|e| backend(e, "Failed to query completed attempts"))?
                .try_collect::<Vec<_>>()
                .await
                .map_err(|e| backend(e, "Failed to read completed attempts"))
        })
        .await?;
        attempts.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        attempts.truncate(limit);
        Ok(attempts)
    }

    async fn advance_progress(
        &self,
        attempt_id: &str,
        questions_answered: u32,
        correct_count: u32,
    ) -> StoreResult<Option<Attempt>> {
        let answered = questions_answered as i64;
        let filter = doc! {
            "_id": attempt_id,
            "status": AttemptStatus::InProgress.as_str(),
            "questions_answered": { "$lt": answered },
            "total_questions": { "$gte": answered },
        };
        let update = doc! {
            "$set": {
                "questions_answered": answered,
                "correct_count": correct_count as i64,
            }
        };
        track_db_operation("find_one_and_update", ATTEMPTS, async {
            self.attempts()
                .find_one_and_update(filter, update)
                .return_document(ReturnDocument::After)
                .await
                .map_err(|e| backend(e, "Failed to advance attempt progress"))
        })
        .await
    }

    async fn mark_completed(
        &self,
        attempt_id: &str,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let filter = doc! {
            "_id": attempt_id,
            "status": AttemptStatus::InProgress.as_str(),
            "$expr": { "$eq": ["$questions_answered", "$total_questions"] },
        };
        let update = doc! {
            "$set": {
                "status": AttemptStatus::Completed.as_str(),
                "completed_at": datetime_bson(Some(completed_at))?,
            }
        };
        let result = track_db_operation("update_one", ATTEMPTS, async {
            self.attempts()
                .update_one(filter, update)
                .await
                .map_err(|e| backend(e, "Failed to complete attempt"))
        })
        .await?;
        Ok(result.modified_count == 1)
    }

    async fn reset_progress(
        &self,
        attempt_id: &str,
        expected: AttemptStatus,
        reset: &ProgressReset,
    ) -> StoreResult<bool> {
        let filter = doc! { "_id": attempt_id, "status": expected.as_str() };
        let update = doc! {
            "$set": {
                "status": reset.status.as_str(),
                "questions_answered": reset.questions_answered as i64,
                "correct_count": reset.correct_count as i64,
                "completed_at": datetime_bson(reset.completed_at)?,
            }
        };
        let result = track_db_operation("update_one", ATTEMPTS, async {
            match self.attempts().update_one(filter, update).await {
                Ok(result) => Ok(result),
                Err(e) if is_duplicate_key(&e) => Err(StoreError::Conflict(format!(
                    "another attempt is already in progress for the owner of {}",
                    attempt_id
                ))),
                Err(e) => Err(backend(e, "Failed to reset attempt progress")),
            }
        })
        .await?;
        Ok(result.matched_count == 1)
    }

    async fn update_metadata(
        &self,
        attempt_id: &str,
        metadata: &AttemptMetadata,
    ) -> StoreResult<()> {
        let encoded = to_bson(metadata)
            .context("Failed to encode attempt metadata")
            .map_err(StoreError::Backend)?;
        let result = track_db_operation("update_one", ATTEMPTS, async {
            self.attempts()
                .update_one(doc! { "_id": attempt_id }, doc! { "$set": { "metadata": encoded } })
                .await
                .map_err(|e| backend(e, "Failed to update attempt metadata"))
        })
        .await?;
        if result.matched_count == 0 {
            return Err(StoreError::NotFound(format!("attempt {}", attempt_id)));
        }
        Ok(())
    }

    async fn delete_attempts_for_user(&self, user_id: &str) -> StoreResult<u64> {
        let ids: Vec<String> = self
            .list_attempts(user_id)
            .await?
            .into_iter()
            .map(|a| a.id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        track_db_operation("delete_many", ATTEMPT_QUESTIONS, async {
            self.attempt_questions()
                .delete_many(doc! { "attempt_id": { "$in": ids.clone() } })
                .await
                .map_err(|e| backend(e, "Failed to delete attempt questions"))
        })
        .await?;

        let result = track_db_operation("delete_many", ATTEMPTS, async {
            self.attempts()
                .delete_many(doc! { "_id": { "$in": ids.clone() } })
                .await
                .map_err(|e| backend(e, "Failed to delete attempts"))
        })
        .await?;
        Ok(result.deleted_count)
    }

    async fn list_attempt_questions(&self, attempt_id: &str) -> StoreResult<Vec<AttemptQuestion>> {
        track_db_operation("find", ATTEMPT_QUESTIONS, async {
            self.attempt_questions()
                .find(doc! { "attempt_id": attempt_id })
                .sort(doc! { "question_order": 1 })
                .await
                .map_err(|e| backend(e, "Failed to query attempt questions"))?
                .try_collect()
                .await
                .map_err(|e| backend(e, "Failed to read attempt questions"))
        })
        .await
    }

    async fn list_attempt_questions_for(
        &self,
        attempt_ids: &[String],
    ) -> StoreResult<Vec<AttemptQuestion>> {
        if attempt_ids.is_empty() {
            return Ok(Vec::new());
        }
        track_db_operation("find", ATTEMPT_QUESTIONS, async {
            self.attempt_questions()
                .find(doc! { "attempt_id": { "$in": attempt_ids.to_vec() } })
                .await
                .map_err(|e| backend(e, "Failed to query attempt questions"))?
                .try_collect()
                .await
                .map_err(|e| backend(e, "Failed to read attempt questions"))
        })
        .await
    }

    async fn insert_attempt_question(&self, row: &AttemptQuestion) -> StoreResult<()> {
        track_db_operation("insert_one", ATTEMPT_QUESTIONS, async {
            match self.attempt_questions().insert_one(row).await {
                Ok(_) => Ok(()),
                Err(e) if is_duplicate_key(&e) => Err(StoreError::Conflict(format!(
                    "attempt {} already has question_order {}",
                    row.attempt_id, row.question_order
                ))),
                Err(e) => Err(backend(e, "Failed to insert attempt question")),
            }
        })
        .await
    }

    async fn record_answer(
        &self,
        attempt_id: &str,
        question_order: u32,
        answer: &RecordedAnswer,
    ) -> StoreResult<bool> {
        let filter = doc! {
            "attempt_id": attempt_id,
            "question_order": question_order as i64,
            "user_answer_index": Bson::Null,
        };
        let update = doc! {
            "$set": {
                "user_answer_index": answer.answer_index as i32,
                "is_correct": answer.is_correct,
                "time_spent_seconds": answer.time_spent_seconds as i64,
                "answered_at": datetime_bson(Some(answer.answered_at))?,
            }
        };
        let result = track_db_operation("update_one", ATTEMPT_QUESTIONS, async {
            self.attempt_questions()
                .update_one(filter, update)
                .await
                .map_err(|e| backend(e, "Failed to record answer"))
        })
        .await?;
        Ok(result.modified_count == 1)
    }

    async fn get_questions(&self, ids: &[String]) -> StoreResult<Vec<BankQuestion>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        track_db_operation("find", QUESTIONS, async {
            self.questions()
                .find(doc! { "_id": { "$in": ids.to_vec() } })
                .await
                .map_err(|e| backend(e, "Failed to query questions"))?
                .try_collect()
                .await
                .map_err(|e| backend(e, "Failed to read questions"))
        })
        .await
    }

    async fn find_candidates(&self, filter: &CandidateFilter) -> StoreResult<Vec<BankQuestion>> {
        let mut query = doc! {};
        if !filter.exclude_ids.is_empty() {
            query.insert("_id", doc! { "$nin": filter.exclude_ids.clone() });
        }
        if let Some(topic) = filter.topic.as_deref() {
            query.insert("topic", label_regex(topic));
        }
        if let Some(difficulty) = filter.difficulty {
            query.insert("difficulty", difficulty.as_str());
        }
        track_db_operation("find", QUESTIONS, async {
            self.questions()
                .find(query)
                .limit(filter.limit as i64)
                .await
                .map_err(|e| backend(e, "Failed to query candidate questions"))?
                .try_collect()
                .await
                .map_err(|e| backend(e, "Failed to read candidate questions"))
        })
        .await
    }

    async fn nearest_questions(
        &self,
        embedding: &[f32],
        topic: Option<&str>,
        k: usize,
    ) -> StoreResult<Vec<ScoredNeighbor>> {
        let mut query = doc! { "embedding.0": { "$exists": true } };
        if let Some(topic) = topic {
            query.insert("topic", label_regex(topic));
        }
        let rows: Vec<EmbeddingRow> = track_db_operation("find", QUESTIONS, async {
            self.questions()
                .clone_with_type::<EmbeddingRow>()
                .find(query)
                .projection(doc! { "embedding": 1 })
                .await
                .map_err(|e| backend(e, "Failed to query question embeddings"))?
                .try_collect()
                .await
                .map_err(|e| backend(e, "Failed to read question embeddings"))
        })
        .await?;
        let items = rows
            .iter()
            .map(|row| (row.id.as_str(), row.embedding.as_slice()));
        Ok(rank_by_cosine(embedding, items, k)
            .into_iter()
            .map(|(question_id, score)| ScoredNeighbor { question_id, score })
            .collect())
    }

    async fn insert_question(&self, question: &BankQuestion) -> StoreResult<()> {
        track_db_operation("insert_one", QUESTIONS, async {
            match self.questions().insert_one(question).await {
                Ok(_) => Ok(()),
                Err(e) if is_duplicate_key(&e) => Err(StoreError::Conflict(format!(
                    "content_key {} already stored",
                    question.content_key
                ))),
                Err(e) => Err(backend(e, "Failed to insert question")),
            }
        })
        .await
    }

    async fn find_question_by_content_key(&self, key: &str) -> StoreResult<Option<BankQuestion>> {
        track_db_operation("find_one", QUESTIONS, async {
            self.questions()
                .find_one(doc! { "content_key": key })
                .await
                .map_err(|e| backend(e, "Failed to look up content key"))
        })
        .await
    }

    async fn any_question_excluding(
        &self,
        exclude_ids: &[String],
    ) -> StoreResult<Option<BankQuestion>> {
        track_db_operation("find_one", QUESTIONS, async {
            self.questions()
                .find_one(doc! { "_id": { "$nin": exclude_ids.to_vec() } })
                .await
                .map_err(|e| backend(e, "Failed to pick backfill question"))
        })
        .await
    }

    async fn search_documents(
        &self,
        embedding: &[f32],
        topic: Option<&str>,
        subtopic: Option<&str>,
        k: usize,
    ) -> StoreResult<Vec<ScoredChunk>> {
        let mut query = doc! {};
        if let Some(topic) = topic {
            query.insert("topic", label_regex(topic));
        }
        if let Some(subtopic) = subtopic {
            query.insert(
                "$or",
                vec![
                    doc! { "subtopic": label_regex(subtopic) },
                    doc! { "subtopic": Bson::Null },
                ],
            );
        }
        let chunks: Vec<DocumentChunk> = track_db_operation("find", DOCUMENTS, async {
            self.documents()
                .find(query)
                .await
                .map_err(|e| backend(e, "Failed to query documents"))?
                .try_collect()
                .await
                .map_err(|e| backend(e, "Failed to read documents"))
        })
        .await?;
        let ranked = rank_by_cosine(
            embedding,
            chunks
                .iter()
                .map(|chunk| (chunk.id.as_str(), chunk.embedding.as_slice())),
            k,
        );
        Ok(ranked
            .into_iter()
            .filter_map(|(id, score)| {
                chunks.iter().find(|c| c.id == id).map(|chunk| ScoredChunk {
                    chunk: chunk.clone(),
                    score,
                })
            })
            .collect())
    }

    async fn list_ontology(&self) -> StoreResult<Vec<TopicEntry>> {
        track_db_operation("find", ONTOLOGY, async {
            self.db
                .collection::<TopicEntry>(ONTOLOGY)
                .find(doc! {})
                .await
                .map_err(|e| backend(e, "Failed to query ontology"))?
                .try_collect()
                .await
                .map_err(|e| backend(e, "Failed to read ontology"))
        })
        .await
    }
}
