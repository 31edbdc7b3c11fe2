use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use std::sync::Arc;

use crate::metrics::{record_cache_hit, record_cache_miss, record_cache_operation};
use crate::models::selection::TopicEntry;
use crate::services::store::ExamStore;

const CACHE_KEY: &str = "ontology:topics:v1";
const CACHE_TTL: u64 = 300; // 5 minutes

/// Topic/subtopic source for the criteria selector.
///
/// Lookup order is Redis cache, then the `ontology` store collection, then a
/// hardcoded list. The cache is an optimisation only and may be lost at any time.
pub struct OntologyService {
    store: Arc<dyn ExamStore>,
    redis: Option<ConnectionManager>,
}

impl OntologyService {
    pub fn new(store: Arc<dyn ExamStore>, redis: Option<ConnectionManager>) -> Self {
        Self { store, redis }
    }

    /// Never fails; an unavailable ontology degrades to [`fallback_topics`].
    pub async fn topics(&self) -> Vec<TopicEntry> {
        if let Some(cached) = self.cached().await {
            record_cache_hit();
            return cached;
        }
        record_cache_miss();

        match self.store.list_ontology().await {
            Ok(entries) => {
                let entries = sanitize(entries);
                if !entries.is_empty() {
                    if let Err(e) = self.cache(&entries).await {
                        tracing::debug!("Ontology cache write skipped: {}", e);
                    }
                    return entries;
                }
                tracing::warn!("Ontology collection is empty; using built-in topic list");
            }
            Err(e) => {
                tracing::warn!("Ontology unavailable ({}); using built-in topic list", e);
            }
        }
        fallback_topics()
    }

    async fn cached(&self) -> Option<Vec<TopicEntry>> {
        let mut conn = self.redis.clone()?;
        let raw: Option<String> = match redis::cmd("GET")
            .arg(CACHE_KEY)
            .query_async(&mut conn)
            .await
        {
            Ok(raw) => {
                record_cache_operation("get", true);
                raw
            }
            Err(e) => {
                record_cache_operation("get", false);
                tracing::debug!("Ontology cache read failed: {}", e);
                return None;
            }
        };
        raw.and_then(|raw| serde_json::from_str::<Vec<TopicEntry>>(&raw).ok())
            .filter(|entries| !entries.is_empty())
    }

    async fn cache(&self, entries: &[TopicEntry]) -> Result<()> {
        let Some(mut conn) = self.redis.clone() else {
            return Ok(());
        };
        let payload = serde_json::to_string(entries)?;
        let result = redis::cmd("SETEX")
            .arg(CACHE_KEY)
            .arg(CACHE_TTL)
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await
            .context("Failed to cache ontology");
        record_cache_operation("setex", result.is_ok());
        result
    }
}

fn sanitize(entries: Vec<TopicEntry>) -> Vec<TopicEntry> {
    entries
        .into_iter()
        .filter(|entry| !entry.topic.trim().is_empty())
        .map(|entry| TopicEntry {
            topic: entry.topic.trim().to_string(),
            subtopics: entry
                .subtopics
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        })
        .collect()
}

/// Built-in frontend topic list used when no ontology is reachable.
pub fn fallback_topics() -> Vec<TopicEntry> {
    let entry = |topic: &str, subtopics: &[&str]| TopicEntry {
        topic: topic.to_string(),
        subtopics: subtopics.iter().map(|s| s.to_string()).collect(),
    };
    vec![
        entry(
            "JavaScript",
            &["Closures", "Event Loop", "Promises", "Prototypes", "Scope"],
        ),
        entry(
            "React",
            &["Hooks", "State Management", "Rendering", "Context", "Performance"],
        ),
        entry("CSS", &["Flexbox", "Grid", "Specificity", "Box Model", "Animations"]),
        entry("HTML", &["Semantics", "Forms", "Accessibility", "Metadata"]),
        entry("TypeScript", &["Generics", "Type Narrowing", "Utility Types", "Interfaces"]),
        entry(
            "Web Performance",
            &["Core Web Vitals", "Caching", "Lazy Loading", "Bundling"],
        ),
        entry("Browser APIs", &["DOM", "Fetch", "Storage", "Web Workers"]),
    ]
}
