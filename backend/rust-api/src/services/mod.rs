use crate::config::{Config, StorageBackend};
use mongodb::Client as MongoClient;
use rand::rngs::StdRng;
use rand::SeedableRng;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;

use self::llm::{build_providers, EmbeddingProvider, LlmProvider};
use self::store::memory::MemoryStore;
use self::store::mongo::MongoStore;
use self::store::ExamStore;

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn ExamStore>,
    pub llm: Arc<dyn LlmProvider>,
    pub embeddings: Arc<dyn EmbeddingProvider>,
    /// Ontology cache only; `None` runs without it.
    pub redis: Option<ConnectionManager>,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let store: Arc<dyn ExamStore> = match config.storage_backend {
            StorageBackend::Mongo => {
                tracing::info!("Connecting to MongoDB...");
                let client = MongoClient::with_uri_str(&config.mongo_uri).await?;
                let mongo = MongoStore::new(client.database(&config.mongo_database));
                mongo.ensure_indexes().await?;
                tracing::info!("MongoDB connected: database={}", config.mongo_database);
                Arc::new(mongo)
            }
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory store; all data is lost on restart");
                Arc::new(MemoryStore::new())
            }
        };

        let redis = match config.redis_uri.as_deref() {
            Some(uri) => match connect_redis(uri).await {
                Ok(manager) => Some(manager),
                Err(e) => {
                    tracing::warn!("Redis unavailable, ontology cache disabled: {}", e);
                    None
                }
            },
            None => None,
        };

        let (llm, embeddings) = build_providers(&config.llm)?;

        Ok(Self {
            config,
            store,
            llm,
            embeddings,
            redis,
        })
    }

    /// Assembles a state from ready-made components.
    pub fn with_components(
        config: Config,
        store: Arc<dyn ExamStore>,
        llm: Arc<dyn LlmProvider>,
        embeddings: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            config,
            store,
            llm,
            embeddings,
            redis: None,
        }
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_millis(self.config.llm.timeout_ms)
    }

    /// Per-request RNG: fixed seed when configured, OS entropy otherwise.
    pub fn request_rng(&self) -> StdRng {
        match self.config.exam.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        }
    }
}

async fn connect_redis(uri: &str) -> anyhow::Result<ConnectionManager> {
    tracing::info!("Attempting to connect to Redis...");
    let client = redis::Client::open(uri)?;

    let redis = tokio::time::timeout(Duration::from_secs(10), ConnectionManager::new(client))
        .await
        .map_err(|_| anyhow::anyhow!("Redis connection timeout after 10s"))??;

    let mut conn = redis.clone();
    tokio::time::timeout(
        Duration::from_secs(5),
        redis::cmd("PING").query_async::<String>(&mut conn),
    )
    .await
    .map_err(|_| anyhow::anyhow!("Redis PING timeout after 5s"))??;

    tracing::info!("Redis connection established successfully");
    Ok(redis)
}

pub mod answer_service;
pub mod assignment_service;
pub mod attempt_service;
pub mod candidate_scorer;
pub mod criteria_service;
pub mod distribution;
pub mod llm;
pub mod ontology_service;
pub mod question_generator;
pub mod results_service;
pub mod selection_service;
pub mod store;
