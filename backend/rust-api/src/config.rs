use serde::Deserialize;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Mongo,
    Memory,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::Mongo => "mongo",
            StorageBackend::Memory => "memory",
        }
    }
}

impl FromStr for StorageBackend {
    type Err = config::ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mongo" | "mongodb" => Ok(StorageBackend::Mongo),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(config::ConfigError::Message(format!(
                "unknown storage.backend '{}'",
                other
            ))),
        }
    }
}

/// OpenAI-compatible provider settings. A missing `api_key` disables every model call.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub embedding_model: String,
    pub timeout_ms: u64,
    pub embedding_batch_size: usize,
    pub judge_enabled: bool,
}

impl LlmConfig {
    pub fn is_configured(&self) -> bool {
        self.api_key
            .as_deref()
            .map(|key| !key.trim().is_empty())
            .unwrap_or(false)
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            timeout_ms: 15_000,
            embedding_batch_size: 64,
            judge_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExamConfig {
    /// Fixed seed for every request RNG; `None` seeds from the OS.
    pub rng_seed: Option<u64>,
    pub candidate_pool_limit: usize,
    pub top_k: usize,
    pub dev_reset_enabled: bool,
}

impl Default for ExamConfig {
    fn default() -> Self {
        Self {
            rng_seed: None,
            candidate_pool_limit: 40,
            top_k: 8,
            dev_reset_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mongo_uri: String,
    pub mongo_database: String,
    pub storage_backend: StorageBackend,
    /// Ontology cache; the service runs without it.
    pub redis_uri: Option<String>,
    pub jwt_secret: String,
    pub llm: LlmConfig,
    pub exam: ExamConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mongo_uri: "mongodb://localhost:27017".to_string(),
            mongo_database: "frontend_assessment".to_string(),
            storage_backend: StorageBackend::Memory,
            redis_uri: None,
            jwt_secret: "dev-secret-only-for-local-testing".to_string(),
            llm: LlmConfig::default(),
            exam: ExamConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Root .env first, then local .env
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env {
            dotenvy::dotenv().ok();
        } else if dotenvy::from_path("../../.env").is_err() {
            dotenvy::dotenv().ok();
        }

        let env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // config/*.toml + APP_ env overrides
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", env)).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        let defaults = Config::default();
        let string = |key: &str, var: &str| {
            settings
                .get_string(key)
                .ok()
                .or_else(|| env::var(var).ok())
                .filter(|value| !value.trim().is_empty())
        };
        let boolean = |key: &str, var: &str, default: bool| {
            settings
                .get_bool(key)
                .ok()
                .or_else(|| env::var(var).ok().and_then(|v| v.parse().ok()))
                .unwrap_or(default)
        };
        let number = |key: &str, var: &str| {
            settings
                .get_int(key)
                .ok()
                .or_else(|| env::var(var).ok().and_then(|v| v.parse().ok()))
        };

        let mongo_uri = string("database.mongo_uri", "MONGO_URI").unwrap_or(defaults.mongo_uri);
        let mongo_database = string("database.mongo_database", "MONGO_DATABASE")
            .unwrap_or(defaults.mongo_database);

        let storage_backend = match string("storage.backend", "STORAGE_BACKEND") {
            Some(raw) => raw.parse()?,
            None => StorageBackend::Mongo,
        };

        let redis_uri = string("redis.uri", "REDIS_URI");

        let jwt_secret = match string("auth.jwt_secret", "JWT_SECRET") {
            Some(secret) => secret,
            None if env == "prod" => {
                return Err(config::ConfigError::Message(
                    "JWT_SECRET must be set in production".to_string(),
                ))
            }
            None => {
                eprintln!("WARNING: Using default JWT_SECRET (dev mode only!)");
                defaults.jwt_secret
            }
        };

        let llm = LlmConfig {
            base_url: string("llm.base_url", "LLM_BASE_URL").unwrap_or(defaults.llm.base_url),
            api_key: string("llm.api_key", "LLM_API_KEY"),
            model: string("llm.model", "LLM_MODEL").unwrap_or(defaults.llm.model),
            embedding_model: string("llm.embedding_model", "LLM_EMBEDDING_MODEL")
                .unwrap_or(defaults.llm.embedding_model),
            timeout_ms: number("llm.timeout_ms", "LLM_TIMEOUT_MS")
                .map(|v| v.max(1) as u64)
                .unwrap_or(defaults.llm.timeout_ms),
            embedding_batch_size: number("llm.embedding_batch_size", "LLM_EMBEDDING_BATCH_SIZE")
                .map(|v| v.max(1) as usize)
                .unwrap_or(defaults.llm.embedding_batch_size),
            judge_enabled: boolean("llm.judge_enabled", "LLM_JUDGE_ENABLED", false),
        };

        let exam = ExamConfig {
            rng_seed: number("exam.rng_seed", "EXAM_RNG_SEED").map(|v| v as u64),
            candidate_pool_limit: number("exam.candidate_pool_limit", "EXAM_CANDIDATE_POOL_LIMIT")
                .map(|v| v.max(1) as usize)
                .unwrap_or(defaults.exam.candidate_pool_limit),
            top_k: number("exam.top_k", "EXAM_TOP_K")
                .map(|v| v.max(1) as usize)
                .unwrap_or(defaults.exam.top_k),
            dev_reset_enabled: boolean(
                "exam.dev_reset_enabled",
                "EXAM_DEV_RESET_ENABLED",
                env == "dev",
            ),
        };

        Ok(Config {
            mongo_uri,
            mongo_database,
            storage_backend,
            redis_uri,
            jwt_secret,
            llm,
            exam,
        })
    }
}
