use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PalaceConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub guard: GuardConfig,
    pub lane: LaneConfig,
    pub index: IndexConfig,
    pub retrieval: RetrievalConfig,
    pub embedding: EmbeddingConfig,
    pub reranker: RerankerConfig,
    pub llm: LlmConfig,
    pub governance: GovernanceConfig,
    pub sleep: SleepConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    pub valid_domains: Vec<String>,
    pub core_memory_uris: Vec<String>,
    pub migration_lock_file: Option<String>,
    pub migration_lock_timeout_secs: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AuthConfig {
    pub api_key: Option<String>,
    pub allow_insecure_local: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GuardConfig {
    pub sem_noop_threshold: f64,
    pub sem_update_low: f64,
    pub kw_noop_threshold: f64,
    pub kw_update_threshold: f64,
    pub llm_consult_threshold: f64,
    pub supersede_length_ratio: f64,
    pub supersede_overlap: f64,
    pub candidate_pool: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LaneConfig {
    pub global_concurrency: usize,
    pub wait_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IndexConfig {
    pub queue_capacity: usize,
    pub recent_jobs_ring: usize,
    pub defer_on_write: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_mode: String,
    pub default_max_results: usize,
    pub default_candidate_multiplier: usize,
    pub keyword_weight: f64,
    pub semantic_weight: f64,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub recency_half_life_days: f64,
    pub temporal_window_days: i64,
    pub intent_strong_margin: usize,
    pub intent_ambiguous_margin: usize,
    pub intent_floor: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// One of: none, hash, router, api.
    pub backend: String,
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub dim: usize,
    pub timeout_secs: f64,
    pub max_retries: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RerankerConfig {
    pub enabled: bool,
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub weight: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub guard_enabled: bool,
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub gist_api_base: Option<String>,
    pub gist_api_key: Option<String>,
    pub gist_model: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GovernanceConfig {
    pub vitality_max: f64,
    pub vitality_floor: f64,
    pub reinforce_delta: f64,
    pub decay_half_life_days: f64,
    pub cleanup_threshold: f64,
    pub cleanup_inactive_days: f64,
    pub review_ttl_secs: u64,
    pub max_pending_reviews: usize,
    pub decay_check_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SleepConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub dedup_apply: bool,
    pub rollup_apply: bool,
    pub rollup_max_chars: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub session_first_search: bool,
    pub cache_max_hits: usize,
    pub cache_half_life_secs: u64,
    pub flush_trigger_chars: usize,
    pub flush_min_events: usize,
    pub flush_parent_uri: String,
    pub flush_priority: i64,
}

impl Default for PalaceConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            auth: AuthConfig::default(),
            guard: GuardConfig::default(),
            lane: LaneConfig::default(),
            index: IndexConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            reranker: RerankerConfig::default(),
            llm: LlmConfig::default(),
            governance: GovernanceConfig::default(),
            sleep: SleepConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8727,
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_palace_dir()
            .join("palace.db")
            .to_string_lossy()
            .into_owned();
        Self {
            db_path,
            valid_domains: ["core", "writer", "game", "notes", "system"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            core_memory_uris: Vec::new(),
            migration_lock_file: None,
            migration_lock_timeout_secs: 10.0,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            allow_insecure_local: false,
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            sem_noop_threshold: 0.92,
            sem_update_low: 0.78,
            kw_noop_threshold: 0.82,
            kw_update_threshold: 0.55,
            llm_consult_threshold: 0.30,
            supersede_length_ratio: 1.2,
            supersede_overlap: 0.6,
            candidate_pool: 6,
        }
    }
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            global_concurrency: 1,
            wait_timeout_ms: 10_000,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            recent_jobs_ring: 30,
            defer_on_write: true,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_mode: "keyword".into(),
            default_max_results: 10,
            default_candidate_multiplier: 4,
            keyword_weight: 0.3,
            semantic_weight: 0.7,
            chunk_size: 500,
            chunk_overlap: 80,
            recency_half_life_days: 30.0,
            temporal_window_days: 30,
            intent_strong_margin: 1,
            intent_ambiguous_margin: 1,
            intent_floor: 1,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: "hash".into(),
            api_base: String::new(),
            api_key: String::new(),
            model: "hash-v1".into(),
            dim: 64,
            timeout_secs: 8.0,
            max_retries: 2,
        }
    }
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_base: String::new(),
            api_key: String::new(),
            model: String::new(),
            weight: 0.25,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            guard_enabled: false,
            api_base: String::new(),
            api_key: String::new(),
            model: String::new(),
            gist_api_base: None,
            gist_api_key: None,
            gist_model: None,
        }
    }
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            vitality_max: 3.0,
            vitality_floor: 0.05,
            reinforce_delta: 0.08,
            decay_half_life_days: 30.0,
            cleanup_threshold: 0.35,
            cleanup_inactive_days: 14.0,
            review_ttl_secs: 900,
            max_pending_reviews: 64,
            decay_check_interval_secs: 600,
        }
    }
}

impl Default for SleepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 1800,
            dedup_apply: false,
            rollup_apply: false,
            rollup_max_chars: 1200,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_first_search: true,
            cache_max_hits: 200,
            cache_half_life_secs: 6 * 3600,
            flush_trigger_chars: 6000,
            flush_min_events: 6,
            flush_parent_uri: "notes://".into(),
            flush_priority: 2,
        }
    }
}

/// Returns `~/.palace/`
pub fn default_palace_dir() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".palace")
}

/// Returns the default config file path: `~/.palace/config.toml`
pub fn default_config_path() -> PathBuf {
    default_palace_dir().join("config.toml")
}

impl PalaceConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            PalaceConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides. All knobs are read at startup;
    /// changes require a restart.
    pub fn apply_env_overrides(&mut self) {
        env_str("PALACE_DB", &mut self.storage.db_path);
        env_str("PALACE_LOG_LEVEL", &mut self.server.log_level);
        env_str("PALACE_HOST", &mut self.server.host);
        env_parse("PALACE_PORT", &mut self.server.port);

        if let Ok(val) = std::env::var("VALID_DOMAINS") {
            let domains: Vec<String> = val
                .split(',')
                .map(|d| d.trim().to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect();
            if !domains.is_empty() {
                self.storage.valid_domains = domains;
            }
        }
        if let Ok(val) = std::env::var("CORE_MEMORY_URIS") {
            self.storage.core_memory_uris = val
                .split(',')
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty())
                .collect();
        }
        if let Ok(val) = std::env::var("DB_MIGRATION_LOCK_FILE") {
            if !val.trim().is_empty() {
                self.storage.migration_lock_file = Some(val.trim().to_string());
            }
        }
        env_parse(
            "DB_MIGRATION_LOCK_TIMEOUT",
            &mut self.storage.migration_lock_timeout_secs,
        );

        if let Ok(val) = std::env::var("MCP_API_KEY") {
            if !val.trim().is_empty() {
                self.auth.api_key = Some(val.trim().to_string());
            }
        }
        env_bool(
            "MCP_API_KEY_ALLOW_INSECURE_LOCAL",
            &mut self.auth.allow_insecure_local,
        );

        env_parse("GLOBAL_CONCURRENCY", &mut self.lane.global_concurrency);
        env_parse("LANE_WAIT_TIMEOUT", &mut self.lane.wait_timeout_ms);

        env_parse("INDEX_QUEUE_CAPACITY", &mut self.index.queue_capacity);
        env_parse("INDEX_RECENT_JOBS_RING", &mut self.index.recent_jobs_ring);
        env_bool("INDEX_DEFER_ON_WRITE", &mut self.index.defer_on_write);

        env_str("SEARCH_DEFAULT_MODE", &mut self.retrieval.default_mode);
        env_parse(
            "RETRIEVAL_HYBRID_KEYWORD_WEIGHT",
            &mut self.retrieval.keyword_weight,
        );
        env_parse(
            "RETRIEVAL_HYBRID_SEMANTIC_WEIGHT",
            &mut self.retrieval.semantic_weight,
        );
        env_parse("RETRIEVAL_CHUNK_SIZE", &mut self.retrieval.chunk_size);
        env_parse(
            "INTENT_STRONG_MARGIN",
            &mut self.retrieval.intent_strong_margin,
        );
        env_parse(
            "INTENT_AMBIGUOUS_MARGIN",
            &mut self.retrieval.intent_ambiguous_margin,
        );
        env_parse("INTENT_FLOOR", &mut self.retrieval.intent_floor);

        env_str("RETRIEVAL_EMBEDDING_BACKEND", &mut self.embedding.backend);
        env_str("RETRIEVAL_EMBEDDING_API_BASE", &mut self.embedding.api_base);
        env_str("RETRIEVAL_EMBEDDING_API_KEY", &mut self.embedding.api_key);
        env_str("RETRIEVAL_EMBEDDING_MODEL", &mut self.embedding.model);
        env_parse("RETRIEVAL_EMBEDDING_DIM", &mut self.embedding.dim);
        env_parse("MAX_REMOTE_RETRIES", &mut self.embedding.max_retries);

        env_bool("RETRIEVAL_RERANKER_ENABLED", &mut self.reranker.enabled);
        env_str("RETRIEVAL_RERANKER_API_BASE", &mut self.reranker.api_base);
        env_str("RETRIEVAL_RERANKER_API_KEY", &mut self.reranker.api_key);
        env_str("RETRIEVAL_RERANKER_MODEL", &mut self.reranker.model);
        env_parse("RETRIEVAL_RERANKER_WEIGHT", &mut self.reranker.weight);

        env_bool("WRITE_GUARD_LLM_ENABLED", &mut self.llm.guard_enabled);
        env_str("WRITE_GUARD_LLM_API_BASE", &mut self.llm.api_base);
        env_str("WRITE_GUARD_LLM_API_KEY", &mut self.llm.api_key);
        env_str("WRITE_GUARD_LLM_MODEL", &mut self.llm.model);
        env_opt_str("COMPACT_GIST_LLM_API_BASE", &mut self.llm.gist_api_base);
        env_opt_str("COMPACT_GIST_LLM_API_KEY", &mut self.llm.gist_api_key);
        env_opt_str("COMPACT_GIST_LLM_MODEL", &mut self.llm.gist_model);

        env_parse("VITALITY_MAX", &mut self.governance.vitality_max);
        env_parse("VITALITY_FLOOR", &mut self.governance.vitality_floor);
        env_parse("REINFORCE_DELTA", &mut self.governance.reinforce_delta);
        env_parse(
            "DECAY_HALF_LIFE_DAYS",
            &mut self.governance.decay_half_life_days,
        );
        env_parse("CLEANUP_THRESHOLD", &mut self.governance.cleanup_threshold);
        env_parse(
            "CLEANUP_INACTIVE_DAYS",
            &mut self.governance.cleanup_inactive_days,
        );
        env_parse(
            "CLEANUP_REVIEW_TTL_SECONDS",
            &mut self.governance.review_ttl_secs,
        );
        env_parse(
            "MAX_PENDING_REVIEWS",
            &mut self.governance.max_pending_reviews,
        );

        env_bool("SLEEP_DEDUP_APPLY", &mut self.sleep.dedup_apply);
        env_bool("SLEEP_ROLLUP_APPLY", &mut self.sleep.rollup_apply);
        env_parse("SLEEP_ROLLUP_MAX_CHARS", &mut self.sleep.rollup_max_chars);
    }

    /// Gist LLM config falls back to the write-guard LLM config.
    pub fn gist_llm(&self) -> (String, String, String) {
        (
            self.llm
                .gist_api_base
                .clone()
                .unwrap_or_else(|| self.llm.api_base.clone()),
            self.llm
                .gist_api_key
                .clone()
                .unwrap_or_else(|| self.llm.api_key.clone()),
            self.llm
                .gist_model
                .clone()
                .unwrap_or_else(|| self.llm.model.clone()),
        )
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }

    /// Lock file guarding schema migrations: configured path or `<db>.migrate.lock`.
    pub fn migration_lock_path(&self) -> PathBuf {
        match &self.storage.migration_lock_file {
            Some(path) => expand_tilde(path),
            None => {
                let db = self.resolved_db_path();
                let mut name = db
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "palace.db".to_string());
                name.push_str(".migrate.lock");
                db.with_file_name(name)
            }
        }
    }
}

fn env_str(name: &str, slot: &mut String) {
    if let Ok(val) = std::env::var(name) {
        if !val.trim().is_empty() {
            *slot = val.trim().to_string();
        }
    }
}

fn env_opt_str(name: &str, slot: &mut Option<String>) {
    if let Ok(val) = std::env::var(name) {
        if !val.trim().is_empty() {
            *slot = Some(val.trim().to_string());
        }
    }
}

fn env_bool(name: &str, slot: &mut bool) {
    if let Ok(val) = std::env::var(name) {
        *slot = matches!(
            val.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "enabled"
        );
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, slot: &mut T) {
    if let Ok(val) = std::env::var(name) {
        if let Ok(parsed) = val.trim().parse::<T>() {
            *slot = parsed;
        }
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}
