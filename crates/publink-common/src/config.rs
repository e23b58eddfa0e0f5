//! Configuration loading for Publink.
//! Reads publink.toml from the current directory or the path in the
//! PUBLINK_CONFIG env var. API keys are taken from the file or, when
//! empty, from PUBLINK_OPENAI_API_KEY / PUBLINK_SEARCH_API_KEY /
//! PUBLINK_NCBI_API_KEY.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PublinkError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub system_prompts: SystemPromptsConfig,
    #[serde(default)]
    pub llm: LlmServiceConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub pubmed: PubmedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_query_model")]
    pub query_v1: String,
    #[serde(default = "default_query_model")]
    pub query_v2: String,
    #[serde(default = "default_results_model")]
    pub results: String,
}

fn default_query_model()   -> String { "gpt-4o-mini".to_string() }
fn default_results_model() -> String { "gpt-4o".to_string() }

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            query_v1: default_query_model(),
            query_v2: default_query_model(),
            results:  default_results_model(),
        }
    }
}

/// Reasoning effort passed through to the LLM service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Minimal,
    #[default]
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Minimal => "minimal",
            ReasoningEffort::Low     => "low",
            ReasoningEffort::Medium  => "medium",
            ReasoningEffort::High    => "high",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReasoningConfig {
    #[serde(default)]
    pub query_v1: ReasoningEffort,
    #[serde(default)]
    pub query_v2: ReasoningEffort,
    #[serde(default)]
    pub results: ReasoningEffort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Strategy identifiers enabled for batch runs.
    #[serde(default = "default_strategies")]
    pub strategies: Vec<String>,
    #[serde(default = "default_max_tokens_query")]
    pub max_tokens_query_v1: u32,
    #[serde(default = "default_max_tokens_query")]
    pub max_tokens_query_v2: u32,
    #[serde(default = "default_max_tokens_results")]
    pub max_tokens_results: u32,
    #[serde(default = "default_max_requests_per_batch")]
    pub max_requests_per_batch: usize,
    #[serde(default = "default_max_bytes_per_batch")]
    pub max_bytes_per_batch: usize,
    /// 0 < s ≤ 1; the effective byte cap is floor(max_bytes × safety_buffer).
    #[serde(default = "default_safety_buffer")]
    pub safety_buffer: f64,
    #[serde(default = "default_max_tokens_per_day")]
    pub max_tokens_per_day: u64,
    #[serde(default = "default_completion_window")]
    pub completion_window: String,
    #[serde(default = "default_system_tokens_per_request")]
    pub system_tokens_per_request: u64,
}

fn default_strategies() -> Vec<String> {
    vec![
        "linked_at_registration".to_string(),
        "pubmed_naive".to_string(),
        "google_scholar".to_string(),
        "pubmed_gpt_v1".to_string(),
        "pubmed_gpt_v2".to_string(),
    ]
}

fn default_max_tokens_query()          -> u32 { 1_000 }
fn default_max_tokens_results()        -> u32 { 2_000 }
fn default_max_requests_per_batch()    -> usize { 50_000 }
fn default_max_bytes_per_batch()       -> usize { 200 * 1024 * 1024 }
fn default_safety_buffer()             -> f64 { 0.95 }
fn default_max_tokens_per_day()        -> u64 { 90_000_000 }
fn default_completion_window()         -> String { "24h".to_string() }
fn default_system_tokens_per_request() -> u64 { 25 }

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            strategies: default_strategies(),
            max_tokens_query_v1: default_max_tokens_query(),
            max_tokens_query_v2: default_max_tokens_query(),
            max_tokens_results: default_max_tokens_results(),
            max_requests_per_batch: default_max_requests_per_batch(),
            max_bytes_per_batch: default_max_bytes_per_batch(),
            safety_buffer: default_safety_buffer(),
            max_tokens_per_day: default_max_tokens_per_day(),
            completion_window: default_completion_window(),
            system_tokens_per_request: default_system_tokens_per_request(),
        }
    }
}

impl BatchConfig {
    pub fn effective_max_bytes(&self) -> usize {
        (self.max_bytes_per_batch as f64 * self.safety_buffer).floor() as usize
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    pub dir: String,
    /// Per-cache-type TTLs in seconds; `default` covers the rest.
    #[serde(default = "default_ttls")]
    pub ttl: HashMap<String, u64>,
}

fn default_cache_dir() -> String { "cache".to_string() }

fn default_ttls() -> HashMap<String, u64> {
    let mut ttl = HashMap::new();
    ttl.insert("default".to_string(), 7 * 24 * 3600);
    ttl.insert("pubmed_naive".to_string(), 7 * 24 * 3600);
    ttl.insert("linked_at_registration".to_string(), 30 * 24 * 3600);
    ttl.insert("gpt_queries".to_string(), 90 * 24 * 3600);
    ttl.insert("gpt_queries_v2".to_string(), 90 * 24 * 3600);
    ttl
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { dir: default_cache_dir(), ttl: default_ttls() }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> u64 {
        self.ttl.get("default").copied().unwrap_or(7 * 24 * 3600)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SystemPromptsConfig {
    /// Paths to prompt files; empty means the built-in prompt.
    #[serde(default)]
    pub query_v1: Option<String>,
    #[serde(default)]
    pub query_v2: Option<String>,
    #[serde(default)]
    pub results: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmServiceConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
}

fn default_llm_base_url() -> String { "https://api.openai.com".to_string() }

impl Default for LlmServiceConfig {
    fn default() -> Self {
        Self { base_url: default_llm_base_url(), api_key: String::new() }
    }
}

impl LlmServiceConfig {
    pub fn resolved_api_key(&self) -> String {
        if self.api_key.is_empty() {
            std::env::var("PUBLINK_OPENAI_API_KEY").unwrap_or_default()
        } else {
            self.api_key.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_search_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
}

fn default_search_base_url() -> String { "https://google.serper.dev".to_string() }

impl Default for SearchConfig {
    fn default() -> Self {
        Self { base_url: default_search_base_url(), api_key: String::new() }
    }
}

impl SearchConfig {
    pub fn resolved_api_key(&self) -> String {
        if self.api_key.is_empty() {
            std::env::var("PUBLINK_SEARCH_API_KEY").unwrap_or_default()
        } else {
            self.api_key.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PubmedConfig {
    /// Optional NCBI API key for higher rate limits.
    #[serde(default)]
    pub api_key: String,
}

impl PubmedConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        let key = if self.api_key.is_empty() {
            std::env::var("PUBLINK_NCBI_API_KEY").unwrap_or_default()
        } else {
            self.api_key.clone()
        };
        if key.is_empty() { None } else { Some(key) }
    }
}


impl Config {
    /// Load configuration from publink.toml. Checks PUBLINK_CONFIG first,
    /// then the current directory; a missing default file yields the
    /// built-in defaults.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var("PUBLINK_CONFIG").ok();
        let path = explicit.clone().unwrap_or_else(|| "publink.toml".to_string());

        if !Path::new(&path).exists() {
            if explicit.is_some() {
                return Err(PublinkError::Config(format!("config file not found: {path}")));
            }
            tracing::warn!("publink.toml not found, using built-in defaults");
            let config = Config::default();
            config.validate()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| PublinkError::Config(format!("{path}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the orchestrator cannot run with. Called before any
    /// external call is made.
    pub fn validate(&self) -> Result<()> {
        if !(self.batch.safety_buffer > 0.0 && self.batch.safety_buffer <= 1.0) {
            return Err(PublinkError::Config(format!(
                "batch.safety_buffer must be in (0, 1], got {}",
                self.batch.safety_buffer
            )));
        }
        if self.batch.max_requests_per_batch == 0 {
            return Err(PublinkError::Config(
                "batch.max_requests_per_batch must be at least 1".to_string(),
            ));
        }
        if self.batch.effective_max_bytes() == 0 {
            return Err(PublinkError::Config(
                "effective byte cap is zero; raise batch.max_bytes_per_batch".to_string(),
            ));
        }
        Ok(())
    }
}
