use thiserror::Error;

/// What went wrong while fetching a registration from a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchKind {
    /// The registry has no record for this identifier.
    NotFound,
    /// Network-level failure (DNS, timeout, non-2xx).
    Transport,
    /// The record was retrieved but could not be parsed.
    Parse,
}

impl FetchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchKind::NotFound  => "not_found",
            FetchKind::Transport => "transport",
            FetchKind::Parse     => "parse",
        }
    }
}

#[derive(Debug, Error)]
pub enum PublinkError {
    #[error("registry fetch failed for {trial_id} [{}]: {message}", kind.as_str())]
    RegistryFetch {
        trial_id: String,
        kind: FetchKind,
        message: String,
    },

    #[error("PubMed error: {0}")]
    Pubmed(String),

    #[error("web search error: {0}")]
    WebSearch(String),

    #[error("LLM request error: {0}")]
    LlmSync(String),

    #[error("batch job {batch_id} ended in terminal status '{status}'")]
    LlmBatchFailed { batch_id: String, status: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("cache I/O error: {0}")]
    Cache(#[from] std::io::Error),

    #[error(
        "daily token budget exhausted: next chunk needs {needed} tokens but only {remaining} remain today"
    )]
    DailyBudgetExhausted { needed: u64, remaining: u64 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PublinkError {
    /// True for the one failure an operator is expected to retry the
    /// next day rather than investigate.
    pub fn is_budget_exhausted(&self) -> bool {
        matches!(self, PublinkError::DailyBudgetExhausted { .. })
    }
}

pub type Result<T> = std::result::Result<T, PublinkError>;
