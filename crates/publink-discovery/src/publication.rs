//! Candidate and publication records shared across the discovery engine.

use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Stable identifier of a discovery strategy; preserved through dedup as
/// a set per publication.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StrategyId {
    LinkedAtRegistration,
    PubmedNaive,
    GoogleScholar,
    PubmedGptV1,
    PubmedGptV2,
}

impl StrategyId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyId::LinkedAtRegistration => "linked_at_registration",
            StrategyId::PubmedNaive          => "pubmed_naive",
            StrategyId::GoogleScholar        => "google_scholar",
            StrategyId::PubmedGptV1          => "pubmed_gpt_v1",
            StrategyId::PubmedGptV2          => "pubmed_gpt_v2",
        }
    }

    pub fn all() -> [StrategyId; 5] {
        [
            StrategyId::LinkedAtRegistration,
            StrategyId::PubmedNaive,
            StrategyId::GoogleScholar,
            StrategyId::PubmedGptV1,
            StrategyId::PubmedGptV2,
        ]
    }
}

impl FromStr for StrategyId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linked_at_registration" => Ok(StrategyId::LinkedAtRegistration),
            "pubmed_naive"           => Ok(StrategyId::PubmedNaive),
            "google_scholar"         => Ok(StrategyId::GoogleScholar),
            "pubmed_gpt_v1"          => Ok(StrategyId::PubmedGptV1),
            "pubmed_gpt_v2"          => Ok(StrategyId::PubmedGptV2),
            other => Err(format!("unknown strategy id '{other}'")),
        }
    }
}

impl std::fmt::Display for StrategyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a single strategy yields: a PMID, plus whatever it happened to
/// learn on the way there.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Candidate {
    pub pmid: String,
    /// Partial ISO date when the strategy's search surfaced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
}

impl Candidate {
    pub fn new(pmid: impl Into<String>) -> Self {
        Self { pmid: pmid.into(), ..Default::default() }
    }
}

/// A deduplicated, enriched candidate publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Publication {
    pub pmid: String,
    pub doi: Option<String>,
    pub title: Option<String>,
    /// Comma-joined author display string.
    pub authors: Option<String>,
    pub abstract_text: Option<String>,
    /// Partial ISO: `YYYY`, `YYYY-MM`, or `YYYY-MM-DD`.
    pub publication_date: Option<String>,
    /// Every strategy that yielded this PMID.
    pub sources: BTreeSet<StrategyId>,
    /// Trial identifiers mentioned in the PubMed record.
    pub nct_ids: Vec<String>,
}

impl Publication {
    pub fn from_pmid(pmid: impl Into<String>) -> Self {
        Self {
            pmid: pmid.into(),
            doi: None,
            title: None,
            authors: None,
            abstract_text: None,
            publication_date: None,
            sources: BTreeSet::new(),
            nct_ids: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_id_roundtrip() {
        for id in StrategyId::all() {
            assert_eq!(id.as_str().parse::<StrategyId>().unwrap(), id);
        }
        assert!("pubmed".parse::<StrategyId>().is_err());
    }

    #[test]
    fn test_strategy_id_serde_uses_snake_case() {
        let json = serde_json::to_string(&StrategyId::LinkedAtRegistration).unwrap();
        assert_eq!(json, "\"linked_at_registration\"");
    }
}
