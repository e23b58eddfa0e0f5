//! Strategy fan-out, error capture, and candidate fusion.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use publink_registry::Registration;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::enrich::{self, Enricher};
use crate::publication::{Candidate, Publication, StrategyId};
use crate::strategy::DiscoveryStrategy;

/// A strategy failure, recorded without aborting the others.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyError {
    #[serde(rename = "fn")]
    pub strategy: String,
    pub message: String,
}

/// A deduplicated candidate before enrichment: one PMID, the union of
/// the strategies that produced it, and the best date/DOI any of them
/// supplied.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedCandidate {
    pub pmid: String,
    pub publication_date: Option<String>,
    pub doi: Option<String>,
    pub sources: BTreeSet<StrategyId>,
}

#[derive(Debug, Default)]
pub struct DiscoveryOutcome {
    pub publications: Vec<Publication>,
    pub errors: Vec<StrategyError>,
}

/// Union candidates across strategies; PMIDs stay unique and `sources`
/// becomes the set-union of contributors. First-seen order is kept so
/// output is stable across runs.
pub fn fuse_candidates(per_strategy: Vec<(StrategyId, Vec<Candidate>)>) -> Vec<FusedCandidate> {
    let mut order: Vec<String> = Vec::new();
    let mut by_pmid: HashMap<String, FusedCandidate> = HashMap::new();

    for (strategy, candidates) in per_strategy {
        for candidate in candidates {
            if candidate.pmid.is_empty() {
                continue;
            }
            let entry = by_pmid
                .entry(candidate.pmid.clone())
                .or_insert_with(|| {
                    order.push(candidate.pmid.clone());
                    FusedCandidate {
                        pmid: candidate.pmid.clone(),
                        publication_date: None,
                        doi: None,
                        sources: BTreeSet::new(),
                    }
                });
            entry.sources.insert(strategy);
            if entry.publication_date.is_none() {
                entry.publication_date = candidate.publication_date;
            }
            if entry.doi.is_none() {
                entry.doi = candidate.doi;
            }
        }
    }

    order
        .into_iter()
        .filter_map(|pmid| by_pmid.remove(&pmid))
        .collect()
}

/// Runs every configured strategy concurrently for one registration,
/// fuses the results, and enriches them from PubMed.
pub struct DiscoveryEngine {
    strategies: Vec<Arc<dyn DiscoveryStrategy>>,
    enricher: Arc<dyn Enricher>,
}

impl DiscoveryEngine {
    pub fn new(strategies: Vec<Arc<dyn DiscoveryStrategy>>, enricher: Arc<dyn Enricher>) -> Self {
        Self { strategies, enricher }
    }

    pub fn strategy_ids(&self) -> Vec<StrategyId> {
        self.strategies.iter().map(|s| s.id()).collect()
    }

    #[instrument(skip(self, registration), fields(trial_id = %registration.trial_id))]
    pub async fn discover(&self, registration: &Registration) -> DiscoveryOutcome {
        let runs = self.strategies.iter().map(|strategy| {
            let strategy = strategy.clone();
            async move {
                let id = strategy.id();
                (id, strategy.run(registration).await)
            }
        });

        let mut per_strategy = Vec::new();
        let mut errors = Vec::new();
        for (id, outcome) in join_all(runs).await {
            match outcome {
                Ok(candidates) => {
                    info!(strategy = %id, n = candidates.len(), "Strategy finished");
                    per_strategy.push((id, candidates));
                }
                Err(e) => {
                    warn!(strategy = %id, error = %e, "Strategy failed");
                    errors.push(StrategyError {
                        strategy: id.as_str().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let fused = fuse_candidates(per_strategy);
        let publications = match enrich::enrich(self.enricher.as_ref(), fused).await {
            Ok(publications) => publications,
            Err(e) => {
                warn!(error = %e, "Enrichment failed");
                errors.push(StrategyError {
                    strategy: "enrich".to_string(),
                    message: e.to_string(),
                });
                Vec::new()
            }
        };

        DiscoveryOutcome { publications, errors }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fusion_unions_sources() {
        let fused = fuse_candidates(vec![
            (StrategyId::LinkedAtRegistration, vec![Candidate::new("222")]),
            (StrategyId::PubmedNaive, vec![Candidate::new("222")]),
            (StrategyId::GoogleScholar, vec![Candidate::new("333")]),
        ]);
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].pmid, "222");
        assert_eq!(fused[0].sources.len(), 2);
        assert_eq!(fused[1].pmid, "333");
        assert_eq!(fused[1].sources.len(), 1);
    }

    #[test]
    fn test_fusion_keeps_first_date() {
        let fused = fuse_candidates(vec![
            (
                StrategyId::PubmedNaive,
                vec![Candidate {
                    pmid: "222".to_string(),
                    publication_date: Some("2012-05".to_string()),
                    doi: None,
                }],
            ),
            (
                StrategyId::PubmedGptV1,
                vec![Candidate {
                    pmid: "222".to_string(),
                    publication_date: Some("2013".to_string()),
                    doi: None,
                }],
            ),
        ]);
        assert_eq!(fused[0].publication_date.as_deref(), Some("2012-05"));
    }

    #[test]
    fn test_fusion_is_idempotent() {
        let input = vec![
            (StrategyId::PubmedNaive, vec![Candidate::new("1"), Candidate::new("2")]),
            (StrategyId::GoogleScholar, vec![Candidate::new("1")]),
        ];
        let once = fuse_candidates(input.clone());
        let again = fuse_candidates(
            once.iter()
                .flat_map(|f| {
                    f.sources.iter().map(|s| {
                        (
                            *s,
                            vec![Candidate {
                                pmid: f.pmid.clone(),
                                publication_date: f.publication_date.clone(),
                                doi: f.doi.clone(),
                            }],
                        )
                    })
                })
                .collect(),
        );
        assert_eq!(once, again);
    }

    #[test]
    fn test_fusion_drops_empty_pmids() {
        let fused = fuse_candidates(vec![(
            StrategyId::PubmedNaive,
            vec![Candidate::new(""), Candidate::new("42")],
        )]);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].pmid, "42");
    }
}
