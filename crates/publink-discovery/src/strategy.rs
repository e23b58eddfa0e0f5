//! Discovery strategies: independent producers of candidate PMIDs.
//!
//! Each strategy either succeeds (possibly with zero candidates) or
//! fails in isolation; the engine captures failures per strategy and
//! never lets one abort the others.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use publink_common::cache::FileCache;
use publink_registry::Registration;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fuzzy;
use crate::publication::{Candidate, StrategyId};
use crate::pubmed::PubmedClient;
use crate::scholar::WebSearchClient;

/// Result cap applied to every PubMed search a strategy runs.
pub const TOP_RESULTS: usize = 5;

/// How many title-search rows the fuzzy matcher considers.
const FUZZY_POOL: usize = 100;

#[async_trait]
pub trait DiscoveryStrategy: Send + Sync {
    fn id(&self) -> StrategyId;
    async fn run(&self, registration: &Registration) -> anyhow::Result<Vec<Candidate>>;
}

// ── linked_at_registration ────────────────────────────────────────────────────

/// PMIDs the registry itself links: the EUCTR results page first, else
/// CTGov reference entries.
pub struct LinkedAtRegistration;

#[async_trait]
impl DiscoveryStrategy for LinkedAtRegistration {
    fn id(&self) -> StrategyId {
        StrategyId::LinkedAtRegistration
    }

    async fn run(&self, registration: &Registration) -> anyhow::Result<Vec<Candidate>> {
        let pmids: Vec<String> = if !registration.linked_pubmed_ids.is_empty() {
            registration.linked_pubmed_ids.clone()
        } else {
            registration
                .references
                .iter()
                .filter_map(|r| r.pmid.clone())
                .collect()
        };
        Ok(pmids.into_iter().map(Candidate::new).collect())
    }
}

// ── pubmed_naive ──────────────────────────────────────────────────────────────

/// One structured PubMed query built from the registration fields.
pub struct PubmedNaive {
    pubmed: Arc<PubmedClient>,
    cache: Arc<FileCache>,
}

impl PubmedNaive {
    pub fn new(pubmed: Arc<PubmedClient>, cache: Arc<FileCache>) -> Self {
        Self { pubmed, cache }
    }
}

/// ISO prefix → the YYYY/MM/DD spelling PubMed date ranges expect.
fn pubmed_date(iso: &str) -> String {
    iso.replace('-', "/")
}

pub fn build_naive_query(registration: &Registration) -> String {
    let mut clauses = vec![format!("{}[si]", registration.trial_id)];
    if let Some(title) = registration.title() {
        clauses.push(format!("\"{}\"[Title/Abstract]", title.replace('"', "")));
    }
    if let Some(investigator) = &registration.investigator_full_name {
        clauses.push(format!("{investigator}[Author]"));
    }

    let mut query = format!("({})", clauses.join(" OR "));
    if let Some(start) = &registration.start_date {
        query.push_str(&format!(
            " AND (\"{}\"[Date - Publication] : \"3000\"[Date - Publication])",
            pubmed_date(start)
        ));
    }
    query
}

#[async_trait]
impl DiscoveryStrategy for PubmedNaive {
    fn id(&self) -> StrategyId {
        StrategyId::PubmedNaive
    }

    async fn run(&self, registration: &Registration) -> anyhow::Result<Vec<Candidate>> {
        let query = build_naive_query(registration);
        let candidates = self
            .cache
            .get_or_fetch("pubmed_naive", &registration.trial_id, || async {
                self.pubmed.search(&query, TOP_RESULTS).await
            })
            .await?;
        Ok(candidates)
    }
}

// ── google_scholar ────────────────────────────────────────────────────────────

/// Web-search the trial id, then resolve each hit title to a PMID:
/// exact citation match first, fuzzy match against a title-search pool
/// on failure.
pub struct GoogleScholar {
    search: Arc<WebSearchClient>,
    pubmed: Arc<PubmedClient>,
    cache: Arc<FileCache>,
}

impl GoogleScholar {
    pub fn new(
        search: Arc<WebSearchClient>,
        pubmed: Arc<PubmedClient>,
        cache: Arc<FileCache>,
    ) -> Self {
        Self { search, pubmed, cache }
    }

    async fn resolve_title(&self, title: &str) -> anyhow::Result<Option<String>> {
        let exact = self.pubmed.citation_match(title).await?;
        if let Some(pmid) = exact.into_iter().next() {
            return Ok(Some(pmid));
        }

        let pool = self.pubmed.title_search(title, FUZZY_POOL).await?;
        Ok(fuzzy::best_match(
            title,
            pool.iter().map(|s| (s.title.as_str(), s.pmid.clone())),
        ))
    }
}

#[async_trait]
impl DiscoveryStrategy for GoogleScholar {
    fn id(&self) -> StrategyId {
        StrategyId::GoogleScholar
    }

    async fn run(&self, registration: &Registration) -> anyhow::Result<Vec<Candidate>> {
        let candidates = self
            .cache
            .get_or_fetch("google_scholar", &registration.trial_id, || async {
                let hits = self.search.scholar(&registration.trial_id).await?;
                let mut pmids = Vec::new();
                for hit in &hits {
                    match self.resolve_title(&hit.title).await {
                        Ok(Some(pmid)) => pmids.push(pmid),
                        Ok(None) => debug!(title = %hit.title, "No PubMed match for hit"),
                        Err(e) => debug!(title = %hit.title, error = %e, "Hit resolution failed"),
                    }
                }
                pmids.sort();
                pmids.dedup();
                Ok(pmids.into_iter().map(Candidate::new).collect::<Vec<_>>())
            })
            .await?;
        Ok(candidates)
    }
}

// ── pubmed_gpt_v1 / pubmed_gpt_v2 ─────────────────────────────────────────────

/// The v2 prompt yields a bundle of search material rather than one query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryBundle {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub investigators: Vec<String>,
    #[serde(default)]
    pub search_strings: Vec<String>,
    #[serde(default)]
    pub extra_queries: Vec<String>,
}

impl QueryBundle {
    /// Clamp to the schema limits (keywords ≤ 4, investigators ≤ 3,
    /// search strings ≤ 6, extra queries ≤ 3).
    pub fn clamp(&mut self) {
        self.keywords.truncate(4);
        self.investigators.truncate(3);
        self.search_strings.truncate(6);
        self.extra_queries.truncate(3);
    }

    /// Every PubMed query this bundle expands to: the search strings and
    /// extra queries verbatim, plus one query synthesized from keywords
    /// and investigators when present.
    pub fn queries(&self) -> Vec<String> {
        let mut queries: Vec<String> = self
            .search_strings
            .iter()
            .chain(self.extra_queries.iter())
            .filter(|q| !q.trim().is_empty())
            .cloned()
            .collect();

        if !self.keywords.is_empty() {
            let mut q = self
                .keywords
                .iter()
                .map(|k| format!("{k}[Title/Abstract]"))
                .collect::<Vec<_>>()
                .join(" AND ");
            if !self.investigators.is_empty() {
                let authors = self
                    .investigators
                    .iter()
                    .map(|a| format!("{a}[Author]"))
                    .collect::<Vec<_>>()
                    .join(" OR ");
                q = format!("({q}) AND ({authors})");
            }
            queries.push(q);
        }

        queries.dedup();
        queries
    }
}

/// Produces LLM-derived queries; implemented by the LLM crate for live
/// runs. Batch runs skip it entirely and read the prepared pool.
#[async_trait]
pub trait QueryGenerator: Send + Sync {
    async fn query_v1(&self, registration: &Registration) -> anyhow::Result<String>;
    async fn query_v2(&self, registration: &Registration) -> anyhow::Result<QueryBundle>;
}

/// Where a GPT strategy gets its queries from.
pub enum QuerySource {
    /// Ask the generator now (live driver).
    Live(Arc<dyn QueryGenerator>),
    /// Read `{trial_id}.json` from a pool prepared by a batch run.
    Pool(PathBuf),
}

impl QuerySource {
    fn pool_read<T: serde::de::DeserializeOwned>(dir: &PathBuf, trial_id: &str) -> anyhow::Result<T> {
        let path = dir.join(format!("{trial_id}.json"));
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("no prepared query for {trial_id}: {e}"))?;
        Ok(serde_json::from_str(&raw)?)
    }
}

pub struct PubmedGptV1 {
    source: QuerySource,
    pubmed: Arc<PubmedClient>,
    cache: Arc<FileCache>,
}

impl PubmedGptV1 {
    pub fn new(source: QuerySource, pubmed: Arc<PubmedClient>, cache: Arc<FileCache>) -> Self {
        Self { source, pubmed, cache }
    }

    async fn query_for(&self, registration: &Registration) -> anyhow::Result<String> {
        match &self.source {
            QuerySource::Live(generator) => {
                let trial_id = registration.trial_id.clone();
                let query = self
                    .cache
                    .get_or_fetch("gpt_queries", &trial_id, || async {
                        generator
                            .query_v1(registration)
                            .await
                            .map_err(publink_common::PublinkError::Other)
                    })
                    .await?;
                Ok(query)
            }
            QuerySource::Pool(dir) => {
                // Pool files are {"query": "..."} or a bare string.
                let value: serde_json::Value = QuerySource::pool_read(dir, &registration.trial_id)?;
                value["query"]
                    .as_str()
                    .or_else(|| value.as_str())
                    .map(String::from)
                    .ok_or_else(|| anyhow::anyhow!("prepared v1 query file has no query field"))
            }
        }
    }
}

#[async_trait]
impl DiscoveryStrategy for PubmedGptV1 {
    fn id(&self) -> StrategyId {
        StrategyId::PubmedGptV1
    }

    async fn run(&self, registration: &Registration) -> anyhow::Result<Vec<Candidate>> {
        let query = self.query_for(registration).await?;
        Ok(self.pubmed.search(&query, TOP_RESULTS).await?)
    }
}

pub struct PubmedGptV2 {
    source: QuerySource,
    pubmed: Arc<PubmedClient>,
    cache: Arc<FileCache>,
}

impl PubmedGptV2 {
    pub fn new(source: QuerySource, pubmed: Arc<PubmedClient>, cache: Arc<FileCache>) -> Self {
        Self { source, pubmed, cache }
    }

    async fn bundle_for(&self, registration: &Registration) -> anyhow::Result<QueryBundle> {
        let mut bundle = match &self.source {
            QuerySource::Live(generator) => {
                self.cache
                    .get_or_fetch("gpt_queries_v2", &registration.trial_id, || async {
                        generator
                            .query_v2(registration)
                            .await
                            .map_err(publink_common::PublinkError::Other)
                    })
                    .await?
            }
            QuerySource::Pool(dir) => QuerySource::pool_read(dir, &registration.trial_id)?,
        };
        bundle.clamp();
        Ok(bundle)
    }
}

#[async_trait]
impl DiscoveryStrategy for PubmedGptV2 {
    fn id(&self) -> StrategyId {
        StrategyId::PubmedGptV2
    }

    async fn run(&self, registration: &Registration) -> anyhow::Result<Vec<Candidate>> {
        let bundle = self.bundle_for(registration).await?;
        let mut all = Vec::new();
        for query in bundle.queries() {
            all.extend(self.pubmed.search(&query, TOP_RESULTS).await?);
        }
        all.sort_by(|a, b| a.pmid.cmp(&b.pmid));
        all.dedup_by(|a, b| a.pmid == b.pmid);
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use publink_common::Registry;

    fn registration() -> Registration {
        let mut reg = Registration::new("NCT00000001", Registry::Ctgov);
        reg.brief_title = Some("Aspirin for Headache".to_string());
        reg.investigator_full_name = Some("Jane Doe".to_string());
        reg.start_date = Some("2005-06".to_string());
        reg
    }

    #[tokio::test]
    async fn test_linked_prefers_euctr_results_page_ids() {
        let mut reg = registration();
        reg.linked_pubmed_ids = vec!["555".to_string(), "666".to_string()];
        reg.references = vec![publink_registry::Reference {
            pmid: Some("111".to_string()),
            citation: None,
        }];

        let candidates = LinkedAtRegistration.run(&reg).await.unwrap();
        let pmids: Vec<&str> = candidates.iter().map(|c| c.pmid.as_str()).collect();
        assert_eq!(pmids, vec!["555", "666"]);
    }

    #[tokio::test]
    async fn test_linked_falls_back_to_references() {
        let mut reg = registration();
        reg.references = vec![
            publink_registry::Reference { pmid: Some("111".to_string()), citation: None },
            publink_registry::Reference { pmid: None, citation: Some("no pmid".to_string()) },
        ];
        let candidates = LinkedAtRegistration.run(&reg).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].pmid, "111");
    }

    #[test]
    fn test_naive_query_combines_fields_and_date_floor() {
        let query = build_naive_query(&registration());
        assert!(query.contains("NCT00000001[si]"));
        assert!(query.contains("\"Aspirin for Headache\"[Title/Abstract]"));
        assert!(query.contains("Jane Doe[Author]"));
        assert!(query.contains("\"2005/06\"[Date - Publication] : \"3000\"[Date - Publication]"));
    }

    #[test]
    fn test_naive_query_without_optional_fields() {
        let mut reg = registration();
        reg.investigator_full_name = None;
        reg.start_date = None;
        let query = build_naive_query(&reg);
        assert!(!query.contains("[Author]"));
        assert!(!query.contains("Date - Publication"));
    }

    #[test]
    fn test_bundle_clamp_and_queries() {
        let mut bundle = QueryBundle {
            keywords: vec!["aspirin".into(), "headache".into()],
            investigators: vec!["Doe J".into()],
            search_strings: (0..8).map(|i| format!("q{i}")).collect(),
            extra_queries: vec!["extra".into()],
        };
        bundle.clamp();
        assert_eq!(bundle.search_strings.len(), 6);

        let queries = bundle.queries();
        // 6 search strings + 1 extra + 1 synthesized keyword/author query
        assert_eq!(queries.len(), 8);
        assert!(queries
            .last()
            .unwrap()
            .contains("(aspirin[Title/Abstract] AND headache[Title/Abstract]) AND (Doe J[Author])"));
    }

    #[test]
    fn test_empty_bundle_expands_to_nothing() {
        assert!(QueryBundle::default().queries().is_empty());
    }
}
