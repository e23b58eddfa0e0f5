//! PubMed enrichment of fused candidates.

use std::sync::Arc;

use async_trait::async_trait;
use publink_common::cache::FileCache;
use publink_common::Result;

use crate::engine::FusedCandidate;
use crate::publication::Publication;
use crate::pubmed::{PubmedClient, PubmedRecord};

/// PMID-keyed publication store shared across trials.
const PUBLICATION_STORE: &str = "publications";

/// The one PubMed operation enrichment needs, as a seam so the engine
/// can be driven without network access.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn fetch_refs(&self, pmids: &[String]) -> Result<Vec<PubmedRecord>>;
}

#[async_trait]
impl Enricher for PubmedClient {
    async fn fetch_refs(&self, pmids: &[String]) -> Result<Vec<PubmedRecord>> {
        PubmedClient::fetch_refs(self, pmids).await
    }
}

/// Read-through publication store in front of efetch. Records are keyed
/// by PMID and shared across trials; a PMID two trials both surface is
/// fetched once.
pub struct CachedEnricher {
    inner: Arc<dyn Enricher>,
    cache: Arc<FileCache>,
}

impl CachedEnricher {
    pub fn new(inner: Arc<dyn Enricher>, cache: Arc<FileCache>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl Enricher for CachedEnricher {
    async fn fetch_refs(&self, pmids: &[String]) -> Result<Vec<PubmedRecord>> {
        let mut records = Vec::with_capacity(pmids.len());
        let mut missing = Vec::new();
        for pmid in pmids {
            match self.cache.get::<PubmedRecord>(PUBLICATION_STORE, pmid) {
                Some(record) => records.push(record),
                None => missing.push(pmid.clone()),
            }
        }
        if !missing.is_empty() {
            let fetched = self.inner.fetch_refs(&missing).await?;
            for record in &fetched {
                self.cache.put(PUBLICATION_STORE, &record.pmid, record)?;
            }
            records.extend(fetched);
        }
        Ok(records)
    }
}

/// Fetch full PubMed records for the fused candidates and merge them.
pub async fn enrich(enricher: &dyn Enricher, fused: Vec<FusedCandidate>) -> Result<Vec<Publication>> {
    if fused.is_empty() {
        return Ok(Vec::new());
    }
    let pmids: Vec<String> = fused.iter().map(|f| f.pmid.clone()).collect();
    let records = enricher.fetch_refs(&pmids).await?;
    Ok(merge(fused, &records))
}

/// Join candidates to records by PMID, falling back to DOI for records
/// PubMed returned under a different id. The enriched publication date
/// wins over whatever a strategy's search reported; the strategy date
/// survives only when the record has none.
pub fn merge(fused: Vec<FusedCandidate>, records: &[PubmedRecord]) -> Vec<Publication> {
    let by_pmid: std::collections::HashMap<&str, &PubmedRecord> =
        records.iter().map(|r| (r.pmid.as_str(), r)).collect();
    let by_doi: std::collections::HashMap<&str, &PubmedRecord> = records
        .iter()
        .filter_map(|r| r.doi.as_deref().map(|d| (d, r)))
        .collect();

    fused
        .into_iter()
        .map(|candidate| {
            let record = by_pmid
                .get(candidate.pmid.as_str())
                .or_else(|| candidate.doi.as_deref().and_then(|d| by_doi.get(d)))
                .copied();

            match record {
                Some(r) => Publication {
                    pmid: candidate.pmid,
                    doi: r.doi.clone().or(candidate.doi),
                    title: r.title.clone(),
                    authors: if r.authors.is_empty() {
                        None
                    } else {
                        Some(r.authors.join(", "))
                    },
                    abstract_text: r.abstract_text.clone(),
                    publication_date: r.publication_date.clone().or(candidate.publication_date),
                    sources: candidate.sources,
                    nct_ids: r.nct_ids.clone(),
                },
                None => Publication {
                    pmid: candidate.pmid,
                    doi: candidate.doi,
                    title: None,
                    authors: None,
                    abstract_text: None,
                    publication_date: candidate.publication_date,
                    sources: candidate.sources,
                    nct_ids: Vec::new(),
                },
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publication::StrategyId;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEnricher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Enricher for CountingEnricher {
        async fn fetch_refs(&self, pmids: &[String]) -> Result<Vec<PubmedRecord>> {
            self.calls.fetch_add(pmids.len(), Ordering::SeqCst);
            Ok(pmids
                .iter()
                .map(|pmid| PubmedRecord { pmid: pmid.clone(), ..Default::default() })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_cached_enricher_fetches_each_pmid_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FileCache::new(
            dir.path().to_path_buf(),
            std::collections::HashMap::new(),
            3600,
        ));
        let inner = Arc::new(CountingEnricher { calls: AtomicUsize::new(0) });
        let enricher = CachedEnricher::new(inner.clone(), cache);

        let pmids = vec!["1".to_string(), "2".to_string()];
        assert_eq!(enricher.fetch_refs(&pmids).await.unwrap().len(), 2);
        // Second trial surfacing an overlapping set only pays for the new PMID.
        let pmids = vec!["2".to_string(), "3".to_string()];
        assert_eq!(enricher.fetch_refs(&pmids).await.unwrap().len(), 2);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    fn fused(pmid: &str, date: Option<&str>, doi: Option<&str>) -> FusedCandidate {
        let mut sources = BTreeSet::new();
        sources.insert(StrategyId::PubmedNaive);
        FusedCandidate {
            pmid: pmid.to_string(),
            publication_date: date.map(String::from),
            doi: doi.map(String::from),
            sources,
        }
    }

    fn record(pmid: &str, doi: Option<&str>, date: Option<&str>) -> PubmedRecord {
        PubmedRecord {
            pmid: pmid.to_string(),
            doi: doi.map(String::from),
            title: Some(format!("Record {pmid}")),
            authors: vec!["Jane Doe".to_string(), "John Smith".to_string()],
            abstract_text: Some("An abstract.".to_string()),
            publication_date: date.map(String::from),
            nct_ids: vec![],
        }
    }

    #[test]
    fn test_enrichment_date_wins() {
        let merged = merge(
            vec![fused("1", Some("2010"), None)],
            &[record("1", None, Some("2011-02-03"))],
        );
        assert_eq!(merged[0].publication_date.as_deref(), Some("2011-02-03"));
    }

    #[test]
    fn test_strategy_date_survives_when_record_has_none() {
        let merged = merge(vec![fused("1", Some("2010"), None)], &[record("1", None, None)]);
        assert_eq!(merged[0].publication_date.as_deref(), Some("2010"));
    }

    #[test]
    fn test_doi_fallback_match() {
        let merged = merge(
            vec![fused("999", None, Some("10.1/x"))],
            &[record("1", Some("10.1/x"), Some("2012"))],
        );
        assert_eq!(merged[0].title.as_deref(), Some("Record 1"));
        assert_eq!(merged[0].pmid, "999");
    }

    #[test]
    fn test_unmatched_candidate_keeps_bare_pmid() {
        let merged = merge(vec![fused("404", None, None)], &[]);
        assert_eq!(merged[0].pmid, "404");
        assert!(merged[0].title.is_none());
        assert_eq!(merged[0].sources.len(), 1);
    }

    #[test]
    fn test_authors_become_display_string() {
        let merged = merge(vec![fused("1", None, None)], &[record("1", None, None)]);
        assert_eq!(merged[0].authors.as_deref(), Some("Jane Doe, John Smith"));
    }
}
