//! Web-search client for scholar-style discovery.
//!
//! Serper-compatible JSON API: POST /scholar with {"q": …} returns
//! organic hits with titles. Only titles are consumed here; PMID
//! resolution happens in the strategy via citation match.

use std::sync::Arc;

use publink_common::{PublinkError, Result};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::scheduler::RequestScheduler;

#[derive(Debug, Clone, Deserialize)]
pub struct ScholarHit {
    pub title: String,
}

pub struct WebSearchClient {
    client: reqwest::Client,
    scheduler: Arc<RequestScheduler>,
    base_url: String,
    api_key: String,
}

impl WebSearchClient {
    pub fn new(scheduler: Arc<RequestScheduler>, base_url: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            scheduler,
            base_url,
            api_key,
        }
    }

    #[instrument(skip(self))]
    pub async fn scholar(&self, query: &str) -> Result<Vec<ScholarHit>> {
        if self.api_key.is_empty() {
            return Err(PublinkError::WebSearch(
                "no web-search API key configured".to_string(),
            ));
        }

        let url = format!("{}/scholar", self.base_url.trim_end_matches('/'));
        let query = query.to_string();
        self.scheduler
            .run("scholar", || {
                let url = url.clone();
                let query = query.clone();
                async move {
                    let resp = self
                        .client
                        .post(&url)
                        .header("X-API-KEY", &self.api_key)
                        .json(&serde_json::json!({ "q": query }))
                        .send()
                        .await?;
                    if !resp.status().is_success() {
                        return Err(PublinkError::WebSearch(format!("HTTP {}", resp.status())));
                    }
                    let body: serde_json::Value = resp.json().await?;
                    let hits: Vec<ScholarHit> = body["organic"]
                        .as_array()
                        .unwrap_or(&vec![])
                        .iter()
                        .filter_map(|h| h["title"].as_str())
                        .map(|t| ScholarHit { title: t.to_string() })
                        .collect();
                    debug!(n = hits.len(), "scholar search returned hits");
                    Ok(hits)
                }
            })
            .await
    }
}
