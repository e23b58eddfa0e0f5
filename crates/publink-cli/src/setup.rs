//! Service wiring shared by the batch and live drivers.

use std::path::PathBuf;
use std::sync::Arc;

use publink_common::cache::FileCache;
use publink_common::{Config, PublinkError, Result, TokenSpend};
use publink_discovery::scholar::WebSearchClient;
use publink_discovery::strategy::{
    DiscoveryStrategy, GoogleScholar, LinkedAtRegistration, PubmedGptV1, PubmedGptV2, PubmedNaive,
    QuerySource,
};
use publink_discovery::{
    DiscoveryEngine, PubmedClient, QueryGenerator, RequestScheduler, StrategyId,
};
use publink_llm::{Classifier, LlmClient, QueryGen};
use publink_registry::RegistryHub;
use tracing::warn;

pub struct SharedServices {
    pub stores: Arc<FileCache>,
    pub registry: Arc<RegistryHub>,
    pub pubmed: Arc<PubmedClient>,
    pub web_search: Arc<WebSearchClient>,
    pub llm: Arc<LlmClient>,
    pub spend: Arc<TokenSpend>,
}

pub fn build_shared(config: &Config, local_registrations: Option<PathBuf>) -> SharedServices {
    let stores = Arc::new(FileCache::new(
        PathBuf::from(&config.cache.dir),
        config.cache.ttl.clone(),
        config.cache.default_ttl(),
    ));
    let registry = Arc::new(RegistryHub::new(stores.clone(), local_registrations));

    // One scheduler instance fronts all PubMed traffic in this process;
    // web search runs under its own quota.
    let pubmed = Arc::new(PubmedClient::new(
        Arc::new(RequestScheduler::pubmed()),
        config.pubmed.resolved_api_key(),
    ));
    let web_search = Arc::new(WebSearchClient::new(
        Arc::new(RequestScheduler::web_search()),
        config.search.base_url.clone(),
        config.search.resolved_api_key(),
    ));

    let api_key = config.llm.resolved_api_key();
    if api_key.is_empty() {
        warn!("No LLM API key configured (set llm.api_key or PUBLINK_OPENAI_API_KEY)");
    }
    let llm = Arc::new(LlmClient::new(config.llm.base_url.clone(), api_key));

    SharedServices {
        stores,
        registry,
        pubmed,
        web_search,
        llm,
        spend: Arc::new(TokenSpend::new()),
    }
}

pub fn load_prompt_file(path: &Option<String>) -> Result<Option<String>> {
    match path {
        Some(p) => std::fs::read_to_string(p)
            .map(Some)
            .map_err(|e| PublinkError::Config(format!("system prompt {p}: {e}"))),
        None => Ok(None),
    }
}

pub fn build_classifier(config: &Config, shared: &SharedServices) -> Result<Arc<Classifier>> {
    Ok(Arc::new(Classifier::new(
        shared.llm.clone(),
        config.models.results.clone(),
        config.reasoning.results,
        config.batch.max_tokens_results,
        load_prompt_file(&config.system_prompts.results)?,
        shared.spend.clone(),
    )))
}

/// Where the pubmed_gpt strategies find their queries: prepared pools
/// (batch mode) or a live generator.
pub enum GptQueries {
    Pools { v1: PathBuf, v2: PathBuf },
    Live(Arc<dyn QueryGenerator>),
}

pub fn build_live_query_generator(
    config: &Config,
    shared: &SharedServices,
) -> Result<Arc<dyn QueryGenerator>> {
    Ok(Arc::new(QueryGen::new(
        shared.llm.clone(),
        config.models.query_v1.clone(),
        config.models.query_v2.clone(),
        config.reasoning.query_v1,
        config.reasoning.query_v2,
        config.batch.max_tokens_query_v1,
        config.batch.max_tokens_query_v2,
        load_prompt_file(&config.system_prompts.query_v1)?,
        load_prompt_file(&config.system_prompts.query_v2)?,
        shared.spend.clone(),
    )))
}

pub fn build_engine(
    config: &Config,
    shared: &SharedServices,
    gpt_queries: GptQueries,
) -> Result<Arc<DiscoveryEngine>> {
    let mut strategies: Vec<Arc<dyn DiscoveryStrategy>> = Vec::new();

    for name in &config.batch.strategies {
        let id: StrategyId = name
            .parse()
            .map_err(|e: String| PublinkError::Config(e))?;
        let strategy: Arc<dyn DiscoveryStrategy> = match id {
            StrategyId::LinkedAtRegistration => Arc::new(LinkedAtRegistration),
            StrategyId::PubmedNaive => {
                Arc::new(PubmedNaive::new(shared.pubmed.clone(), shared.stores.clone()))
            }
            StrategyId::GoogleScholar => Arc::new(GoogleScholar::new(
                shared.web_search.clone(),
                shared.pubmed.clone(),
                shared.stores.clone(),
            )),
            StrategyId::PubmedGptV1 => {
                let source = match &gpt_queries {
                    GptQueries::Pools { v1, .. } => QuerySource::Pool(v1.clone()),
                    GptQueries::Live(generator) => QuerySource::Live(generator.clone()),
                };
                Arc::new(PubmedGptV1::new(source, shared.pubmed.clone(), shared.stores.clone()))
            }
            StrategyId::PubmedGptV2 => {
                let source = match &gpt_queries {
                    GptQueries::Pools { v2, .. } => QuerySource::Pool(v2.clone()),
                    GptQueries::Live(generator) => QuerySource::Live(generator.clone()),
                };
                Arc::new(PubmedGptV2::new(source, shared.pubmed.clone(), shared.stores.clone()))
            }
        };
        strategies.push(strategy);
    }

    let enricher = Arc::new(publink_discovery::CachedEnricher::new(
        shared.pubmed.clone(),
        shared.stores.clone(),
    ));
    Ok(Arc::new(DiscoveryEngine::new(strategies, enricher)))
}
