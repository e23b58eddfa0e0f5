//! publink-discovery — Candidate publication discovery: the PubMed and
//! web-search clients, the five discovery strategies, candidate fusion,
//! enrichment, and the date filters.

pub mod engine;
pub mod enrich;
pub mod filters;
pub mod fuzzy;
pub mod publication;
pub mod pubmed;
pub mod scheduler;
pub mod scholar;
pub mod strategy;

pub use engine::{DiscoveryEngine, DiscoveryOutcome, StrategyError};
pub use enrich::{CachedEnricher, Enricher};
pub use publication::{Candidate, Publication, StrategyId};
pub use pubmed::{PubmedClient, PubmedRecord};
pub use scheduler::RequestScheduler;
pub use strategy::{DiscoveryStrategy, QueryBundle, QueryGenerator};
