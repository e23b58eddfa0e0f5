//! publink-common — Shared types, errors, cache, and configuration used
//! across all Publink crates.

pub mod cache;
pub mod config;
pub mod error;
pub mod spend;
pub mod trial;

pub use config::Config;
pub use error::{FetchKind, PublinkError, Result};
pub use spend::TokenSpend;
pub use trial::{detect_registry, normalize_trial_id, Registry};
