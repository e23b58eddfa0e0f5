//! Registry dispatch and the cached registration store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use publink_common::cache::FileCache;
use publink_common::{detect_registry, FetchKind, PublinkError, Registry, Result};
use tracing::instrument;

use crate::ctgov::CtgovAdapter;
use crate::drks::DrksAdapter;
use crate::euctr::EuctrAdapter;
use crate::registration::Registration;

const REGISTRATION_CACHE: &str = "registrations";

/// One entry point for all three registries, backed by the registration
/// store: repeated fetches of the same trial hit the cache, and
/// concurrent fetches of the same trial run the adapter once.
pub struct RegistryHub {
    ctgov: CtgovAdapter,
    euctr: EuctrAdapter,
    drks: DrksAdapter,
    cache: Arc<FileCache>,
}

impl RegistryHub {
    pub fn new(cache: Arc<FileCache>, local_registrations: Option<PathBuf>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("publink/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("HTTP client build failed");

        Self {
            ctgov: CtgovAdapter::new(client.clone(), local_registrations),
            euctr: EuctrAdapter::new(client.clone()),
            drks: DrksAdapter::new(client),
            cache,
        }
    }

    /// Fetch through the registration store. Unknown identifiers never
    /// reach an adapter.
    #[instrument(skip(self))]
    pub async fn fetch(&self, trial_id: &str) -> Result<Registration> {
        let registry = detect_registry(trial_id).ok_or_else(|| PublinkError::RegistryFetch {
            trial_id: trial_id.to_string(),
            kind: FetchKind::NotFound,
            message: "identifier matches no known registry".to_string(),
        })?;

        self.cache
            .get_or_fetch(REGISTRATION_CACHE, trial_id, || async move {
                match registry {
                    Registry::Ctgov => self.ctgov.fetch(trial_id).await,
                    Registry::Euctr => self.euctr.fetch(trial_id).await,
                    Registry::Drks  => self.drks.fetch(trial_id).await,
                }
            })
            .await
    }

    /// Cache-only lookup, used by stages that must not trigger network
    /// traffic.
    pub fn cached(&self, trial_id: &str) -> Option<Registration> {
        self.cache.get(REGISTRATION_CACHE, trial_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_unknown_id_never_reaches_an_adapter() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FileCache::new(dir.path().to_path_buf(), HashMap::new(), 60));
        let hub = RegistryHub::new(cache, None);
        let err = hub.fetch("ISRCTN49919664").await.unwrap_err();
        assert!(matches!(
            err,
            PublinkError::RegistryFetch { kind: FetchKind::NotFound, .. }
        ));
    }

    #[tokio::test]
    async fn test_cached_registration_is_served_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FileCache::new(dir.path().to_path_buf(), HashMap::new(), 3600));

        let mut reg = Registration::new("NCT00000001", Registry::Ctgov);
        reg.brief_title = Some("Cached".to_string());
        cache.put(REGISTRATION_CACHE, "NCT00000001", &reg).unwrap();

        let hub = RegistryHub::new(cache, None);
        let got = hub.fetch("NCT00000001").await.unwrap();
        assert_eq!(got.brief_title.as_deref(), Some("Cached"));
        assert!(hub.cached("NCT00000001").is_some());
    }
}
