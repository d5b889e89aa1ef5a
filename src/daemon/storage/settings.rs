use std::sync::Arc;

use anyhow::Result;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::{
    crypto::store::EncryptedStore,
    daemon::collection::domain::{normalize_domain, ExclusionSet},
};

pub const SETTINGS_PREFIX: &str = "settings:";
pub const EXCLUSIONS_KEY: &str = "settings:exclusions";
pub const DEVICE_ID_KEY: &str = "settings:device_id";

/// Persisted exclusion list with an in-memory copy. Writes go through the store first, so the
/// cached copy never shows a domain that wasn't persisted.
pub struct ExclusionStore {
    store: Arc<EncryptedStore>,
    cached: RwLock<Option<ExclusionSet>>,
}

impl ExclusionStore {
    pub fn new(store: Arc<EncryptedStore>) -> Self {
        Self {
            store,
            cached: RwLock::new(None),
        }
    }

    pub async fn load(&self) -> Result<ExclusionSet> {
        if let Some(set) = self.cached.read().await.as_ref() {
            return Ok(set.clone());
        }
        let mut cached = self.cached.write().await;
        let set = self.read_stored().await?;
        *cached = Some(set.clone());
        Ok(set)
    }

    async fn read_stored(&self) -> Result<ExclusionSet> {
        let stored = self
            .store
            .get::<Vec<String>>(EXCLUSIONS_KEY)
            .await?
            .unwrap_or_default();
        Ok(ExclusionSet::new(
            stored.iter().filter_map(|v| normalize_domain(v).ok()),
        ))
    }

    /// Adds a domain and returns the updated set.
    pub async fn add(&self, raw: &str) -> Result<ExclusionSet> {
        let domain = normalize_domain(raw)?;
        let mut cached = self.cached.write().await;
        let mut set = match cached.take() {
            Some(set) => set,
            None => self.read_stored().await?,
        };
        if set.insert(domain.clone()) {
            self.store.put(EXCLUSIONS_KEY, &set.to_vec()).await?;
            info!("Excluded {domain}");
        }
        *cached = Some(set.clone());
        Ok(set)
    }

    pub async fn remove(&self, raw: &str) -> Result<ExclusionSet> {
        let domain = normalize_domain(raw)?;
        let mut cached = self.cached.write().await;
        let mut set = match cached.take() {
            Some(set) => set,
            None => self.read_stored().await?,
        };
        if set.remove(&domain) {
            self.store.put(EXCLUSIONS_KEY, &set.to_vec()).await?;
            info!("Removed exclusion {domain}");
        }
        *cached = Some(set.clone());
        Ok(set)
    }
}

/// Stable id of this installation. Generated on first use.
pub async fn device_id(store: &EncryptedStore) -> Result<String> {
    if let Some(id) = store.get::<String>(DEVICE_ID_KEY).await? {
        return Ok(id);
    }
    let id = Uuid::new_v4().to_string();
    store.put(DEVICE_ID_KEY, &id).await?;
    info!("Assigned device id {id}");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::{device_id, ExclusionStore};
    use crate::{crypto::store::testing::memory_store, utils::clock::testing::ManualClock};

    #[tokio::test]
    async fn test_exclusions_persist_normalized() -> Result<()> {
        let clock = ManualClock::at_test_start();
        let (_, store) = memory_store(&clock).await;
        let exclusions = ExclusionStore::new(store.clone());

        let set = exclusions.add("WWW.Example.com").await?;
        assert_eq!(set.to_vec(), vec!["example.com".to_string()]);
        exclusions.add("https://news.ycombinator.com/item?id=1").await?;

        let reloaded = ExclusionStore::new(store).load().await?;
        assert_eq!(
            reloaded.to_vec(),
            vec!["example.com".to_string(), "news.ycombinator.com".to_string()]
        );
        assert!(reloaded.is_excluded("sub.example.com"));
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_and_invalid() -> Result<()> {
        let clock = ManualClock::at_test_start();
        let (_, store) = memory_store(&clock).await;
        let exclusions = ExclusionStore::new(store);

        exclusions.add("a.com").await?;
        let set = exclusions.remove("a.com").await?;
        assert!(set.is_empty());
        assert!(exclusions.add("not a domain").await.is_err());
        assert!(exclusions.load().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_device_id_is_stable() -> Result<()> {
        let clock = ManualClock::at_test_start();
        let (_, store) = memory_store(&clock).await;
        let first = device_id(&store).await?;
        assert_eq!(device_id(&store).await?, first);
        Ok(())
    }
}
