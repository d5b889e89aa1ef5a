use std::{path::Path, sync::Arc};

use anyhow::Result;
use tracing::{error, info};

use crate::{
    api::facade::QueryFacade,
    config::Config,
    crypto::{migration::migrate, store::EncryptedStore},
    sync::{
        coordinator::SyncCoordinator,
        remote::{DirectoryDocumentStore, RemoteDocumentStore},
    },
    utils::clock::Clock,
};

use super::{
    collection::{
        browser::{BrowserPort, TabRegistry},
        monitor::ActivityMonitor,
    },
    storage::{
        kv::{FileKeyValueStore, KeyValueStore},
        ledger::TimeLedger,
        settings::{device_id, ExclusionStore},
    },
};

pub const DATA_DIR: &str = "data";

/// Everything that shares the store. Built once per process.
pub struct TrackerServices {
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub store: Arc<EncryptedStore>,
    pub ledger: Arc<TimeLedger>,
    pub exclusions: Arc<ExclusionStore>,
    pub registry: Arc<TabRegistry>,
    pub monitor: Arc<ActivityMonitor>,
    pub sync: Option<Arc<SyncCoordinator>>,
    pub facade: Arc<QueryFacade>,
}

impl TrackerServices {
    /// Opens the file store in `app_dir` and the remote folder when one is configured.
    pub async fn open(app_dir: &Path, config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let kv = Arc::new(FileKeyValueStore::new(app_dir.join(DATA_DIR))?);
        let remote = match &config.sync.remote_dir {
            Some(dir) => {
                info!("Syncing through {dir:?}");
                Some(Arc::new(DirectoryDocumentStore::new(dir.clone())?) as Arc<dyn RemoteDocumentStore>)
            }
            None => None,
        };
        Self::build(kv, remote, config, clock).await
    }

    pub async fn build(
        kv: Arc<dyn KeyValueStore>,
        remote: Option<Arc<dyn RemoteDocumentStore>>,
        config: Config,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let store = Arc::new(
            EncryptedStore::open(kv, clock.clone(), config.key_options())
                .await
                .inspect_err(|e| error!("Failed to open the store {e}"))?,
        );
        let report = migrate(&store).await?;
        if report.ran() {
            info!("Migrated storage {report:?}");
        }

        let ledger = Arc::new(TimeLedger::new(store.clone(), clock.clone()));
        let exclusions = Arc::new(ExclusionStore::new(store.clone()));
        let registry = Arc::new(TabRegistry::new());
        let monitor = Arc::new(ActivityMonitor::new(
            registry.clone() as Arc<dyn BrowserPort>,
            ledger.clone(),
            clock.clone(),
            exclusions.load().await?,
        ));

        let sync = match remote {
            Some(remote) => {
                let device = device_id(&store).await?;
                Some(Arc::new(SyncCoordinator::new(
                    store.clone(),
                    ledger.clone(),
                    remote,
                    clock.clone(),
                    config.sync_settings(&device),
                )))
            }
            None => None,
        };

        let mut facade = QueryFacade::new(
            store.clone(),
            ledger.clone(),
            exclusions.clone(),
            clock.clone(),
        )
        .with_monitor(monitor.clone());
        if let Some(sync) = &sync {
            facade = facade.with_sync(sync.clone());
        }

        Ok(Self {
            config,
            clock,
            store,
            ledger,
            exclusions,
            registry,
            monitor,
            sync,
            facade: Arc::new(facade),
        })
    }
}
