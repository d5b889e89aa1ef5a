use std::{
    collections::BTreeMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use tracing::{debug, error, info, warn};

use crate::{
    crypto::{migration::CURRENT_SCHEMA_VERSION, store::EncryptedStore},
    daemon::storage::ledger::TimeLedger,
    utils::clock::Clock,
};

use super::{
    queue::{DrainReport, SyncQueue, DEFAULT_MAX_QUEUE_LEN, DEFAULT_MAX_RETRIES},
    remote::{DocumentPage, RemoteDocument, RemoteDocumentStore, RemoteError},
    snapshot::{EncryptedSnapshot, MergedUsage, UsageData},
};

pub const REMOTE_DOC_KEY: &str = "sync:remote_doc";
pub const MERGED_KEY: &str = "sync:merged";
pub const CACHE_PREFIX: &str = "sync:";

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub user_id: String,
    pub device_id: String,
    pub page_size: usize,
    pub max_retries: u32,
    pub max_queue_len: usize,
    pub call_timeout: Duration,
    pub pull_attempts: u32,
    pub backoff_base: Duration,
}

impl SyncSettings {
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            page_size: 50,
            max_retries: DEFAULT_MAX_RETRIES,
            max_queue_len: DEFAULT_MAX_QUEUE_LEN,
            call_timeout: Duration::from_secs(30),
            pull_attempts: 3,
            backoff_base: Duration::from_millis(500),
        }
    }

    fn context(&self) -> String {
        format!("snapshot:{}", self.user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Sent,
    /// Offline, kept for later.
    Queued,
    /// Sending failed, kept for a retry.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub drained: DrainReport,
    pub push: Option<PushOutcome>,
    pub merged: Option<MergedUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Completed(SyncReport),
    /// Another pass was in flight.
    Skipped,
}

/// Releases the in-flight flag when a pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Moves snapshots between this device and the remote store. At most one pass runs at a time;
/// triggers arriving meanwhile are ignored.
pub struct SyncCoordinator {
    store: Arc<EncryptedStore>,
    ledger: Arc<TimeLedger>,
    remote: Arc<dyn RemoteDocumentStore>,
    clock: Arc<dyn Clock>,
    queue: SyncQueue,
    settings: SyncSettings,
    online: AtomicBool,
    in_flight: AtomicBool,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<EncryptedStore>,
        ledger: Arc<TimeLedger>,
        remote: Arc<dyn RemoteDocumentStore>,
        clock: Arc<dyn Clock>,
        settings: SyncSettings,
    ) -> Self {
        let queue = SyncQueue::new(store.clone(), settings.max_queue_len, settings.max_retries);
        Self {
            store,
            ledger,
            remote,
            clock,
            queue,
            settings,
            online: AtomicBool::new(true),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Records connectivity. Returns true when this call brought the coordinator back online.
    pub fn set_online(&self, online: bool) -> bool {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if was_online != online {
            info!("Sync is now {}", if online { "online" } else { "offline" });
        }
        online && !was_online
    }

    fn begin(&self) -> Option<PassGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| PassGuard(&self.in_flight))
    }

    async fn call<T>(
        &self,
        operation: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        tokio::time::timeout(self.settings.call_timeout, operation)
            .await
            .map_err(|_| RemoteError::Timeout(self.settings.call_timeout))?
    }

    async fn local_snapshot(&self) -> Result<UsageData> {
        Ok(UsageData::from_buckets(
            self.ledger.export().await?.into_values(),
        ))
    }

    /// Seals `payload` and writes it into this device's document, creating it when needed.
    async fn send(&self, payload: &UsageData) -> Result<(), RemoteError> {
        let sealed = self
            .store
            .seal_document(&self.settings.context(), payload)
            .await
            .map_err(|e| RemoteError::Encoding(e.to_string()))?;
        let snapshot = EncryptedSnapshot {
            sealed,
            schema_version: CURRENT_SCHEMA_VERSION,
            device_id: self.settings.device_id.clone(),
            updated_at: self.clock.time(),
        };

        let known_id = self
            .store
            .get::<String>(REMOTE_DOC_KEY)
            .await
            .map_err(|e| RemoteError::Encoding(e.to_string()))?;
        if let Some(id) = known_id {
            match self.call(self.remote.update(&id, &snapshot)).await {
                Ok(()) => {
                    debug!("Updated remote document {id}");
                    return Ok(());
                }
                Err(RemoteError::NotFound(_)) => {
                    warn!("Remote document {id} is gone, looking for another one");
                }
                Err(e) => return Err(e),
            }
        }

        // The id may have been lost locally while the document still exists.
        if let Some(id) = self.find_own_document().await? {
            self.call(self.remote.update(&id, &snapshot)).await?;
            info!("Reattached to remote document {id}");
            self.remember_document(&id).await;
            return Ok(());
        }

        let id = self
            .call(self.remote.create(&self.settings.user_id, &snapshot))
            .await?;
        info!("Created remote document {id}");
        self.remember_document(&id).await;
        Ok(())
    }

    async fn remember_document(&self, id: &str) {
        if let Err(e) = self.store.put(REMOTE_DOC_KEY, id).await {
            error!("Failed to remember remote document id {id}: {e:?}");
        }
    }

    /// Newest document written by this device. Older duplicates are removed.
    async fn find_own_document(&self) -> Result<Option<String>, RemoteError> {
        let mut own = self
            .list_all()
            .await?
            .into_iter()
            .filter(|d| d.body.device_id == self.settings.device_id)
            .collect::<Vec<_>>();
        own.sort_by(|a, b| {
            b.body
                .updated_at
                .cmp(&a.body.updated_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        let mut own = own.into_iter();
        let newest = own.next().map(|d| d.id);
        for stale in own {
            match self.call(self.remote.delete(&stale.id)).await {
                Ok(()) => info!("Removed duplicate remote document {}", stale.id),
                Err(e) => warn!("Failed to remove duplicate remote document {}: {e}", stale.id),
            }
        }
        Ok(newest)
    }

    async fn drain_queue(&self) -> Result<DrainReport> {
        let report = self
            .queue
            .drain(move |item| async move { self.send(&item.payload).await })
            .await?;
        if report != DrainReport::default() {
            info!("Drained sync queue {report:?}");
        }
        Ok(report)
    }

    async fn push_current(&self) -> Result<PushOutcome> {
        let payload = self.local_snapshot().await?;
        if !self.is_online() {
            self.queue.enqueue(payload, self.clock.time(), 0).await?;
            info!("Offline, queued snapshot");
            return Ok(PushOutcome::Queued);
        }
        match self.send(&payload).await {
            Ok(()) => Ok(PushOutcome::Sent),
            Err(e) => {
                warn!("Push failed, queued for retry: {e}");
                self.queue.enqueue(payload, self.clock.time(), 1).await?;
                Ok(PushOutcome::Failed)
            }
        }
    }

    async fn list_page(&self, token: Option<String>) -> Result<DocumentPage, RemoteError> {
        let mut attempt = 0;
        loop {
            let result = self
                .call(self.remote.list(
                    &self.settings.user_id,
                    self.settings.page_size,
                    token.clone(),
                ))
                .await;
            attempt += 1;
            match result {
                Ok(page) => return Ok(page),
                Err(e) if attempt >= self.settings.pull_attempts => return Err(e),
                Err(e) => {
                    let delay = self.settings.backoff_base * 2u32.saturating_pow(attempt - 1);
                    warn!("Listing remote documents failed ({attempt}), retrying in {delay:?}: {e}");
                    self.clock.sleep(delay).await;
                }
            }
        }
    }

    /// Every document of the user, following pagination.
    async fn list_all(&self) -> Result<Vec<RemoteDocument>, RemoteError> {
        let mut documents = vec![];
        let mut token = None;
        loop {
            let page = self.list_page(token.take()).await?;
            documents.extend(page.documents);
            match page.next_page {
                Some(next) => token = Some(next),
                None => return Ok(documents),
            }
        }
    }

    async fn pull_merge(&self) -> Result<MergedUsage> {
        let documents = self
            .list_all()
            .await
            .map_err(|e| anyhow!("pull failed: {e}"))?;
        let context = self.settings.context();
        let mut discarded = 0;
        // Only the newest readable document of each device counts.
        let mut latest: BTreeMap<String, (RemoteDocument, UsageData)> = BTreeMap::new();
        for document in documents {
            let usage = match self
                .store
                .open_document::<UsageData>(&context, &document.body.sealed)
                .await
            {
                Ok(usage) => usage,
                Err(e) => {
                    warn!("Discarding remote document {}: {e}", document.id);
                    discarded += 1;
                    continue;
                }
            };
            let newer = latest
                .get(&document.body.device_id)
                .map_or(true, |(current, _)| {
                    (document.body.updated_at, &document.id)
                        > (current.body.updated_at, &current.id)
                });
            if newer {
                if let Some((superseded, _)) = latest.insert(
                    document.body.device_id.clone(),
                    (document, usage),
                ) {
                    debug!("Ignoring superseded remote document {}", superseded.id);
                }
            } else {
                debug!("Ignoring superseded remote document {}", document.id);
            }
        }

        let merged = MergedUsage {
            usage: UsageData::merged(latest.values().map(|(_, usage)| usage)),
            devices: latest.into_keys().collect(),
            discarded,
            merged_at: self.clock.time(),
        };
        self.store.put(MERGED_KEY, &merged).await?;
        info!(
            "Merged {} device snapshots, discarded {discarded}",
            merged.devices.len()
        );
        Ok(merged)
    }

    /// Pushes the current ledger. Offline or failed pushes are queued.
    pub async fn push(&self) -> Result<PassOutcome> {
        let Some(_guard) = self.begin() else {
            return Ok(PassOutcome::Skipped);
        };
        let drained = if self.is_online() {
            self.drain_queue().await?
        } else {
            DrainReport::default()
        };
        let push = self.push_current().await?;
        Ok(PassOutcome::Completed(SyncReport {
            drained,
            push: Some(push),
            merged: None,
        }))
    }

    /// Sends everything that queued up while offline.
    pub async fn drain(&self) -> Result<PassOutcome> {
        let Some(_guard) = self.begin() else {
            return Ok(PassOutcome::Skipped);
        };
        let drained = self.drain_queue().await?;
        Ok(PassOutcome::Completed(SyncReport {
            drained,
            push: None,
            merged: None,
        }))
    }

    #[cfg(test)]
    pub async fn pull(&self) -> Result<PassOutcome> {
        let Some(_guard) = self.begin() else {
            return Ok(PassOutcome::Skipped);
        };
        let merged = self.pull_merge().await?;
        Ok(PassOutcome::Completed(SyncReport {
            drained: DrainReport::default(),
            push: None,
            merged: Some(merged),
        }))
    }

    /// Full pass: drain, push, then pull and merge every device.
    pub async fn sync_now(&self) -> Result<PassOutcome> {
        let Some(_guard) = self.begin() else {
            return Ok(PassOutcome::Skipped);
        };
        if !self.is_online() {
            let push = self.push_current().await?;
            return Ok(PassOutcome::Completed(SyncReport {
                drained: DrainReport::default(),
                push: Some(push),
                merged: None,
            }));
        }
        let drained = self.drain_queue().await?;
        let push = self.push_current().await?;
        let merged = self.pull_merge().await?;
        Ok(PassOutcome::Completed(SyncReport {
            drained,
            push: Some(push),
            merged: Some(merged),
        }))
    }

    /// Last merged view of all devices.
    pub async fn merged_view(&self) -> Result<Option<MergedUsage>> {
        self.store.get(MERGED_KEY).await
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use anyhow::Result;

    use super::{
        PassOutcome, PushOutcome, SyncCoordinator, SyncSettings, MERGED_KEY, REMOTE_DOC_KEY,
    };
    use crate::{
        crypto::store::{testing::light_options, EncryptedStore},
        daemon::storage::{
            kv::{KeyValueStore, MemoryKeyValueStore},
            ledger::TimeLedger,
        },
        sync::remote::{
            DocumentPage, MemoryDocumentStore, MockRemoteDocumentStore, RemoteDocumentStore,
            RemoteError,
        },
        utils::{
            clock::{
                testing::{ManualClock, TEST_START_DATE},
                Clock,
            },
            logging::TEST_LOGGING,
        },
    };

    struct Device {
        store: Arc<EncryptedStore>,
        ledger: Arc<TimeLedger>,
        sync: Arc<SyncCoordinator>,
    }

    async fn device(
        name: &str,
        clock: &ManualClock,
        remote: Arc<dyn RemoteDocumentStore>,
    ) -> Result<Device> {
        *TEST_LOGGING;
        let clock = Arc::new(clock.clone()) as Arc<dyn Clock>;
        let kv = Arc::new(MemoryKeyValueStore::new()) as Arc<dyn KeyValueStore>;
        let store =
            Arc::new(EncryptedStore::open(kv, clock.clone(), light_options(Some("shared"))).await?);
        let ledger = Arc::new(TimeLedger::new(store.clone(), clock.clone()));
        let mut settings = SyncSettings::new("user", name);
        settings.backoff_base = Duration::from_millis(1);
        let sync = Arc::new(SyncCoordinator::new(
            store.clone(),
            ledger.clone(),
            remote,
            clock,
            settings,
        ));
        Ok(Device {
            store,
            ledger,
            sync,
        })
    }

    fn report(outcome: PassOutcome) -> super::SyncReport {
        match outcome {
            PassOutcome::Completed(report) => report,
            PassOutcome::Skipped => panic!("pass was skipped"),
        }
    }

    #[tokio::test]
    async fn test_devices_merge_through_remote() -> Result<()> {
        let clock = ManualClock::at_test_start();
        let remote = Arc::new(MemoryDocumentStore::new());
        let laptop = device("laptop", &clock, remote.clone()).await?;
        let desktop = device("desktop", &clock, remote.clone()).await?;
        let today = TEST_START_DATE.date();

        laptop.ledger.add_delta(today, "a.com", 100, clock.time(), true).await?;
        desktop.ledger.add_delta(today, "a.com", 50, clock.time(), true).await?;
        desktop.ledger.add_delta(today, "b.com", 10, clock.time(), true).await?;

        report(laptop.sync.sync_now().await?);
        let merged = report(desktop.sync.sync_now().await?).merged.unwrap();

        assert_eq!(merged.devices.len(), 2);
        assert_eq!(merged.usage.websites["a.com"].total_time, 150);
        assert_eq!(merged.usage.websites["a.com"].visit_count, 2);
        assert_eq!(merged.usage.total_session_time, 100);

        // A second push updates the same document instead of adding one.
        laptop.ledger.add_delta(today, "a.com", 1, clock.time(), false).await?;
        report(laptop.sync.push().await?);
        assert_eq!(remote.len().await, 2);

        // Local buckets never absorb other devices.
        assert_eq!(laptop.ledger.bucket(today).await?.domains.len(), 1);
        assert!(desktop.sync.merged_view().await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_device_keeps_a_single_remote_document() -> Result<()> {
        let clock = ManualClock::at_test_start();
        let remote = Arc::new(MemoryDocumentStore::new());
        let laptop = device("laptop", &clock, remote.clone()).await?;
        let desktop = device("desktop", &clock, remote.clone()).await?;
        laptop
            .ledger
            .add_delta(TEST_START_DATE.date(), "a.com", 100, clock.time(), true)
            .await?;
        report(laptop.sync.push().await?);

        // Losing the remembered id reattaches to the existing document.
        laptop.store.remove(REMOTE_DOC_KEY).await?;
        report(laptop.sync.push().await?);
        assert_eq!(remote.len().await, 1);

        // A stale copy left behind by an earlier create is ignored when merging.
        let page = remote.list("user", 50, None).await?;
        let mut stale = page.documents[0].body.clone();
        stale.updated_at -= chrono::Duration::hours(1);
        remote.create("user", &stale).await?;

        let merged = report(desktop.sync.sync_now().await?).merged.unwrap();
        assert_eq!(merged.devices, vec!["desktop".to_string(), "laptop".to_string()]);
        assert_eq!(merged.usage.websites["a.com"].total_time, 100);
        assert_eq!(merged.usage.websites["a.com"].visit_count, 1);

        // The next reattach removes the duplicate.
        laptop.store.remove(REMOTE_DOC_KEY).await?;
        report(laptop.sync.push().await?);
        assert_eq!(remote.len().await, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_offline_push_is_queued_and_drained_once() -> Result<()> {
        let clock = ManualClock::at_test_start();
        let remote = Arc::new(MemoryDocumentStore::new());
        let laptop = device("laptop", &clock, remote.clone()).await?;
        laptop
            .ledger
            .add_delta(TEST_START_DATE.date(), "a.com", 100, clock.time(), true)
            .await?;

        laptop.sync.set_online(false);
        let push = report(laptop.sync.push().await?).push;
        assert_eq!(push, Some(PushOutcome::Queued));
        assert_eq!(laptop.sync.queue().len().await?, 1);
        assert!(remote.is_empty().await);

        assert!(laptop.sync.set_online(true));
        let drained = report(laptop.sync.drain().await?).drained;
        assert_eq!(drained.delivered, 1);
        assert_eq!(laptop.sync.queue().len().await?, 0);
        assert_eq!(remote.len().await, 1);

        let drained = report(laptop.sync.drain().await?).drained;
        assert_eq!(drained.delivered, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_push_failing_three_times_is_dropped() -> Result<()> {
        let clock = ManualClock::at_test_start();
        let remote = Arc::new(MemoryDocumentStore::new());
        let laptop = device("laptop", &clock, remote.clone()).await?;
        remote.set_available(false);

        let push = report(laptop.sync.push().await?).push;
        assert_eq!(push, Some(PushOutcome::Failed));
        assert_eq!(laptop.sync.queue().items().await?[0].retry_count, 1);

        report(laptop.sync.drain().await?);
        assert_eq!(laptop.sync.queue().items().await?[0].retry_count, 2);

        let drained = report(laptop.sync.drain().await?).drained;
        assert_eq!(drained.dropped, 1);
        assert_eq!(laptop.sync.queue().len().await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_only_one_pass_in_flight() -> Result<()> {
        let clock = ManualClock::at_test_start();
        let mut remote = MockRemoteDocumentStore::new();
        remote
            .expect_list()
            .times(1)
            .returning(|_, _, _| Ok(DocumentPage::default()));
        let laptop = device("laptop", &clock, Arc::new(remote)).await?;

        let _held = laptop.sync.begin().unwrap();
        assert_eq!(laptop.sync.pull().await?, PassOutcome::Skipped);
        assert_eq!(laptop.sync.sync_now().await?, PassOutcome::Skipped);
        drop(_held);

        let merged = report(laptop.sync.pull().await?).merged.unwrap();
        assert!(merged.usage.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_pull_retries_then_surfaces_failure() -> Result<()> {
        let clock = ManualClock::at_test_start();
        let mut remote = MockRemoteDocumentStore::new();
        remote
            .expect_list()
            .times(3)
            .returning(|_, _, _| Err(RemoteError::Unavailable("down".into())));
        let laptop = device("laptop", &clock, Arc::new(remote)).await?;

        assert!(laptop.sync.pull().await.is_err());
        assert!(laptop.sync.merged_view().await?.is_none());
        // The guard was released by the failed pass.
        assert!(laptop.sync.begin().is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_foreign_documents_are_discarded() -> Result<()> {
        let clock = ManualClock::at_test_start();
        let remote = Arc::new(MemoryDocumentStore::new());
        let laptop = device("laptop", &clock, remote.clone()).await?;
        report(laptop.sync.push().await?);

        // Same user id, different passphrase.
        let clock_dyn = Arc::new(clock.clone()) as Arc<dyn Clock>;
        let kv = Arc::new(MemoryKeyValueStore::new()) as Arc<dyn KeyValueStore>;
        let store = Arc::new(
            EncryptedStore::open(kv.clone(), clock_dyn.clone(), light_options(Some("other")))
                .await?,
        );
        let ledger = Arc::new(TimeLedger::new(store.clone(), clock_dyn.clone()));
        let stranger = SyncCoordinator::new(
            store,
            ledger,
            remote.clone(),
            clock_dyn,
            SyncSettings::new("user", "stranger"),
        );
        let merged = report(stranger.sync_now().await?).merged.unwrap();
        assert_eq!(merged.discarded, 1);
        assert_eq!(merged.devices, vec!["stranger".to_string()]);
        assert!(kv.get(MERGED_KEY).await?.is_some());
        Ok(())
    }
}
