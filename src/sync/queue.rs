use std::{collections::VecDeque, future::Future, sync::Arc};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::crypto::store::EncryptedStore;

use super::{remote::RemoteError, snapshot::UsageData};

pub const QUEUE_KEY: &str = "sync:queue";
pub const DEFAULT_MAX_QUEUE_LEN: usize = 50;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A snapshot waiting to be pushed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    pub id: String,
    pub payload: UsageData,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub enqueued_at: DateTime<Utc>,
    /// Failed delivery attempts so far.
    pub retry_count: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub requeued: usize,
    pub dropped: usize,
}

/// Persisted FIFO of pending pushes. Only the sync coordinator touches it, and never from two
/// passes at once.
pub struct SyncQueue {
    store: Arc<EncryptedStore>,
    max_len: usize,
    max_retries: u32,
}

impl SyncQueue {
    pub fn new(store: Arc<EncryptedStore>, max_len: usize, max_retries: u32) -> Self {
        Self {
            store,
            max_len: max_len.max(1),
            max_retries: max_retries.max(1),
        }
    }

    pub async fn items(&self) -> Result<VecDeque<SyncQueueItem>> {
        Ok(self.store.get(QUEUE_KEY).await?.unwrap_or_default())
    }

    async fn save(&self, items: &VecDeque<SyncQueueItem>) -> Result<()> {
        if items.is_empty() {
            self.store.remove(QUEUE_KEY).await
        } else {
            self.store.put(QUEUE_KEY, items).await
        }
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.items().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Appends a payload. When the queue is full the oldest entries are evicted.
    pub async fn enqueue(
        &self,
        payload: UsageData,
        now: DateTime<Utc>,
        retry_count: u32,
    ) -> Result<SyncQueueItem> {
        let mut items = self.items().await?;
        let item = SyncQueueItem {
            id: Uuid::new_v4().to_string(),
            payload,
            enqueued_at: now,
            retry_count,
        };
        items.push_back(item.clone());
        while items.len() > self.max_len {
            if let Some(evicted) = items.pop_front() {
                warn!(
                    "Sync queue is full, evicted {} from {}",
                    evicted.id, evicted.enqueued_at
                );
            }
        }
        self.save(&items).await?;
        debug!("Queued {} ({} pending)", item.id, items.len());
        Ok(item)
    }

    /// Hands every queued item to `send` once, in enqueue order. Failed items go to the back
    /// with one more failed attempt; items reaching the retry ceiling are dropped.
    pub async fn drain<F, Fut>(&self, mut send: F) -> Result<DrainReport>
    where
        F: FnMut(SyncQueueItem) -> Fut,
        Fut: Future<Output = Result<(), RemoteError>>,
    {
        let mut items = self.items().await?;
        let mut report = DrainReport::default();
        for _ in 0..items.len() {
            let Some(mut item) = items.pop_front() else {
                break;
            };
            match send(item.clone()).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    item.retry_count += 1;
                    if item.retry_count >= self.max_retries {
                        error!(
                            "Dropping queued snapshot {} after {} failed attempts: {e}",
                            item.id, item.retry_count
                        );
                        report.dropped += 1;
                    } else {
                        warn!(
                            "Queued snapshot {} failed ({} of {}): {e}",
                            item.id, item.retry_count, self.max_retries
                        );
                        items.push_back(item);
                        report.requeued += 1;
                    }
                }
            }
        }
        self.save(&items).await?;
        Ok(report)
    }
}
