use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::{
    crypto::store::{is_metadata_key, EncryptedStore},
    daemon::{
        collection::{domain::normalize_domain, monitor::ActivityMonitor},
        storage::{
            ledger::{TimeLedger, USAGE_PREFIX},
            settings::{ExclusionStore, SETTINGS_PREFIX},
        },
    },
    sync::coordinator::{PassOutcome, SyncCoordinator, CACHE_PREFIX},
    utils::{
        clock::Clock,
        time::{key_to_date, local_date},
    },
};

use super::messages::{
    ExclusionsReply, ExportReply, RangeUsageReply, Request, RequestError, ResetReply, Response,
    RotateKeyReply, StorageUsage, SyncReply, SyncedUsageReply, TodayUsage, WebsiteUsage,
};

pub const EXPORT_VERSION: u64 = 1;
/// Longest span, in days including both ends, a range query may cover.
pub const MAX_RANGE_DAYS: i64 = 366;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Usage,
    Settings,
    Cache,
}

fn category(key: &str) -> Option<Category> {
    if key.starts_with(USAGE_PREFIX) {
        Some(Category::Usage)
    } else if key.starts_with(SETTINGS_PREFIX) || is_metadata_key(key) {
        Some(Category::Settings)
    } else if key.starts_with(CACHE_PREFIX) {
        Some(Category::Cache)
    } else {
        None
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate, RequestError> {
    key_to_date(raw.trim()).ok_or_else(|| RequestError::InvalidDate(raw.to_string()))
}

fn check_range(start: NaiveDate, end: NaiveDate) -> Result<(), RequestError> {
    if start > end {
        return Err(RequestError::InvalidRange { start, end });
    }
    let days = (end - start).num_days() + 1;
    if days > MAX_RANGE_DAYS {
        return Err(RequestError::RangeTooLong {
            days,
            max: MAX_RANGE_DAYS,
        });
    }
    Ok(())
}

/// Answers [Request]s from the stored data. The monitor and the sync coordinator are optional so
/// that the CLI can answer queries without a running daemon.
pub struct QueryFacade {
    store: Arc<EncryptedStore>,
    ledger: Arc<TimeLedger>,
    exclusions: Arc<ExclusionStore>,
    clock: Arc<dyn Clock>,
    monitor: Option<Arc<ActivityMonitor>>,
    sync: Option<Arc<SyncCoordinator>>,
}

impl QueryFacade {
    pub fn new(
        store: Arc<EncryptedStore>,
        ledger: Arc<TimeLedger>,
        exclusions: Arc<ExclusionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            ledger,
            exclusions,
            clock,
            monitor: None,
            sync: None,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<ActivityMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_sync(mut self, sync: Arc<SyncCoordinator>) -> Self {
        self.sync = Some(sync);
        self
    }

    pub async fn handle(&self, request: Request) -> Response {
        debug!("Handling request {request:?}");
        let response = match request {
            Request::GetTodayUsage => Response::from_result(self.today_usage().await),
            Request::GetRangeUsage {
                start_date,
                end_date,
            } => Response::from_result(self.range_usage(&start_date, &end_date).await),
            Request::GetExclusions => Response::from_result(self.exclusions().await),
            Request::AddExclusion { domain } => {
                Response::from_result(self.add_exclusion(&domain).await)
            }
            Request::RemoveExclusion { domain } => {
                Response::from_result(self.remove_exclusion(&domain).await)
            }
            Request::ExportData {
                start_date,
                end_date,
            } => Response::from_result(
                self.export(start_date.as_deref(), end_date.as_deref())
                    .await,
            ),
            Request::ResetData => Response::from_result(self.reset().await),
            Request::GetStorageUsage => Response::from_result(self.storage_usage().await),
            Request::GetSyncedUsage => Response::from_result(self.synced_usage().await),
            Request::SyncNow => Response::from_result(self.sync_now().await),
            Request::RotateKey => Response::from_result(self.rotate_key().await),
        };
        if let Response::Error { code, message } = &response {
            warn!("Request failed with {code}: {message}");
        }
        response
    }

    /// Today's usage including the time of the running session.
    pub async fn today_usage(&self) -> Result<TodayUsage, RequestError> {
        if let Some(monitor) = &self.monitor {
            monitor.tick().await;
        }
        let date = local_date(self.clock.as_ref(), self.clock.time());
        let bucket = self.ledger.bucket(date).await?;
        Ok(TodayUsage {
            date,
            total_ms: bucket.total_ms_all,
            websites: bucket.ranked().into_iter().map(WebsiteUsage::from).collect(),
        })
    }

    pub async fn range_usage(
        &self,
        start_date: &str,
        end_date: &str,
    ) -> Result<RangeUsageReply, RequestError> {
        let start = parse_date(start_date)?;
        let end = parse_date(end_date)?;
        check_range(start, end)?;
        if let Some(monitor) = &self.monitor {
            monitor.tick().await;
        }
        let usage = self.ledger.range_usage(start, end).await?;
        Ok(RangeUsageReply {
            start_date: usage.start,
            end_date: usage.end,
            total_ms: usage.total_ms,
            daily: usage.daily,
            domains: usage.domains.iter().map(WebsiteUsage::from).collect(),
        })
    }

    pub async fn exclusions(&self) -> Result<ExclusionsReply, RequestError> {
        Ok(ExclusionsReply {
            exclusions: self.exclusions.load().await?.to_vec(),
        })
    }

    pub async fn add_exclusion(&self, raw: &str) -> Result<ExclusionsReply, RequestError> {
        let domain = normalize_domain(raw)?;
        let set = self.exclusions.add(&domain).await?;
        if let Some(monitor) = &self.monitor {
            monitor.refresh(set.clone()).await;
        }
        info!("Excluded {domain}");
        Ok(ExclusionsReply {
            exclusions: set.to_vec(),
        })
    }

    pub async fn remove_exclusion(&self, raw: &str) -> Result<ExclusionsReply, RequestError> {
        let domain = normalize_domain(raw)?;
        let set = self.exclusions.remove(&domain).await?;
        if let Some(monitor) = &self.monitor {
            monitor.refresh(set.clone()).await;
        }
        info!("No longer excluding {domain}");
        Ok(ExclusionsReply {
            exclusions: set.to_vec(),
        })
    }

    /// Every day bucket in plain form.
    /// Stored days between the optional bounds. Unlike range queries the span is not capped,
    /// only days that exist are read.
    pub async fn export(
        &self,
        start_date: Option<&str>,
        end_date: Option<&str>,
    ) -> Result<ExportReply, RequestError> {
        let start = start_date.map(parse_date).transpose()?;
        let end = end_date.map(parse_date).transpose()?;
        if let (Some(start), Some(end)) = (start, end) {
            if start > end {
                return Err(RequestError::InvalidRange { start, end });
            }
        }
        if let Some(monitor) = &self.monitor {
            monitor.tick().await;
        }
        Ok(ExportReply {
            export_version: EXPORT_VERSION,
            exported_at: self.clock.time(),
            days: self.ledger.export_between(start, end).await?,
        })
    }

    pub async fn reset(&self) -> Result<ResetReply, RequestError> {
        Ok(ResetReply {
            removed_days: self.ledger.reset().await?,
        })
    }

    /// Bytes held per category. Falls back to measuring the stored JSON when the backend has no
    /// byte accounting.
    pub async fn storage_usage(&self) -> Result<StorageUsage, RequestError> {
        let kv = self.store.kv();
        let keys = kv.keys().await?;
        let mut grouped: [(Category, Vec<String>); 3] = [
            (Category::Usage, vec![]),
            (Category::Settings, vec![]),
            (Category::Cache, vec![]),
        ];
        for key in keys {
            if let Some(found) = category(&key) {
                if let Some((_, keys)) = grouped.iter_mut().find(|(c, _)| *c == found) {
                    keys.push(key);
                }
            }
        }

        let mut usage = StorageUsage::default();
        for (category, keys) in &grouped {
            let bytes = match kv.bytes_in_use(keys).await? {
                Some(bytes) => bytes,
                None => {
                    usage.estimated = true;
                    let mut estimate = 0u64;
                    for key in keys {
                        if let Some(value) = kv.get(key).await? {
                            let size = serde_json::to_vec(&value)
                                .with_context(|| format!("Failed to measure {key}"))?
                                .len();
                            estimate += (size + key.len()) as u64;
                        }
                    }
                    estimate
                }
            };
            match category {
                Category::Usage => usage.usage = bytes,
                Category::Settings => usage.settings = bytes,
                Category::Cache => usage.cache = bytes,
            }
        }
        usage.total = usage.usage + usage.settings + usage.cache;
        Ok(usage)
    }

    fn sync(&self) -> Result<&Arc<SyncCoordinator>, RequestError> {
        self.sync.as_ref().ok_or(RequestError::SyncUnavailable)
    }

    pub async fn synced_usage(&self) -> Result<SyncedUsageReply, RequestError> {
        Ok(SyncedUsageReply {
            merged: self.sync()?.merged_view().await?,
        })
    }

    pub async fn sync_now(&self) -> Result<SyncReply, RequestError> {
        let sync = self.sync()?;
        if let Some(monitor) = &self.monitor {
            monitor.tick().await;
        }
        let reply = match sync.sync_now().await? {
            PassOutcome::Skipped => SyncReply {
                skipped: true,
                delivered: 0,
                requeued: 0,
                dropped: 0,
                pushed: None,
                devices: 0,
                discarded: 0,
            },
            PassOutcome::Completed(report) => SyncReply {
                skipped: false,
                delivered: report.drained.delivered,
                requeued: report.drained.requeued,
                dropped: report.drained.dropped,
                pushed: report.push.map(|p| format!("{p:?}").to_lowercase()),
                devices: report.merged.as_ref().map_or(0, |m| m.devices.len()),
                discarded: report.merged.as_ref().map_or(0, |m| m.discarded),
            },
        };
        Ok(reply)
    }

    pub async fn rotate_key(&self) -> Result<RotateKeyReply, RequestError> {
        let report = self
            .store
            .rotate_key()
            .await
            .map_err(|e| RequestError::Internal(e.into()))?;
        Ok(RotateKeyReply {
            previous_key: report.previous_key,
            new_key: report.new_key,
            resealed: report.resealed,
            discarded: report.discarded,
        })
    }
}
