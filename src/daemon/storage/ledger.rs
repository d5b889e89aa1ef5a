use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    crypto::store::EncryptedStore,
    daemon::collection::domain::{normalize_domain, DomainError},
    utils::{
        clock::Clock,
        time::{date_range, date_to_key, key_to_date, split_by_local_day},
    },
};

use super::{
    entities::{DayBucket, DomainStat},
    locks::KeyedLocks,
};

pub const USAGE_PREFIX: &str = "usage:";
pub const DEFAULT_RETENTION_DAYS: u32 = 180;

pub fn usage_key(date: NaiveDate) -> String {
    format!("{USAGE_PREFIX}{}", date_to_key(date))
}

pub fn usage_key_date(key: &str) -> Option<NaiveDate> {
    key.strip_prefix(USAGE_PREFIX).and_then(key_to_date)
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("negative duration {0}ms")]
    NegativeDelta(i64),
    #[error(transparent)]
    InvalidDomain(#[from] DomainError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyTotal {
    pub date: NaiveDate,
    pub total_ms: u64,
}

/// Usage summed over a span of days.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeUsage {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub total_ms: u64,
    pub daily: Vec<DailyTotal>,
    /// Longest first.
    pub domains: Vec<DomainStat>,
}

/// Owner of the day buckets. Every change to a bucket is a read-modify-write under that
/// bucket's lock.
pub struct TimeLedger {
    store: Arc<EncryptedStore>,
    clock: Arc<dyn Clock>,
    locks: KeyedLocks,
}

impl TimeLedger {
    pub fn new(store: Arc<EncryptedStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            locks: KeyedLocks::default(),
        }
    }

    /// Adds `delta_ms` to `domain` on `date`. Returns the updated statistic.
    pub async fn add_delta(
        &self,
        date: NaiveDate,
        domain: &str,
        delta_ms: i64,
        now: DateTime<Utc>,
        is_visit: bool,
    ) -> Result<DomainStat, LedgerError> {
        if delta_ms < 0 {
            return Err(LedgerError::NegativeDelta(delta_ms));
        }
        let domain = normalize_domain(domain)?;
        let key = usage_key(date);

        let _guard = self.locks.lock(&key).await;
        let mut bucket = self.read_bucket(&key, date).await?;
        let stat = bucket
            .domains
            .entry(domain.clone())
            .or_insert_with(|| DomainStat::empty(domain, now));
        stat.total_active_ms = stat.total_active_ms.saturating_add(delta_ms as u64);
        stat.last_active_at = stat.last_active_at.max(now);
        if is_visit {
            stat.visit_count += 1;
        }
        let stat = stat.clone();
        bucket.recompute_total();
        self.store.put(&key, &bucket).await?;
        Ok(stat)
    }

    /// Attributes `[from, to)` to `domain`, split along local midnights so every day only
    /// receives its own share. Returns the number of milliseconds recorded.
    pub async fn record_interval(
        &self,
        domain: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<u64, LedgerError> {
        let mut recorded = 0;
        for (date, start, end) in split_by_local_day(self.clock.as_ref(), from, to) {
            let delta = (end - start).num_milliseconds();
            self.add_delta(date, domain, delta, end, false).await?;
            recorded += delta as u64;
        }
        Ok(recorded)
    }

    async fn read_bucket(&self, key: &str, date: NaiveDate) -> Result<DayBucket> {
        Ok(self
            .store
            .get::<DayBucket>(key)
            .await?
            .unwrap_or_else(|| DayBucket::empty(date)))
    }

    /// Bucket of `date`, empty when nothing was recorded.
    pub async fn bucket(&self, date: NaiveDate) -> Result<DayBucket> {
        self.read_bucket(&usage_key(date), date).await
    }

    pub async fn range_usage(&self, start: NaiveDate, end: NaiveDate) -> Result<RangeUsage> {
        let days = stream::iter(date_range(start, end))
            .map(|day| async move {
                self.bucket(day).await.unwrap_or_else(|e| {
                    warn!("Failed to read usage for {day}: {e}");
                    DayBucket::empty(day)
                })
            })
            .buffered(4)
            .collect::<Vec<_>>()
            .await;

        let mut domains = BTreeMap::<String, DomainStat>::new();
        let mut daily = Vec::with_capacity(days.len());
        for bucket in days {
            daily.push(DailyTotal {
                date: bucket.date_key,
                total_ms: bucket.total_ms_all,
            });
            for stat in bucket.domains.into_values() {
                match domains.get_mut(&stat.domain) {
                    Some(existing) => existing.absorb(&stat),
                    None => {
                        domains.insert(stat.domain.clone(), stat);
                    }
                }
            }
        }

        let total_ms = daily.iter().map(|d| d.total_ms).sum();
        let mut domains = domains.into_values().collect::<Vec<_>>();
        domains.sort_by(|a, b| {
            b.total_active_ms
                .cmp(&a.total_active_ms)
                .then_with(|| a.domain.cmp(&b.domain))
        });
        Ok(RangeUsage {
            start,
            end,
            total_ms,
            daily,
            domains,
        })
    }

    pub async fn stored_dates(&self) -> Result<Vec<NaiveDate>> {
        let mut dates = vec![];
        for key in self.store.keys_with_prefix(USAGE_PREFIX).await? {
            match usage_key_date(&key) {
                Some(date) => dates.push(date),
                None => warn!("Ignoring malformed usage key {key}"),
            }
        }
        dates.sort();
        Ok(dates)
    }

    /// Deletes buckets older than `retention_days` before `today`. Returns the removed dates.
    pub async fn cleanup_retention(
        &self,
        today: NaiveDate,
        retention_days: u32,
    ) -> Result<Vec<NaiveDate>> {
        let cutoff = today - Duration::days(retention_days as i64);
        let mut removed = vec![];
        for date in self.stored_dates().await? {
            if date >= cutoff {
                continue;
            }
            let key = usage_key(date);
            let _guard = self.locks.lock(&key).await;
            self.store.remove(&key).await?;
            removed.push(date);
        }
        if !removed.is_empty() {
            info!("Retention removed {} day buckets before {cutoff}", removed.len());
        }
        Ok(removed)
    }

    /// Deletes every bucket. Returns how many were removed.
    pub async fn reset(&self) -> Result<usize> {
        let keys = self.store.keys_with_prefix(USAGE_PREFIX).await?;
        for key in &keys {
            let _guard = self.locks.lock(key).await;
            self.store.remove(key).await?;
        }
        info!("Reset removed {} day buckets", keys.len());
        Ok(keys.len())
    }

    /// All readable buckets keyed by their date key.
    pub async fn export(&self) -> Result<BTreeMap<String, DayBucket>> {
        self.export_between(None, None).await
    }

    /// Readable buckets between the optional bounds, both included.
    pub async fn export_between(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<BTreeMap<String, DayBucket>> {
        let mut days = BTreeMap::new();
        for date in self.stored_dates().await? {
            if start.is_some_and(|start| date < start) || end.is_some_and(|end| date > end) {
                continue;
            }
            let bucket = self.bucket(date).await?;
            if bucket.is_empty() {
                debug!("Skipping empty bucket {date}");
                continue;
            }
            days.insert(date_to_key(date), bucket);
        }
        Ok(days)
    }
}
