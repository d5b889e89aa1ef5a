use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Accumulated usage of one domain within one day.
#[derive(PartialEq, Eq, Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DomainStat {
    pub domain: String,
    pub total_active_ms: u64,
    pub visit_count: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_active_at: DateTime<Utc>,
}

impl DomainStat {
    pub fn empty(domain: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            domain: domain.into(),
            total_active_ms: 0,
            visit_count: 0,
            last_active_at: at,
        }
    }

    /// Folds another device's or another key's contribution into this one. Durations and
    /// visits are additive, the timestamp keeps the latest value.
    pub fn absorb(&mut self, other: &DomainStat) {
        self.total_active_ms = self.total_active_ms.saturating_add(other.total_active_ms);
        self.visit_count = self.visit_count.saturating_add(other.visit_count);
        self.last_active_at = self.last_active_at.max(other.last_active_at);
    }
}

/// The day-scoped aggregate of per-domain statistics. Keyed by the user's local calendar date.
#[derive(PartialEq, Eq, Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DayBucket {
    pub date_key: NaiveDate,
    #[serde(default)]
    pub domains: BTreeMap<String, DomainStat>,
    #[serde(default)]
    pub total_ms_all: u64,
}

impl DayBucket {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date_key: date,
            domains: BTreeMap::new(),
            total_ms_all: 0,
        }
    }

    pub fn recompute_total(&mut self) {
        self.total_ms_all = self
            .domains
            .values()
            .map(|v| v.total_active_ms)
            .fold(0u64, u64::saturating_add);
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Domains sorted by time spent, longest first. Ties are broken by name so output is stable.
    pub fn ranked(&self) -> Vec<&DomainStat> {
        let mut stats = self.domains.values().collect::<Vec<_>>();
        stats.sort_by(|a, b| {
            b.total_active_ms
                .cmp(&a.total_active_ms)
                .then_with(|| a.domain.cmp(&b.domain))
        });
        stats
    }
}
