use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{crypto::store::SealedDocument, daemon::storage::entities::{DayBucket, DomainStat}};

/// Totals of one domain over every recorded day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebsiteTotals {
    pub total_time: u64,
    pub visit_count: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_visited: DateTime<Utc>,
}

impl WebsiteTotals {
    fn absorb(&mut self, other: &WebsiteTotals) {
        self.total_time = self.total_time.saturating_add(other.total_time);
        self.visit_count = self.visit_count.saturating_add(other.visit_count);
        self.last_visited = self.last_visited.max(other.last_visited);
    }
}

/// Usage of one device, or the merge of several. This is the payload that travels between
/// devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageData {
    #[serde(default)]
    pub websites: BTreeMap<String, WebsiteTotals>,
    #[serde(default)]
    pub daily: BTreeMap<NaiveDate, BTreeMap<String, DomainStat>>,
    #[serde(default)]
    pub total_session_time: u64,
}

impl UsageData {
    pub fn from_buckets(buckets: impl IntoIterator<Item = DayBucket>) -> Self {
        let mut data = Self::default();
        for bucket in buckets {
            data.total_session_time = data.total_session_time.saturating_add(bucket.total_ms_all);
            for stat in bucket.domains.values() {
                let totals = WebsiteTotals {
                    total_time: stat.total_active_ms,
                    visit_count: stat.visit_count,
                    last_visited: stat.last_active_at,
                };
                match data.websites.get_mut(&stat.domain) {
                    Some(existing) => existing.absorb(&totals),
                    None => {
                        data.websites.insert(stat.domain.clone(), totals);
                    }
                }
            }
            data.daily.insert(bucket.date_key, bucket.domains);
        }
        data
    }

    /// Folds another device's data into this one. Per-domain time and visits are summed since
    /// every device only reports its own activity. The session total is the largest one seen,
    /// as each device's total already covers its own domains.
    pub fn merge(&mut self, other: &UsageData) {
        for (domain, totals) in &other.websites {
            match self.websites.get_mut(domain) {
                Some(existing) => existing.absorb(totals),
                None => {
                    self.websites.insert(domain.clone(), totals.clone());
                }
            }
        }
        for (date, domains) in &other.daily {
            let day = self.daily.entry(*date).or_default();
            for (domain, stat) in domains {
                match day.get_mut(domain) {
                    Some(existing) => existing.absorb(stat),
                    None => {
                        day.insert(domain.clone(), stat.clone());
                    }
                }
            }
        }
        self.total_session_time = self.total_session_time.max(other.total_session_time);
    }

    pub fn merged<'a>(snapshots: impl IntoIterator<Item = &'a UsageData>) -> UsageData {
        let mut merged = UsageData::default();
        for snapshot in snapshots {
            merged.merge(snapshot);
        }
        merged
    }

    pub fn is_empty(&self) -> bool {
        self.websites.is_empty() && self.daily.is_empty() && self.total_session_time == 0
    }

    /// Domains over all days, longest first.
    pub fn ranked_websites(&self) -> Vec<(&str, &WebsiteTotals)> {
        let mut sites = self
            .websites
            .iter()
            .map(|(domain, totals)| (domain.as_str(), totals))
            .collect::<Vec<_>>();
        sites.sort_by(|a, b| b.1.total_time.cmp(&a.1.total_time).then_with(|| a.0.cmp(b.0)));
        sites
    }
}

/// What a device uploads. The remote only ever sees the sealed payload and routing metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedSnapshot {
    #[serde(flatten)]
    pub sealed: SealedDocument,
    pub schema_version: u64,
    pub device_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

/// Cached result of the last pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedUsage {
    pub usage: UsageData,
    pub devices: Vec<String>,
    pub discarded: usize,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub merged_at: DateTime<Utc>,
}

#[cfg(test)]
pub mod testing {
    use chrono::{Duration, NaiveDate, TimeZone, Utc};

    use super::UsageData;
    use crate::daemon::storage::entities::{DayBucket, DomainStat};

    pub fn usage(day: u32, entries: &[(&str, u64, u64)], last_seen_s: i64) -> UsageData {
        let date = NaiveDate::from_ymd_opt(2018, 7, day).unwrap();
        let at = Utc.with_ymd_and_hms(2018, 7, day, 0, 0, 0).unwrap() + Duration::seconds(last_seen_s);
        let mut bucket = DayBucket::empty(date);
        for (domain, ms, visits) in entries {
            let mut stat = DomainStat::empty(*domain, at);
            stat.total_active_ms = *ms;
            stat.visit_count = *visits;
            bucket.domains.insert(domain.to_string(), stat);
        }
        bucket.recompute_total();
        UsageData::from_buckets([bucket])
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{testing::usage, UsageData};

    #[test]
    fn test_from_buckets_aggregates_days() {
        let mut data = usage(4, &[("a.com", 100, 1), ("b.com", 50, 2)], 10);
        data.merge(&usage(5, &[("a.com", 30, 1)], 20));
        assert_eq!(data.websites["a.com"].total_time, 130);
        assert_eq!(data.daily.len(), 2);
        assert_eq!(data.ranked_websites()[0].0, "a.com");
    }

    #[test]
    fn test_merge_sums_domains_and_maxes_session_total() {
        let laptop = usage(4, &[("a.com", 100, 1), ("b.com", 50, 2)], 10);
        let desktop = usage(4, &[("a.com", 200, 3)], 99);

        let merged = UsageData::merged([&laptop, &desktop]);
        let a = &merged.websites["a.com"];
        assert_eq!(a.total_time, 300);
        assert_eq!(a.visit_count, 4);
        assert_eq!(a.last_visited, desktop.websites["a.com"].last_visited);
        assert_eq!(merged.total_session_time, 200);

        let day = &merged.daily[&NaiveDate::from_ymd_opt(2018, 7, 4).unwrap()];
        assert_eq!(day["a.com"].total_active_ms, 300);
        assert_eq!(day["b.com"].visit_count, 2);
    }

    #[test]
    fn test_merge_is_order_independent() {
        let a = usage(4, &[("a.com", 100, 1), ("c.com", 7, 1)], 10);
        let b = usage(4, &[("a.com", 200, 3)], 99);
        let c = usage(6, &[("b.com", 5, 1)], 1);

        assert_eq!(UsageData::merged([&a, &b, &c]), UsageData::merged([&c, &b, &a]));
        assert_eq!(UsageData::merged([&a, &b]), UsageData::merged([&b, &a]));
    }

    #[test]
    fn test_wire_shape() {
        let data = usage(4, &[("a.com", 100, 1)], 0);
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["websites"]["a.com"]["totalTime"], 100);
        assert_eq!(json["daily"]["2018-07-04"]["a.com"]["visitCount"], 1);
        assert_eq!(json["totalSessionTime"], 100);
        assert_eq!(serde_json::from_value::<UsageData>(json).unwrap(), data);
    }
}
