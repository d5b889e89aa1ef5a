use std::collections::BTreeMap;

use anyhow::Result;
use serde_json::Value;
use tracing::{info, warn};

use crate::daemon::{
    collection::domain::normalize_domain,
    storage::{
        entities::{DayBucket, DomainStat},
        ledger::USAGE_PREFIX,
        settings::EXCLUSIONS_KEY,
    },
};

use super::store::{is_metadata_key, EncryptedStore, StoredValue, DATA_VERSION_KEY};

pub const CURRENT_SCHEMA_VERSION: u64 = 2;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub from_version: u64,
    pub to_version: u64,
    /// Versions whose step ran, in order.
    pub steps: Vec<u64>,
    pub values_sealed: usize,
    pub buckets_normalized: usize,
}

impl MigrationReport {
    pub fn ran(&self) -> bool {
        !self.steps.is_empty()
    }
}

async fn stored_version(store: &EncryptedStore) -> Result<u64> {
    Ok(store
        .kv()
        .get(DATA_VERSION_KEY)
        .await?
        .and_then(|v| v.as_u64())
        .unwrap_or(0))
}

/// Brings stored data to [CURRENT_SCHEMA_VERSION]. Every step is idempotent and the version is
/// written only after steps ran, so a current store is left untouched.
pub async fn migrate(store: &EncryptedStore) -> Result<MigrationReport> {
    let from_version = stored_version(store).await?;
    let mut report = MigrationReport {
        from_version,
        to_version: from_version,
        ..Default::default()
    };

    if from_version > CURRENT_SCHEMA_VERSION {
        warn!(
            "Stored data version {from_version} is newer than supported {CURRENT_SCHEMA_VERSION}, leaving it as is"
        );
        return Ok(report);
    }

    for version in (from_version + 1)..=CURRENT_SCHEMA_VERSION {
        match version {
            1 => report.values_sealed = seal_plain_values(store).await?,
            2 => report.buckets_normalized = normalize_domains(store).await?,
            _ => anyhow::bail!("no migration step for version {version}"),
        }
        report.steps.push(version);
    }

    if report.ran() {
        store
            .kv()
            .set(DATA_VERSION_KEY, Value::from(CURRENT_SCHEMA_VERSION))
            .await?;
        report.to_version = CURRENT_SCHEMA_VERSION;
        info!("Migrated stored data {report:?}");
    }
    Ok(report)
}

/// v1: values written before encryption existed get sealed in place.
async fn seal_plain_values(store: &EncryptedStore) -> Result<usize> {
    let mut sealed = 0;
    for key in store.kv().keys().await? {
        if is_metadata_key(&key) {
            continue;
        }
        if let Some(StoredValue::Plain(value)) = store.read_stored(&key).await? {
            store.put_value(&key, &value).await?;
            sealed += 1;
        }
    }
    Ok(sealed)
}

/// v2: domain keys become lowercase without `www.` or ports. Entries that collapse onto the
/// same domain are merged, entries that don't normalize are dropped.
async fn normalize_domains(store: &EncryptedStore) -> Result<usize> {
    let mut changed = 0;
    for key in store.keys_with_prefix(USAGE_PREFIX).await? {
        let Some(bucket) = store.get::<DayBucket>(&key).await? else {
            continue;
        };
        let Some(normalized) = normalize_bucket(&bucket) else {
            continue;
        };
        store.put(&key, &normalized).await?;
        changed += 1;
    }

    if let Some(exclusions) = store.get::<Vec<String>>(EXCLUSIONS_KEY).await? {
        let mut normalized = exclusions
            .iter()
            .filter_map(|v| normalize_domain(v).ok())
            .collect::<Vec<_>>();
        normalized.sort();
        normalized.dedup();
        if normalized != exclusions {
            store.put(EXCLUSIONS_KEY, &normalized).await?;
        }
    }
    Ok(changed)
}

/// Returns the normalized bucket, or `None` when it's already normalized.
fn normalize_bucket(bucket: &DayBucket) -> Option<DayBucket> {
    let mut domains = BTreeMap::<String, DomainStat>::new();
    for (raw, stat) in &bucket.domains {
        let Ok(domain) = normalize_domain(raw) else {
            warn!("Dropping unrecognized domain {raw:?} from {}", bucket.date_key);
            continue;
        };
        match domains.get_mut(&domain) {
            Some(existing) => existing.absorb(stat),
            None => {
                let mut stat = stat.clone();
                stat.domain = domain.clone();
                domains.insert(domain, stat);
            }
        }
    }

    let mut normalized = DayBucket {
        date_key: bucket.date_key,
        domains,
        total_ms_all: 0,
    };
    normalized.recompute_total();
    (normalized != *bucket).then_some(normalized)
}
