use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{
    daemon::{
        collection::domain::DomainError,
        storage::{
            entities::{DayBucket, DomainStat},
            ledger::DailyTotal,
        },
    },
    sync::snapshot::MergedUsage,
};

/// Requests accepted from the extension UI and the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Request {
    GetTodayUsage,
    GetRangeUsage { start_date: String, end_date: String },
    GetExclusions,
    AddExclusion { domain: String },
    RemoveExclusion { domain: String },
    /// Every stored day unless narrowed. Replies over the outbound frame limit are refused, so
    /// long histories should be fetched in spans.
    ExportData {
        #[serde(default)]
        start_date: Option<String>,
        #[serde(default)]
        end_date: Option<String>,
    },
    ResetData,
    GetStorageUsage,
    GetSyncedUsage,
    SyncNow,
    RotateKey,
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("invalid date {0:?}, expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("range start {start} is after its end {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },
    #[error("range of {days} days is longer than the {max} days allowed")]
    RangeTooLong { days: i64, max: i64 },
    #[error(transparent)]
    InvalidDomain(#[from] DomainError),
    #[error("sync is not configured")]
    SyncUnavailable,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RequestError {
    pub fn code(&self) -> &'static str {
        match self {
            RequestError::InvalidDate(_)
            | RequestError::InvalidRange { .. }
            | RequestError::RangeTooLong { .. }
            | RequestError::InvalidDomain(_) => "INVALID_ARGUMENT",
            RequestError::SyncUnavailable => "UNAVAILABLE",
            RequestError::Internal(_) => "INTERNAL",
        }
    }
}

/// Reply to a [Request]. Failures are reported as data, never by dropping the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Response {
    Ok { data: Value },
    Error { code: String, message: String },
}

impl Response {
    pub fn from_result<T: Serialize>(result: Result<T, RequestError>) -> Self {
        let encoded = result.and_then(|data| {
            serde_json::to_value(data).map_err(|e| RequestError::Internal(e.into()))
        });
        match encoded {
            Ok(data) => Response::Ok { data },
            Err(e) => Response::Error {
                code: e.code().to_string(),
                message: e.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebsiteUsage {
    pub domain: String,
    pub time_spent: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_visited: DateTime<Utc>,
    pub visit_count: u64,
}

impl From<&DomainStat> for WebsiteUsage {
    fn from(stat: &DomainStat) -> Self {
        Self {
            domain: stat.domain.clone(),
            time_spent: stat.total_active_ms,
            last_visited: stat.last_active_at,
            visit_count: stat.visit_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodayUsage {
    pub date: NaiveDate,
    pub total_ms: u64,
    /// Longest first.
    pub websites: Vec<WebsiteUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeUsageReply {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub total_ms: u64,
    pub daily: Vec<DailyTotal>,
    pub domains: Vec<WebsiteUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExclusionsReply {
    pub exclusions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportReply {
    pub export_version: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub exported_at: DateTime<Utc>,
    pub days: BTreeMap<String, DayBucket>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetReply {
    pub removed_days: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUsage {
    pub usage: u64,
    pub settings: u64,
    pub cache: u64,
    pub total: u64,
    /// True when the sizes are JSON estimates rather than backend figures.
    pub estimated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedUsageReply {
    pub merged: Option<MergedUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReply {
    /// Another pass was already running, nothing was done.
    pub skipped: bool,
    pub delivered: usize,
    pub requeued: usize,
    pub dropped: usize,
    pub pushed: Option<String>,
    pub devices: usize,
    pub discarded: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotateKeyReply {
    pub previous_key: String,
    pub new_key: String,
    pub resealed: usize,
    pub discarded: usize,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Request, RequestError, Response};
    use crate::daemon::collection::domain::DomainError;

    #[test]
    fn test_request_wire_format() {
        let request: Request = serde_json::from_value(json!({
            "type": "GET_RANGE_USAGE",
            "startDate": "2018-07-01",
            "endDate": "2018-07-04",
        }))
        .unwrap();
        assert_eq!(
            request,
            Request::GetRangeUsage {
                start_date: "2018-07-01".into(),
                end_date: "2018-07-04".into()
            }
        );
        let request: Request = serde_json::from_value(json!({"type": "GET_TODAY_USAGE"})).unwrap();
        assert_eq!(request, Request::GetTodayUsage);
        let request: Request = serde_json::from_value(json!({"type": "EXPORT_DATA"})).unwrap();
        assert_eq!(
            request,
            Request::ExportData {
                start_date: None,
                end_date: None
            }
        );
        let request: Request =
            serde_json::from_value(json!({"type": "EXPORT_DATA", "startDate": "2018-07-01"}))
                .unwrap();
        assert_eq!(
            request,
            Request::ExportData {
                start_date: Some("2018-07-01".into()),
                end_date: None
            }
        );
        assert!(serde_json::from_value::<Request>(json!({"type": "DROP_TABLES"})).is_err());
    }

    #[test]
    fn test_response_wire_format() {
        let ok = Response::from_result(Ok::<_, RequestError>(vec![1, 2]));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"status": "ok", "data": [1, 2]})
        );

        let error = Response::from_result::<()>(Err(DomainError::Empty.into()));
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["code"], "INVALID_ARGUMENT");
    }
}
