//! Prediction records and the document store that keeps them

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, DurationRound, SecondsFormat, TimeDelta, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::model::Verdict;
use crate::storage::StorageBackend;
use crate::Result;

const RECORD_PREFIX: &str = "predictions/";

/// Outcome of one successful prediction. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionRecord {
    pub id: String,
    pub result: Verdict,
    pub suggestion: String,
    #[serde(serialize_with = "serialize_millis")]
    pub created_at: DateTime<Utc>,
}

/// Always three fractional digits, `2024-05-01T10:00:05.000Z`.
fn serialize_millis<S>(ts: &DateTime<Utc>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
}

impl PredictionRecord {
    pub fn new(id: impl Into<String>, verdict: Verdict) -> Self {
        let now = Utc::now();
        let created_at = now
            .duration_trunc(TimeDelta::milliseconds(1))
            .unwrap_or(now);

        Self {
            id: id.into(),
            result: verdict,
            suggestion: verdict.suggestion().to_string(),
            created_at,
        }
    }
}

/// Append-only collection of [`PredictionRecord`]s.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert(&self, record: &PredictionRecord) -> Result<()>;

    /// Every stored record, in the store's default order.
    async fn list(&self) -> Result<Vec<PredictionRecord>>;
}

/// Keeps each record as a JSON document `predictions/{id}.json` in a blob backend.
pub struct StorageRecordStore {
    storage: Arc<dyn StorageBackend>,
}

impl StorageRecordStore {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    fn document_key(id: &str) -> String {
        format!("{}{}.json", RECORD_PREFIX, id)
    }
}

#[async_trait]
impl RecordStore for StorageRecordStore {
    async fn insert(&self, record: &PredictionRecord) -> Result<()> {
        let body = serde_json::to_vec(record)?;
        self.storage
            .put(
                &Self::document_key(&record.id),
                Bytes::from(body),
                "application/json",
            )
            .await
    }

    async fn list(&self) -> Result<Vec<PredictionRecord>> {
        let keys = self.storage.list(RECORD_PREFIX).await?;
        let mut records = Vec::with_capacity(keys.len());

        for key in keys.iter().filter(|k| k.ends_with(".json")) {
            let data = self.storage.get(key).await?;
            records.push(serde_json::from_slice(&data)?);
        }

        Ok(records)
    }
}
