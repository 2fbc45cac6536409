use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{BillingCycle, RecordKind, RecurringRecord, SyncFailure};

/// One entry of a collection scan. A document that could not be turned into a
/// record is carried as a failure, keyed by whatever id it had.
pub type FetchedRecord = std::result::Result<RecurringRecord, SyncFailure>;

/// Hosted document collection that mirrors the local store.
///
/// The CLI implements this with reqwest against `tally serve`. Implementations
/// perform a single attempt per call: timeouts, retries and locking are the
/// repository's job.
#[async_trait]
pub trait RemoteRecordService: Send + Sync {
    /// Create a document when `record` has no remote id, otherwise overwrite
    /// the document at that id. Returns the document id.
    ///
    /// Creates must be idempotent on `record.uuid`: repeating a create with the
    /// same uuid returns the id issued the first time.
    async fn save(&self, record: &RecurringRecord) -> Result<String>;

    /// Overwrite the document at `record.remote_id`.
    async fn update(&self, record: &RecurringRecord) -> Result<()>;

    /// Partial update of the status flag (paid / active).
    async fn set_status(&self, kind: RecordKind, remote_id: &str, status: bool) -> Result<()>;

    /// Remove a document. A missing document counts as success.
    async fn delete(&self, kind: RecordKind, remote_id: &str) -> Result<()>;

    /// Every document in the collection, in the order the backend returns them.
    ///
    /// `Err` is reserved for a failed scan. A single unreadable document comes
    /// back as an `Err` entry so the rest of the collection still applies.
    async fn fetch_all(&self, kind: RecordKind) -> Result<Vec<FetchedRecord>>;
}

/// Wire form of a record: the local row minus the local id and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub uuid: String,
    pub name: String,
    pub amount: f64,
    #[serde(default)]
    pub category: String,
    pub due_date: NaiveDate,
    #[serde(default)]
    pub cycle: BillingCycle,
    #[serde(default)]
    pub status: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl RemoteDocument {
    #[must_use]
    pub fn from_record(record: &RecurringRecord) -> Self {
        Self {
            id: record.remote_id().map(str::to_string),
            uuid: record.uuid.clone(),
            name: record.name.clone(),
            amount: record.amount,
            category: record.category.clone(),
            due_date: record.due_date,
            cycle: record.cycle,
            status: record.status,
            notes: record.notes.clone(),
        }
    }

    /// Convert into a record of `kind`. A document without an id is rejected,
    /// since the local row is keyed by it.
    pub fn into_record(self, kind: RecordKind) -> Result<RecurringRecord> {
        let remote_id = self
            .id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::invalid_argument("remote document has no id"))?;
        Ok(RecurringRecord {
            id: 0,
            uuid: self.uuid,
            remote_id: Some(remote_id),
            kind,
            name: self.name,
            amount: self.amount,
            category: self.category,
            due_date: self.due_date,
            cycle: self.cycle,
            status: self.status,
            notes: self.notes,
            updated_at: String::new(),
        })
    }
}
