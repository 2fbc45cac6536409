//! Local recurring-record store: a per-kind view over the shared
//! [`Database`] plus live observations of its rows.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::Stream;
use tokio::sync::watch;

use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{RecordFilter, RecordKind, RecurringRecord};

pub type SharedDatabase = Arc<Mutex<Database>>;

#[derive(Clone)]
pub struct RecordStore {
    db: SharedDatabase,
    kind: RecordKind,
}

impl RecordStore {
    #[must_use]
    pub fn new(db: SharedDatabase, kind: RecordKind) -> Self {
        Self { db, kind }
    }

    #[must_use]
    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    fn lock(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_kind(&self, record: &RecurringRecord) -> Result<()> {
        if record.kind == self.kind {
            Ok(())
        } else {
            Err(Error::invalid_argument(format!(
                "{} passed to the {} store",
                record.kind, self.kind
            )))
        }
    }

    pub fn insert(&self, record: &RecurringRecord) -> Result<RecurringRecord> {
        self.check_kind(record)?;
        self.lock().insert_record(record)
    }

    /// Full-row replace by local id. A missing row is [`Error::NotFound`].
    pub fn update(&self, record: &RecurringRecord) -> Result<RecurringRecord> {
        self.check_kind(record)?;
        self.lock().update_record(record)
    }

    pub fn upsert_by_remote_id(&self, record: &RecurringRecord) -> Result<RecurringRecord> {
        self.check_kind(record)?;
        self.lock().upsert_record_by_remote_id(record)
    }

    pub fn set_status_by_remote_id(&self, remote_id: &str, status: bool) -> Result<RecurringRecord> {
        self.lock()
            .set_status_by_remote_id(self.kind, remote_id, status)
    }

    /// Removes the row for `record` by local id and, when it carries one, by
    /// remote id as well. A stale local id therefore cannot leave the linked
    /// row behind. Absence is not an error.
    pub fn delete(&self, record: &RecurringRecord) -> Result<bool> {
        self.check_kind(record)?;
        let mut removed = record.id != 0 && self.delete_by_id(record.id)?;
        if let Some(remote_id) = record.remote_id() {
            removed |= self.delete_by_remote_id(remote_id)?;
        }
        Ok(removed)
    }

    pub fn delete_by_id(&self, id: i64) -> Result<bool> {
        self.lock().delete_record(self.kind, id)
    }

    pub fn delete_by_remote_id(&self, remote_id: &str) -> Result<bool> {
        self.lock().delete_record_by_remote_id(self.kind, remote_id)
    }

    pub fn get_by_id(&self, id: i64) -> Result<Option<RecurringRecord>> {
        self.lock().get_record(self.kind, id)
    }

    pub fn get_by_remote_id(&self, remote_id: &str) -> Result<Option<RecurringRecord>> {
        self.lock().get_record_by_remote_id(self.kind, remote_id)
    }

    pub fn list(&self, filter: RecordFilter) -> Result<Vec<RecurringRecord>> {
        self.lock().list_records(self.kind, filter)
    }

    #[must_use]
    pub fn observe(&self, filter: RecordFilter) -> LiveQuery {
        let changes = self.lock().subscribe(self.kind);
        LiveQuery {
            db: Arc::downgrade(&self.db),
            kind: self.kind,
            filter,
            changes,
            primed: false,
        }
    }

    #[must_use]
    pub fn observe_all(&self) -> LiveQuery {
        self.observe(RecordFilter::All)
    }

    /// Rows with `status == false`. Meaningful for bill reminders.
    #[must_use]
    pub fn observe_unpaid(&self) -> LiveQuery {
        self.observe(RecordFilter::UNPAID)
    }

    /// Rows with `status == true`. Meaningful for subscriptions.
    #[must_use]
    pub fn observe_active(&self) -> LiveQuery {
        self.observe(RecordFilter::ACTIVE)
    }
}

/// A live read over one table.
///
/// The first [`LiveQuery::next`] yields the current rows immediately. Each
/// later call waits for a write to the table and yields a fresh read. Writes
/// that land while nobody is polling collapse into one re-read, so a slow
/// consumer only ever sees the latest state. Dropping the query ends the
/// subscription; it does not keep the database alive.
pub struct LiveQuery {
    db: Weak<Mutex<Database>>,
    kind: RecordKind,
    filter: RecordFilter,
    changes: watch::Receiver<u64>,
    primed: bool,
}

impl LiveQuery {
    #[must_use]
    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    #[must_use]
    pub fn filter(&self) -> RecordFilter {
        self.filter
    }

    /// Next snapshot, or `None` once the database has been dropped.
    pub async fn next(&mut self) -> Option<Result<Vec<RecurringRecord>>> {
        if self.primed {
            self.changes.changed().await.ok()?;
        }
        self.primed = true;
        // Mark the current version seen before reading, so a write that races
        // with the read triggers another emission.
        self.changes.borrow_and_update();
        let db = self.db.upgrade()?;
        let db = db.lock().unwrap_or_else(PoisonError::into_inner);
        Some(db.list_records(self.kind, self.filter))
    }

    /// Make the next call yield the current rows without waiting.
    pub fn restart(&mut self) {
        self.primed = false;
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<RecurringRecord>>> {
        futures::stream::unfold(self, |mut query| async move {
            query.next().await.map(|snapshot| (snapshot, query))
        })
    }
}
