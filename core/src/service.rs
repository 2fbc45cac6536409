use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::db::Database;
use crate::error::Result;
use crate::locks::KeyedLocks;
use crate::models::{RecordKind, SyncReport};
use crate::remote::RemoteRecordService;
use crate::repository::{RecordRepository, RemotePolicy};
use crate::store::{RecordStore, SharedDatabase};

/// Entry point for front ends: one local database, one remote service and a
/// repository per record kind.
///
/// All repositories handed out by one service share the database connection
/// and the per-record lock map.
pub struct TallyService {
    db: SharedDatabase,
    remote: Arc<dyn RemoteRecordService>,
    locks: KeyedLocks,
    policy: RemotePolicy,
}

impl TallyService {
    pub fn open(path: &Path, remote: Arc<dyn RemoteRecordService>) -> Result<Self> {
        let db = Database::open(path)?;
        Ok(Self::with_database(db, remote))
    }

    pub fn open_in_memory(remote: Arc<dyn RemoteRecordService>) -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self::with_database(db, remote))
    }

    #[must_use]
    pub fn with_database(db: Database, remote: Arc<dyn RemoteRecordService>) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            remote,
            locks: KeyedLocks::new(),
            policy: RemotePolicy::default(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: RemotePolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn database(&self) -> &SharedDatabase {
        &self.db
    }

    #[must_use]
    pub fn repository(&self, kind: RecordKind) -> RecordRepository {
        RecordRepository::new(RecordStore::new(Arc::clone(&self.db), kind), Arc::clone(&self.remote))
            .with_locks(self.locks.clone())
            .with_policy(self.policy.clone())
    }

    #[must_use]
    pub fn bills(&self) -> RecordRepository {
        self.repository(RecordKind::BillReminder)
    }

    #[must_use]
    pub fn subscriptions(&self) -> RecordRepository {
        self.repository(RecordKind::Subscription)
    }

    /// Pull both collections. Kinds are synced one after the other so the
    /// reports come back in [`RecordKind::ALL`] order.
    pub async fn sync_all(&self) -> Vec<SyncReport> {
        let mut reports = Vec::with_capacity(RecordKind::ALL.len());
        for kind in RecordKind::ALL {
            reports.push(self.repository(kind).sync().await);
        }
        reports
    }
}
