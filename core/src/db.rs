use std::path::Path;

use chrono::{Local, NaiveDate};
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{BillingCycle, RecordFilter, RecordKind, RecurringRecord};

const RECORD_COLUMNS: &str =
    "id, uuid, remote_id, name, amount, category, due_date, cycle, status, notes, updated_at";

pub struct Database {
    conn: Connection,
    bill_changes: watch::Sender<u64>,
    subscription_changes: watch::Sender<u64>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let (bill_changes, _) = watch::channel(0);
        let (subscription_changes, _) = watch::channel(0);
        let db = Database {
            conn,
            bill_changes,
            subscription_changes,
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            for kind in RecordKind::ALL {
                let table = kind.table();
                self.conn.execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS {table} (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        uuid TEXT NOT NULL UNIQUE,
                        remote_id TEXT UNIQUE,
                        name TEXT NOT NULL,
                        amount REAL NOT NULL,
                        category TEXT NOT NULL DEFAULT '',
                        due_date TEXT NOT NULL,
                        cycle TEXT NOT NULL DEFAULT 'monthly',
                        status INTEGER NOT NULL DEFAULT 0,
                        notes TEXT,
                        created_at TEXT NOT NULL,
                        updated_at TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_{table}_due_date ON {table}(due_date);
                    CREATE INDEX IF NOT EXISTS idx_{table}_status ON {table}(status);"
                ))?;
            }
            self.conn.execute_batch("PRAGMA user_version = 1;")?;
        }

        if version < 2 {
            // Hosted collection storage, used when this database backs `tally serve`
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS documents (
                    collection TEXT NOT NULL,
                    id TEXT NOT NULL,
                    client_key TEXT,
                    body TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (collection, id)
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_documents_client_key
                    ON documents(collection, client_key);

                PRAGMA user_version = 2;",
            )?;
        }

        Ok(())
    }

    // --- Change notification ---

    fn changes(&self, kind: RecordKind) -> &watch::Sender<u64> {
        match kind {
            RecordKind::BillReminder => &self.bill_changes,
            RecordKind::Subscription => &self.subscription_changes,
        }
    }

    /// Receiver that is marked changed after every write to `kind`'s table.
    pub fn subscribe(&self, kind: RecordKind) -> watch::Receiver<u64> {
        self.changes(kind).subscribe()
    }

    fn notify(&self, kind: RecordKind) {
        self.changes(kind).send_modify(|version| *version += 1);
    }

    // --- Row mapping ---

    // Expects RECORD_COLUMNS order.
    fn record_from_row(kind: RecordKind, row: &rusqlite::Row) -> rusqlite::Result<RecurringRecord> {
        let due_date: String = row.get(6)?;
        let due_date = NaiveDate::parse_from_str(&due_date, "%Y-%m-%d").map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let cycle: String = row.get(7)?;
        let cycle = cycle.parse::<BillingCycle>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(RecurringRecord {
            id: row.get(0)?,
            uuid: row.get(1)?,
            remote_id: row.get(2)?,
            kind,
            name: row.get(3)?,
            amount: row.get(4)?,
            category: row.get(5)?,
            due_date,
            cycle,
            status: row.get(8)?,
            notes: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn query_record(
        &self,
        kind: RecordKind,
        column: &str,
        value: &dyn rusqlite::ToSql,
    ) -> Result<Option<RecurringRecord>> {
        let table = kind.table();
        let record = self
            .conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM {table} WHERE {column} = ?1"),
                params![value],
                |row| Self::record_from_row(kind, row),
            )
            .optional()?;
        Ok(record)
    }

    // --- Records ---

    /// Insert a new row. An `id` of 0 lets SQLite assign one; an empty uuid
    /// gets a fresh v4. Collisions on id, uuid or remote id are reported as
    /// [`Error::ConstraintViolation`].
    pub fn insert_record(&self, record: &RecurringRecord) -> Result<RecurringRecord> {
        let kind = record.kind;
        let table = kind.table();
        let now = Local::now().to_rfc3339();
        let uuid = if record.uuid.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            record.uuid.clone()
        };
        let id = (record.id != 0).then_some(record.id);
        self.conn
            .execute(
                &format!(
                    "INSERT INTO {table} (id, uuid, remote_id, name, amount, category, due_date, cycle, status, notes, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    id,
                    uuid,
                    record.remote_id(),
                    record.name,
                    record.amount,
                    record.category,
                    record.due_date.format("%Y-%m-%d").to_string(),
                    record.cycle.as_str(),
                    record.status,
                    record.notes,
                    now,
                    now,
                ],
            )
            .map_err(|e| Error::from_sqlite(e, &format!("insert into {table}")))?;
        let id = self.conn.last_insert_rowid();
        self.notify(kind);
        self.get_record(kind, id)?
            .ok_or_else(|| Error::not_found(format!("{kind} {id} after insert")))
    }

    /// Replace every field of the row with `record.id`. The uuid is never
    /// rewritten.
    pub fn update_record(&self, record: &RecurringRecord) -> Result<RecurringRecord> {
        let kind = record.kind;
        let table = kind.table();
        let now = Local::now().to_rfc3339();
        let rows = self
            .conn
            .execute(
                &format!(
                    "UPDATE {table} SET remote_id = ?1, name = ?2, amount = ?3, category = ?4,
                        due_date = ?5, cycle = ?6, status = ?7, notes = ?8, updated_at = ?9
                     WHERE id = ?10"
                ),
                params![
                    record.remote_id(),
                    record.name,
                    record.amount,
                    record.category,
                    record.due_date.format("%Y-%m-%d").to_string(),
                    record.cycle.as_str(),
                    record.status,
                    record.notes,
                    now,
                    record.id,
                ],
            )
            .map_err(|e| Error::from_sqlite(e, &format!("update {table}")))?;
        if rows == 0 {
            return Err(Error::not_found(format!("{kind} {}", record.id)));
        }
        self.notify(kind);
        self.get_record(kind, record.id)?
            .ok_or_else(|| Error::not_found(format!("{kind} {}", record.id)))
    }

    /// Insert or overwrite keyed by remote id.
    ///
    /// Matching falls back to the uuid so a row created before its first remote
    /// write gets the remote id stitched in rather than duplicated. A uuid match
    /// only counts while that row is unlinked: a row already bound to another
    /// remote id keeps it, and the new document gets its own row under a fresh
    /// uuid.
    pub fn upsert_record_by_remote_id(&self, record: &RecurringRecord) -> Result<RecurringRecord> {
        let kind = record.kind;
        let remote_id = record.remote_id().ok_or_else(|| {
            Error::invalid_argument(format!("{kind} upsert requires a remote id"))
        })?;

        if let Some(existing) = self.query_record(kind, "remote_id", &remote_id)? {
            return self.update_record(&RecurringRecord {
                id: existing.id,
                uuid: existing.uuid,
                ..record.clone()
            });
        }

        let by_uuid = if record.uuid.is_empty() {
            None
        } else {
            self.query_record(kind, "uuid", &record.uuid)?
        };
        match by_uuid {
            Some(existing) if existing.remote_id().is_none() => {
                self.update_record(&RecurringRecord {
                    id: existing.id,
                    uuid: existing.uuid,
                    ..record.clone()
                })
            }
            // uuid belongs to a row linked elsewhere; an empty uuid gets a fresh v4
            Some(_) => self.insert_record(&RecurringRecord {
                id: 0,
                uuid: String::new(),
                ..record.clone()
            }),
            None => self.insert_record(&RecurringRecord {
                id: 0,
                ..record.clone()
            }),
        }
    }

    pub fn set_status_by_remote_id(
        &self,
        kind: RecordKind,
        remote_id: &str,
        status: bool,
    ) -> Result<RecurringRecord> {
        let table = kind.table();
        let now = Local::now().to_rfc3339();
        let rows = self.conn.execute(
            &format!("UPDATE {table} SET status = ?1, updated_at = ?2 WHERE remote_id = ?3"),
            params![status, now, remote_id],
        )?;
        if rows == 0 {
            return Err(Error::not_found(format!("{kind} with remote id {remote_id}")));
        }
        self.notify(kind);
        self.get_record_by_remote_id(kind, remote_id)?
            .ok_or_else(|| Error::not_found(format!("{kind} with remote id {remote_id}")))
    }

    /// Returns false when no row matched.
    pub fn delete_record(&self, kind: RecordKind, id: i64) -> Result<bool> {
        let table = kind.table();
        let rows = self
            .conn
            .execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![id])?;
        if rows > 0 {
            self.notify(kind);
        }
        Ok(rows > 0)
    }

    pub fn delete_record_by_remote_id(&self, kind: RecordKind, remote_id: &str) -> Result<bool> {
        let table = kind.table();
        let rows = self.conn.execute(
            &format!("DELETE FROM {table} WHERE remote_id = ?1"),
            params![remote_id],
        )?;
        if rows > 0 {
            self.notify(kind);
        }
        Ok(rows > 0)
    }

    pub fn get_record(&self, kind: RecordKind, id: i64) -> Result<Option<RecurringRecord>> {
        self.query_record(kind, "id", &id)
    }

    pub fn get_record_by_remote_id(
        &self,
        kind: RecordKind,
        remote_id: &str,
    ) -> Result<Option<RecurringRecord>> {
        self.query_record(kind, "remote_id", &remote_id)
    }

    pub fn list_records(
        &self,
        kind: RecordKind,
        filter: RecordFilter,
    ) -> Result<Vec<RecurringRecord>> {
        let table = kind.table();
        let records = match filter {
            RecordFilter::All => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {RECORD_COLUMNS} FROM {table} ORDER BY due_date, id"
                ))?;
                stmt.query_map([], |row| Self::record_from_row(kind, row))?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
            RecordFilter::Status(status) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {RECORD_COLUMNS} FROM {table} WHERE status = ?1 ORDER BY due_date, id"
                ))?;
                stmt.query_map(params![status], |row| Self::record_from_row(kind, row))?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(records)
    }

    // --- Hosted documents ---

    /// Create a document with a fresh id. When `client_key` was already used
    /// in this collection the existing id is returned and nothing is written.
    ///
    /// Returns `(id, created)`.
    pub fn create_document(
        &self,
        collection: &str,
        client_key: Option<&str>,
        body: &serde_json::Value,
    ) -> Result<(String, bool)> {
        if let Some(key) = client_key {
            let existing: Option<String> = self
                .conn
                .query_row(
                    "SELECT id FROM documents WHERE collection = ?1 AND client_key = ?2",
                    params![collection, key],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                return Ok((id, false));
            }
        }

        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO documents (collection, id, client_key, body, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    collection,
                    id,
                    client_key,
                    serde_json::to_string(&strip_id(body))?,
                    now,
                    now
                ],
            )
            .map_err(|e| Error::from_sqlite(e, "insert document"))?;
        Ok((id, true))
    }

    /// Overwrite the document at `id`, creating it if absent. Returns true
    /// when the document was created.
    pub fn put_document(&self, collection: &str, id: &str, body: &serde_json::Value) -> Result<bool> {
        let now = chrono::Utc::now().to_rfc3339();
        let body = serde_json::to_string(&strip_id(body))?;
        let rows = self.conn.execute(
            "UPDATE documents SET body = ?1, updated_at = ?2 WHERE collection = ?3 AND id = ?4",
            params![body, now, collection, id],
        )?;
        if rows > 0 {
            return Ok(false);
        }
        self.conn
            .execute(
                "INSERT INTO documents (collection, id, client_key, body, created_at, updated_at)
                 VALUES (?1, ?2, NULL, ?3, ?4, ?5)",
                params![collection, id, body, now, now],
            )
            .map_err(|e| Error::from_sqlite(e, "insert document"))?;
        Ok(true)
    }

    /// Merge top-level `fields` into an existing document.
    pub fn patch_document(
        &self,
        collection: &str,
        id: &str,
        fields: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Option<serde_json::Value>> {
        let Some(current) = self.get_document(collection, id)? else {
            return Ok(None);
        };
        let mut merged = strip_id(&current);
        if let serde_json::Value::Object(ref mut map) = merged {
            for (key, value) in fields {
                if key != "id" {
                    map.insert(key.clone(), value.clone());
                }
            }
        }
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "UPDATE documents SET body = ?1, updated_at = ?2 WHERE collection = ?3 AND id = ?4",
            params![serde_json::to_string(&merged)?, now, collection, id],
        )?;
        Ok(Some(with_id(merged, id)))
    }

    pub fn delete_document(&self, collection: &str, id: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection, id],
        )?;
        Ok(rows > 0)
    }

    pub fn get_document(&self, collection: &str, id: &str) -> Result<Option<serde_json::Value>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| row.get(0),
            )
            .optional()?;
        match body {
            Some(b) => {
                let value: serde_json::Value = serde_json::from_str(&b)?;
                Ok(Some(with_id(value, id)))
            }
            None => Ok(None),
        }
    }

    /// Every document in the collection, oldest first, each with its `id`.
    pub fn list_documents(&self, collection: &str) -> Result<Vec<serde_json::Value>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, body FROM documents WHERE collection = ?1 ORDER BY created_at, rowid",
        )?;
        let rows = stmt
            .query_map(params![collection], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut documents = Vec::with_capacity(rows.len());
        for (id, body) in rows {
            let value: serde_json::Value = serde_json::from_str(&body)?;
            documents.push(with_id(value, &id));
        }
        Ok(documents)
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }
}

fn strip_id(body: &serde_json::Value) -> serde_json::Value {
    let mut body = body.clone();
    if let serde_json::Value::Object(ref mut map) = body {
        map.remove("id");
    }
    body
}

fn with_id(mut body: serde_json::Value, id: &str) -> serde_json::Value {
    if let serde_json::Value::Object(ref mut map) = body {
        map.insert("id".to_string(), serde_json::Value::String(id.to_string()));
    }
    body
}
