use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The two kinds of recurring record. Each kind owns one local table and one
/// remote collection, both named by [`RecordKind::table`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    BillReminder,
    Subscription,
}

impl RecordKind {
    pub const ALL: [RecordKind; 2] = [RecordKind::BillReminder, RecordKind::Subscription];

    #[must_use]
    pub fn table(self) -> &'static str {
        match self {
            Self::BillReminder => "bill_reminders",
            Self::Subscription => "subscriptions",
        }
    }

    /// Remote collection name. Mirrors the local table name.
    #[must_use]
    pub fn collection(self) -> &'static str {
        self.table()
    }

    #[must_use]
    pub fn from_collection(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.collection() == name)
    }

    /// What `status == true` means for this kind.
    #[must_use]
    pub fn status_label(self) -> &'static str {
        match self {
            Self::BillReminder => "paid",
            Self::Subscription => "active",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BillReminder => write!(f, "bill reminder"),
            Self::Subscription => write!(f, "subscription"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Once,
    Weekly,
    #[default]
    Monthly,
    Yearly,
}

impl BillingCycle {
    pub const ALL: [BillingCycle; 4] = [
        BillingCycle::Once,
        BillingCycle::Weekly,
        BillingCycle::Monthly,
        BillingCycle::Yearly,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }
}

impl fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingCycle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == lower)
            .ok_or_else(|| {
                Error::invalid_argument(format!(
                    "Invalid billing cycle '{s}'. Must be one of: once, weekly, monthly, yearly"
                ))
            })
    }
}

/// A bill reminder or subscription as held in the local store.
///
/// `id` is the local identifier (0 until the store assigns one), `uuid` is a
/// client token that stays fixed for the life of the record, and `remote_id`
/// is the server-issued document id once the first remote write succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringRecord {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    pub kind: RecordKind,
    pub name: String,
    pub amount: f64,
    pub category: String,
    pub due_date: NaiveDate,
    #[serde(default)]
    pub cycle: BillingCycle,
    pub status: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub updated_at: String,
}

impl RecurringRecord {
    /// Remote id, treating an empty string the same as absent.
    #[must_use]
    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref().filter(|id| !id.is_empty())
    }

    #[must_use]
    pub fn has_remote_id(&self) -> bool {
        self.remote_id().is_some()
    }

    /// True when the domain fields match, ignoring ids and timestamps.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn same_payload(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.name == other.name
            && self.amount == other.amount
            && self.category == other.category
            && self.due_date == other.due_date
            && self.cycle == other.cycle
            && self.status == other.status
            && self.notes == other.notes
    }
}

/// Caller input for creating a record.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub kind: RecordKind,
    pub name: String,
    pub amount: f64,
    pub category: String,
    pub due_date: NaiveDate,
    pub cycle: BillingCycle,
    pub status: bool,
    pub notes: Option<String>,
}

impl NewRecord {
    /// A record with no local id, uuid, or remote id yet.
    #[must_use]
    pub fn into_record(self) -> RecurringRecord {
        RecurringRecord {
            id: 0,
            uuid: String::new(),
            remote_id: None,
            kind: self.kind,
            name: self.name,
            amount: self.amount,
            category: self.category,
            due_date: self.due_date,
            cycle: self.cycle,
            status: self.status,
            notes: self.notes,
            updated_at: String::new(),
        }
    }
}

/// Partial update applied on top of an existing record.
#[derive(Debug, Clone, Default)]
#[allow(clippy::option_option)]
pub struct RecordChanges {
    pub name: Option<String>,
    pub amount: Option<f64>,
    pub category: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub cycle: Option<BillingCycle>,
    pub notes: Option<Option<String>>,
}

impl RecordChanges {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.amount.is_none()
            && self.category.is_none()
            && self.due_date.is_none()
            && self.cycle.is_none()
            && self.notes.is_none()
    }

    #[must_use]
    pub fn apply_to(self, record: &RecurringRecord) -> RecurringRecord {
        let mut updated = record.clone();
        if let Some(name) = self.name {
            updated.name = name;
        }
        if let Some(amount) = self.amount {
            updated.amount = amount;
        }
        if let Some(category) = self.category {
            updated.category = category;
        }
        if let Some(due_date) = self.due_date {
            updated.due_date = due_date;
        }
        if let Some(cycle) = self.cycle {
            updated.cycle = cycle;
        }
        if let Some(notes) = self.notes {
            updated.notes = notes;
        }
        updated
    }
}

/// Which rows a read or live observation covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFilter {
    All,
    Status(bool),
}

impl RecordFilter {
    pub const UNPAID: RecordFilter = RecordFilter::Status(false);
    pub const ACTIVE: RecordFilter = RecordFilter::Status(true);
}

/// A record that could not be applied during a sync.
#[derive(Debug, Clone, Serialize)]
pub struct SyncFailure {
    pub remote_id: String,
    pub error: String,
}

/// Outcome of a bulk pull from the remote collection.
///
/// `applied` counts rows written, `unchanged` counts documents whose local
/// copy already matched. `unmatched_local` lists local ids whose remote id was
/// not present in the fetched collection. Those rows are left in place.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub kind: RecordKind,
    pub fetched: usize,
    pub applied: usize,
    pub unchanged: usize,
    pub failures: Vec<SyncFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch_error: Option<String>,
    pub unmatched_local: Vec<i64>,
}

impl SyncReport {
    #[must_use]
    pub fn new(kind: RecordKind) -> Self {
        Self {
            kind,
            fetched: 0,
            applied: 0,
            unchanged: 0,
            failures: Vec::new(),
            fetch_error: None,
            unmatched_local: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.fetch_error.is_none() && self.failures.is_empty()
    }
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::invalid_argument("name must not be empty"));
    }
    Ok(())
}

pub fn validate_amount(amount: f64) -> Result<()> {
    if !amount.is_finite() {
        return Err(Error::invalid_argument("amount must be a finite number"));
    }
    if amount < 0.0 {
        return Err(Error::invalid_argument("amount must not be negative"));
    }
    Ok(())
}

/// Validate the domain fields of a record before any write.
pub fn validate_record(record: &RecurringRecord) -> Result<()> {
    validate_name(&record.name)?;
    validate_amount(record.amount)?;
    Ok(())
}
