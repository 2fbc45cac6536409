use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use serde::Serialize;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use tally_core::models::{RecordKind, RecurringRecord, SyncReport, validate_amount};

pub(crate) fn parse_date(date_str: Option<String>) -> Result<NaiveDate> {
    match date_str {
        None => Ok(Local::now().date_naive()),
        Some(s) => match s.as_str() {
            "today" => Ok(Local::now().date_naive()),
            "yesterday" => Ok(Local::now().date_naive() - chrono::Duration::days(1)),
            "tomorrow" => Ok(Local::now().date_naive() + chrono::Duration::days(1)),
            _ => NaiveDate::parse_from_str(&s, "%Y-%m-%d").with_context(|| {
                format!("Invalid date '{s}'. Use YYYY-MM-DD or today/yesterday/tomorrow")
            }),
        },
    }
}

/// Parse an amount such as "12.50" or "$12.50".
pub(crate) fn parse_amount(s: &str) -> Result<f64> {
    let trimmed = s.trim().trim_start_matches('$').replace(',', "");
    let value: f64 = trimmed
        .parse()
        .with_context(|| format!("Invalid amount: '{s}'. Use a number like '12.50'"))?;
    validate_amount(value)?;
    Ok(value)
}

/// Empty string clears the notes.
pub(crate) fn parse_notes(notes: Option<String>) -> Option<Option<String>> {
    notes.map(|n| {
        let n = n.trim().to_string();
        (!n.is_empty()).then_some(n)
    })
}

pub(crate) fn status_text(kind: RecordKind, status: bool) -> &'static str {
    match (kind, status) {
        (RecordKind::BillReminder, true) => "paid",
        (RecordKind::BillReminder, false) => "unpaid",
        (RecordKind::Subscription, true) => "active",
        (RecordKind::Subscription, false) => "cancelled",
    }
}

pub(crate) fn print_record_table(kind: RecordKind, records: &[RecurringRecord]) {
    #[derive(Tabled)]
    struct RecordRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Amount")]
        amount: String,
        #[tabled(rename = "Category")]
        category: String,
        #[tabled(rename = "Due")]
        due: String,
        #[tabled(rename = "Cycle")]
        cycle: String,
        #[tabled(rename = "Status")]
        status: String,
        #[tabled(rename = "Synced")]
        synced: String,
    }

    let rows: Vec<RecordRow> = records
        .iter()
        .map(|r| RecordRow {
            id: r.id,
            name: truncate(&r.name, 30),
            amount: format!("{:.2}", r.amount),
            category: truncate(&r.category, 20),
            due: r.due_date.format("%Y-%m-%d").to_string(),
            cycle: r.cycle.to_string(),
            status: status_text(kind, r.status).to_string(),
            synced: if r.has_remote_id() { "yes" } else { "no" }.to_string(),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::single(2)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn print_record(record: &RecurringRecord) {
    println!("{} #{}: {}", capitalize(&record.kind.to_string()), record.id, record.name);
    println!("  Amount:    {:.2}", record.amount);
    if !record.category.is_empty() {
        println!("  Category:  {}", record.category);
    }
    println!("  Due:       {}", record.due_date.format("%Y-%m-%d"));
    println!("  Cycle:     {}", record.cycle);
    println!("  Status:    {}", status_text(record.kind, record.status));
    println!(
        "  Remote id: {}",
        record.remote_id().unwrap_or("(not synced)")
    );
    if let Some(ref notes) = record.notes {
        println!("  Notes:     {notes}");
    }
}

pub(crate) fn print_sync_report(report: &SyncReport) {
    let label = format!("{}s", capitalize(&report.kind.to_string()));
    if let Some(ref err) = report.fetch_error {
        println!("{label}: fetch failed: {err}");
        return;
    }
    println!(
        "{label}: {} fetched, {} applied, {} unchanged, {} failed",
        report.fetched,
        report.applied,
        report.unchanged,
        report.failures.len()
    );
    for failure in &report.failures {
        let id = if failure.remote_id.is_empty() {
            "(no id)"
        } else {
            &failure.remote_id
        };
        println!("  ! {id}: {}", failure.error);
    }
    if !report.unmatched_local.is_empty() {
        let ids: Vec<String> = report.unmatched_local.iter().map(i64::to_string).collect();
        println!(
            "  {} local record(s) missing remotely, kept: {}",
            ids.len(),
            ids.join(", ")
        );
    }
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}
