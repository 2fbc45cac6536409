use anyhow::{Context, Result, bail};
use clap::Args;
use futures::StreamExt;

use tally_core::RecordRepository;
use tally_core::models::{
    BillingCycle, NewRecord, RecordChanges, RecordFilter, RecordKind, RecurringRecord,
};

use super::helpers::{
    json_error, parse_amount, parse_date, parse_notes, print_record, print_record_table,
    status_text,
};

#[derive(Args)]
pub(crate) struct AddArgs {
    /// Display name (e.g. "Electricity")
    pub name: String,
    /// Amount per cycle (e.g. "49.99")
    pub amount: String,
    /// Free-form category
    #[arg(short, long, default_value = "general")]
    pub category: String,
    /// Next due date (YYYY-MM-DD or today/yesterday/tomorrow, default: today)
    #[arg(long)]
    pub due: Option<String>,
    /// Billing cycle: once, weekly, monthly, yearly
    #[arg(long, default_value = "monthly")]
    pub cycle: String,
    /// Optional notes
    #[arg(long)]
    pub notes: Option<String>,
}

#[derive(Args)]
pub(crate) struct UpdateArgs {
    /// New name
    #[arg(long)]
    pub name: Option<String>,
    /// New amount
    #[arg(long)]
    pub amount: Option<String>,
    /// New category
    #[arg(short, long)]
    pub category: Option<String>,
    /// New due date (YYYY-MM-DD or today/yesterday/tomorrow)
    #[arg(long)]
    pub due: Option<String>,
    /// New billing cycle
    #[arg(long)]
    pub cycle: Option<String>,
    /// New notes (empty string clears them)
    #[arg(long)]
    pub notes: Option<String>,
}

fn find(repo: &RecordRepository, id: i64) -> Result<RecurringRecord> {
    repo.get_by_id(id)?
        .with_context(|| format!("No {} with id {id}", repo.kind()))
}

fn remote_id_of(record: &RecurringRecord) -> Result<String> {
    match record.remote_id() {
        Some(id) => Ok(id.to_string()),
        None => bail!(
            "{} {} has no remote copy yet; run `tally sync` first",
            record.kind,
            record.id
        ),
    }
}

pub(crate) async fn cmd_add(
    repo: &RecordRepository,
    args: AddArgs,
    status: bool,
    json: bool,
) -> Result<()> {
    let record = NewRecord {
        kind: repo.kind(),
        name: args.name.trim().to_string(),
        amount: parse_amount(&args.amount)?,
        category: args.category.trim().to_string(),
        due_date: parse_date(args.due)?,
        cycle: args.cycle.parse::<BillingCycle>()?,
        status,
        notes: parse_notes(args.notes).flatten(),
    }
    .into_record();

    let saved = repo.save(&record).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&saved)?);
    } else {
        println!(
            "Added {} {} \"{}\" ({:.2}, due {})",
            saved.kind,
            saved.id,
            saved.name,
            saved.amount,
            saved.due_date.format("%Y-%m-%d")
        );
    }
    Ok(())
}

pub(crate) fn cmd_list(repo: &RecordRepository, filter: RecordFilter, json: bool) -> Result<()> {
    let records = repo.list(filter)?;
    print_list(repo, &records, json)
}

fn print_list(repo: &RecordRepository, records: &[RecurringRecord], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(records)?);
    } else if records.is_empty() {
        eprintln!("No {}s found.", repo.kind());
    } else {
        print_record_table(repo.kind(), records);
        let total: f64 = records.iter().map(|r| r.amount).sum();
        println!("{} record(s), total {total:.2}", records.len());
    }
    Ok(())
}

/// Print the list, then reprint whenever the table changes, until Ctrl-C.
pub(crate) async fn cmd_watch(repo: &RecordRepository, filter: RecordFilter, json: bool) -> Result<()> {
    let query = match filter {
        RecordFilter::All => repo.get_all(),
        RecordFilter::Status(false) => repo.get_unpaid(),
        RecordFilter::Status(true) => repo.get_active(),
    };
    let stream = query.into_stream();
    tokio::pin!(stream);

    loop {
        tokio::select! {
            snapshot = stream.next() => {
                let Some(snapshot) = snapshot else { break };
                let records = snapshot?;
                if !json {
                    println!();
                }
                print_list(repo, &records, json)?;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

pub(crate) fn cmd_show(repo: &RecordRepository, id: i64, json: bool) -> Result<()> {
    match repo.get_by_id(id)? {
        Some(record) if json => println!("{}", serde_json::to_string_pretty(&record)?),
        Some(record) => print_record(&record),
        None => {
            let message = format!("No {} with id {id}", repo.kind());
            if json {
                println!("{}", json_error(&message));
            } else {
                eprintln!("{message}");
            }
        }
    }
    Ok(())
}

pub(crate) async fn cmd_update(
    repo: &RecordRepository,
    id: i64,
    args: UpdateArgs,
    json: bool,
) -> Result<()> {
    let changes = RecordChanges {
        name: args.name.map(|n| n.trim().to_string()),
        amount: args.amount.as_deref().map(parse_amount).transpose()?,
        category: args.category.map(|c| c.trim().to_string()),
        due_date: args.due.map(|d| parse_date(Some(d))).transpose()?,
        cycle: args
            .cycle
            .as_deref()
            .map(str::parse::<BillingCycle>)
            .transpose()?,
        notes: parse_notes(args.notes),
    };
    if changes.is_empty() {
        bail!("Nothing to update. Pass at least one of --name, --amount, --category, --due, --cycle, --notes");
    }

    let current = find(repo, id)?;
    let updated = repo.update(&changes.apply_to(&current)).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&updated)?);
    } else {
        println!("Updated {} {}", updated.kind, updated.id);
        print_record(&updated);
    }
    Ok(())
}

pub(crate) async fn cmd_set_status(
    repo: &RecordRepository,
    id: i64,
    status: bool,
    json: bool,
) -> Result<()> {
    let current = find(repo, id)?;
    let remote_id = remote_id_of(&current)?;
    let updated = match repo.kind() {
        RecordKind::BillReminder => repo.mark_paid(&remote_id, status).await?,
        RecordKind::Subscription => repo.set_active(&remote_id, status).await?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&updated)?);
    } else {
        println!(
            "Marked {} {} \"{}\" {}",
            updated.kind,
            updated.id,
            updated.name,
            status_text(updated.kind, updated.status)
        );
    }
    Ok(())
}

pub(crate) async fn cmd_delete(repo: &RecordRepository, id: i64, json: bool) -> Result<()> {
    let current = find(repo, id)?;
    repo.delete(&current).await?;

    if json {
        println!("{}", serde_json::json!({ "deleted": id }));
    } else {
        println!("Deleted {} {id} \"{}\"", current.kind, current.name);
    }
    Ok(())
}
