mod commands;
mod config;
mod remote;
mod server;

use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use crate::commands::{
    AddArgs, UpdateArgs, cmd_add, cmd_delete, cmd_list, cmd_set_status, cmd_show, cmd_sync,
    cmd_update, cmd_watch,
};
use crate::config::Config;
use crate::remote::HttpRecordService;
use tally_core::db::Database;
use tally_core::models::{RecordFilter, RecordKind};
use tally_core::{RecordRepository, RemotePolicy, TallyService};

#[derive(Parser)]
#[command(
    name = "tally",
    version,
    about = "Track bill reminders and subscriptions, mirrored to a remote collection"
)]
struct Cli {
    #[command(flatten)]
    remote: RemoteArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RemoteArgs {
    /// Base URL of the remote document service
    #[arg(
        long = "remote",
        global = true,
        env = "TALLY_REMOTE_URL",
        default_value = "http://127.0.0.1:8080"
    )]
    url: String,
    /// API key for the remote service (default: the key stored by `tally serve`)
    #[arg(long, global = true, env = "TALLY_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    /// Seconds to wait for each remote call (at least 1)
    #[arg(
        long,
        global = true,
        default_value = "10",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    timeout: u64,
    /// Attempts per remote call before giving up
    #[arg(long, global = true, default_value = "3")]
    attempts: u32,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage bill reminders
    Bill {
        #[command(subcommand)]
        command: BillCommands,
    },
    /// Manage subscriptions
    Sub {
        #[command(subcommand)]
        command: SubCommands,
    },
    /// Pull remote records into the local store
    Sync {
        /// Only sync one kind
        #[arg(long, value_enum)]
        kind: Option<KindArg>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Host the remote document collection
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
        /// Disable API key authentication (for development/testing)
        #[arg(long)]
        no_auth: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Bills,
    Subs,
}

impl From<KindArg> for RecordKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Bills => RecordKind::BillReminder,
            KindArg::Subs => RecordKind::Subscription,
        }
    }
}

#[derive(Subcommand)]
enum BillCommands {
    /// Add a bill reminder
    Add {
        #[command(flatten)]
        fields: AddArgs,
        /// Record it as already paid
        #[arg(long)]
        paid: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List bill reminders
    List {
        /// Only unpaid bills
        #[arg(long, conflicts_with = "paid")]
        unpaid: bool,
        /// Only paid bills
        #[arg(long)]
        paid: bool,
        /// Keep running and reprint on every change
        #[arg(short, long)]
        watch: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one bill reminder
    Show {
        /// Local ID
        id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change fields of a bill reminder
    Update {
        /// Local ID
        id: i64,
        #[command(flatten)]
        fields: UpdateArgs,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Mark a bill paid
    Pay {
        /// Local ID
        id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Mark a bill unpaid
    Unpay {
        /// Local ID
        id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a bill reminder locally and remotely
    Delete {
        /// Local ID
        id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum SubCommands {
    /// Add a subscription
    Add {
        #[command(flatten)]
        fields: AddArgs,
        /// Record it as cancelled
        #[arg(long)]
        inactive: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List subscriptions
    List {
        /// Only active subscriptions
        #[arg(long, conflicts_with = "cancelled")]
        active: bool,
        /// Only cancelled subscriptions
        #[arg(long)]
        cancelled: bool,
        /// Keep running and reprint on every change
        #[arg(short, long)]
        watch: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one subscription
    Show {
        /// Local ID
        id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change fields of a subscription
    Update {
        /// Local ID
        id: i64,
        #[command(flatten)]
        fields: UpdateArgs,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Mark a subscription active
    Activate {
        /// Local ID
        id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Mark a subscription cancelled
    Cancel {
        /// Local ID
        id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a subscription locally and remotely
    Delete {
        /// Local ID
        id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn status_filter(only_true: bool, only_false: bool) -> RecordFilter {
    match (only_true, only_false) {
        (true, _) => RecordFilter::Status(true),
        (_, true) => RecordFilter::Status(false),
        _ => RecordFilter::All,
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("TALLY_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        eprintln!("Warning: logging disabled: {e}");
    }
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        if let Some(tally_core::Error::LocalWriteFailed { .. }) = e.downcast_ref::<tally_core::Error>() {
            eprintln!("The remote copy was written. Run `tally sync` to bring the local store up to date.");
        }
        process::exit(1);
    }
}

fn open_service(remote: &RemoteArgs, config: &Config) -> Result<TallyService> {
    let api_key = match remote.api_key {
        Some(ref key) => Some(key.clone()),
        None => config.read_api_key()?,
    };
    let client = HttpRecordService::new(&remote.url, api_key)?;
    let service = TallyService::open(&config.db_path, Arc::new(client))
        .with_context(|| format!("Failed to open {}", config.db_path.display()))?
        .with_policy(RemotePolicy {
            timeout: Duration::from_secs(remote.timeout),
            max_attempts: remote.attempts.max(1),
            ..RemotePolicy::default()
        });
    Ok(service)
}

async fn serve(config: &Config, port: u16, bind: &str, no_auth: bool) -> Result<()> {
    let db = Database::open(&config.server_db_path)
        .with_context(|| format!("Failed to open {}", config.server_db_path.display()))?;
    let api_key = if no_auth {
        None
    } else {
        Some(config.load_or_create_api_key()?.0)
    };
    server::start_server(db, port, bind, api_key).await
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;

    let command = match cli.command {
        Commands::Serve {
            port,
            bind,
            no_auth,
        } => return serve(&config, port, &bind, no_auth).await,
        command => command,
    };

    let service = open_service(&cli.remote, &config)?;
    match command {
        Commands::Bill { command } => run_bill(&service.bills(), command).await,
        Commands::Sub { command } => run_sub(&service.subscriptions(), command).await,
        Commands::Sync { kind, json } => cmd_sync(&service, kind.map(RecordKind::from), json).await,
        Commands::Serve { .. } => Ok(()),
    }
}

async fn run_bill(repo: &RecordRepository, command: BillCommands) -> Result<()> {
    match command {
        BillCommands::Add { fields, paid, json } => cmd_add(repo, fields, paid, json).await,
        BillCommands::List {
            unpaid,
            paid,
            watch,
            json,
        } => {
            let filter = status_filter(paid, unpaid);
            if watch {
                cmd_watch(repo, filter, json).await
            } else {
                cmd_list(repo, filter, json)
            }
        }
        BillCommands::Show { id, json } => cmd_show(repo, id, json),
        BillCommands::Update { id, fields, json } => cmd_update(repo, id, fields, json).await,
        BillCommands::Pay { id, json } => cmd_set_status(repo, id, true, json).await,
        BillCommands::Unpay { id, json } => cmd_set_status(repo, id, false, json).await,
        BillCommands::Delete { id, json } => cmd_delete(repo, id, json).await,
    }
}

async fn run_sub(repo: &RecordRepository, command: SubCommands) -> Result<()> {
    match command {
        SubCommands::Add {
            fields,
            inactive,
            json,
        } => cmd_add(repo, fields, !inactive, json).await,
        SubCommands::List {
            active,
            cancelled,
            watch,
            json,
        } => {
            let filter = status_filter(active, cancelled);
            if watch {
                cmd_watch(repo, filter, json).await
            } else {
                cmd_list(repo, filter, json)
            }
        }
        SubCommands::Show { id, json } => cmd_show(repo, id, json),
        SubCommands::Update { id, fields, json } => cmd_update(repo, id, fields, json).await,
        SubCommands::Activate { id, json } => cmd_set_status(repo, id, true, json).await,
        SubCommands::Cancel { id, json } => cmd_set_status(repo, id, false, json).await,
        SubCommands::Delete { id, json } => cmd_delete(repo, id, json).await,
    }
}
