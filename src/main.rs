use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use jobrelay::config::JobrelayConfig;
use jobrelay::controller::Controller;
use jobrelay::request::{NewRequest, Request, RequestKind, RequestStatus, TargetMode};
use jobrelay::storage::{CancelOutcome, Store};

#[derive(Parser)]
#[command(
    name = "jobrelay",
    about = "Durable request queue between controllers and a host test runner",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (default: $JOBRELAY_CONFIG, then ./jobrelay.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Request store path, overriding the config file
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the host: claim requests and drive the runner
    Serve,

    /// Create the request store and its schema
    Init,

    /// Queue a test run or an asset refresh
    Submit {
        #[command(subcommand)]
        what: SubmitCommand,
    },

    /// Show queue and component status, or one request
    Status {
        /// Request id
        id: Option<i64>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show per-item results of a request
    Results {
        id: i64,

        #[arg(long)]
        json: bool,
    },

    /// List requests in one status, in claim order
    List {
        #[arg(long, default_value = "pending")]
        status: RequestStatus,

        #[arg(long)]
        json: bool,
    },

    /// Cancel a pending or running request
    Cancel { id: i64 },

    /// Show the execution log, newest first
    Log {
        /// Only entries for this request
        #[arg(long)]
        request: Option<i64>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Control background polling in the host
    Poller {
        #[command(subcommand)]
        action: PollerAction,
    },
}

#[derive(Subcommand)]
enum SubmitCommand {
    /// Run tests
    Test {
        /// What to run
        scope: TestScope,

        /// Class/method names or categories
        targets: Vec<String>,

        /// Runtime mode the tests target
        #[arg(long, default_value = "editor-mode")]
        mode: TargetMode,

        #[arg(long, default_value = "0", allow_negative_numbers = true)]
        priority: i64,

        #[command(flatten)]
        wait: WaitArgs,
    },

    /// Refresh assets; no paths means a full refresh
    Refresh {
        paths: Vec<String>,

        #[arg(long, default_value = "0", allow_negative_numbers = true)]
        priority: i64,

        #[command(flatten)]
        wait: WaitArgs,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum TestScope {
    All,
    Class,
    Method,
    Category,
}

impl TestScope {
    fn kind(self) -> RequestKind {
        match self {
            TestScope::All => RequestKind::RunAll,
            TestScope::Class => RequestKind::RunClass,
            TestScope::Method => RequestKind::RunMethod,
            TestScope::Category => RequestKind::RunCategory,
        }
    }
}

#[derive(Args)]
struct WaitArgs {
    /// Block until the request finishes
    #[arg(long)]
    wait: bool,

    /// Seconds to wait with --wait
    #[arg(long, default_value = "300")]
    timeout: u64,

    /// Status poll interval in milliseconds
    #[arg(long, default_value = "500")]
    poll_ms: u64,
}

#[derive(Subcommand)]
enum PollerAction {
    Enable,
    Disable,
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => JobrelayConfig::load(path)?,
        None => JobrelayConfig::load_or_default(),
    };
    if let Some(db) = cli.db {
        config.store.path = db;
    }

    jobrelay::init_tracing(&config.logging);

    if let Commands::Serve = cli.command {
        tracing::info!("Starting jobrelay host");
        return jobrelay::serve(config).await;
    }

    let store = Store::open(&config.store).with_context(|| {
        format!("failed to open request store at {}", config.store.path.display())
    })?;
    let controller = Controller::new(store);

    match cli.command {
        Commands::Serve => {}
        Commands::Init => {
            println!("Initialized request store at {}", config.store.path.display());
        }
        Commands::Submit { what } => {
            let (id, wait) = match what {
                SubmitCommand::Test {
                    scope,
                    targets,
                    mode,
                    priority,
                    wait,
                } => {
                    let mut request = NewRequest::new(scope.kind(), mode).with_priority(priority);
                    if !targets.is_empty() {
                        request = request.with_filter(targets.join(","));
                    } else if !matches!(scope, TestScope::All) {
                        bail!("`submit test {}` needs at least one target", scope_name(scope));
                    }
                    (controller.submit(request)?, wait)
                }
                SubmitCommand::Refresh {
                    paths,
                    priority,
                    wait,
                } => (controller.submit_refresh(&paths, priority)?, wait),
            };
            println!("Submitted request #{}", id);

            if wait.wait {
                let request = controller
                    .wait_for_completion(
                        id,
                        Duration::from_secs(wait.timeout),
                        Duration::from_millis(wait.poll_ms.max(10)),
                    )
                    .await?;
                print_request(&request);
                if request.status != RequestStatus::Completed || request.summary.failed > 0 {
                    bail!("request #{} finished {}", id, request.status);
                }
            }
        }
        Commands::Status { id: Some(id), json } => {
            let Some(request) = controller.request(id)? else {
                bail!("request #{} not found", id);
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&request)?);
            } else {
                print_request(&request);
            }
        }
        Commands::Status { id: None, json } => {
            let snapshot = controller.status()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                println!("\n=== jobrelay status ===");
                println!("Pending:            {}", snapshot.pending);
                println!("Running:            {}", snapshot.running);
                println!("Background polling: {}", polling_label(snapshot.background_polling));
                println!();
                if snapshot.heartbeats.is_empty() {
                    println!("No component heartbeats recorded.");
                } else {
                    let now = chrono::Utc::now();
                    println!("{:<12} | {:<10} | {:<10} | Message", "Component", "Status", "Last seen");
                    println!("{:-<12}-|-{:-<10}-|-{:-<10}-|-{:-<30}", "", "", "", "");
                    for hb in &snapshot.heartbeats {
                        println!(
                            "{:<12} | {:<10} | {:<10} | {}",
                            hb.component,
                            hb.status,
                            format!("{}s ago", hb.age(now).num_seconds().max(0)),
                            hb.message.as_deref().unwrap_or("")
                        );
                    }
                }
                println!();
            }
        }
        Commands::Results { id, json } => {
            let items = controller.results(id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else if items.is_empty() {
                println!("No results recorded for request #{}.", id);
            } else {
                println!("{:<12} | {:>9} | Name", "Outcome", "Duration");
                println!("{:-<12}-|-{:-<9}-|-{:-<40}", "", "", "");
                for item in &items {
                    println!(
                        "{:<12} | {:>8.3}s | {}",
                        item.outcome, item.duration_secs, item.name
                    );
                    if let Some(msg) = &item.message {
                        println!("{:<12} | {:>9} |   -> {}", "", "", msg);
                    }
                }
            }
        }
        Commands::List { status, json } => {
            let requests = controller.list(status)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&requests)?);
            } else if requests.is_empty() {
                println!("No {} requests.", status);
            } else {
                println!(
                    "{:<6} | {:<14} | {:<11} | {:>8} | {:<25} | Filter",
                    "Id", "Kind", "Mode", "Priority", "Created"
                );
                println!("{:-<6}-|-{:-<14}-|-{:-<11}-|-{:-<8}-|-{:-<25}-|-{:-<20}", "", "", "", "", "", "");
                for r in &requests {
                    println!(
                        "{:<6} | {:<14} | {:<11} | {:>8} | {:<25} | {}",
                        r.id,
                        r.kind,
                        r.target_mode,
                        r.priority,
                        r.created_at.format("%Y-%m-%d %H:%M:%S%.3f"),
                        r.filter.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        Commands::Cancel { id } => match controller.cancel(id)? {
            CancelOutcome::Cancelled { was } => {
                println!("Request #{} cancelled (was {}).", id, was);
            }
            CancelOutcome::NotCancellable(status) => {
                bail!("request #{} is already {} and cannot be cancelled", id, status);
            }
            CancelOutcome::NotFound => bail!("request #{} not found", id),
        },
        Commands::Log { request, limit } => {
            let entries = controller.log(request, limit)?;
            if entries.is_empty() {
                println!("Execution log is empty.");
            }
            for entry in &entries {
                let target = entry
                    .request_id
                    .map(|id| format!(" #{}", id))
                    .unwrap_or_default();
                println!(
                    "{} [{:<7}] {}{}: {}",
                    entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.level,
                    entry.source,
                    target,
                    entry.message
                );
            }
        }
        Commands::Poller { action } => match action {
            PollerAction::Enable => {
                controller.set_background_polling(true)?;
                println!("Background polling enabled.");
            }
            PollerAction::Disable => {
                controller.set_background_polling(false)?;
                println!("Background polling disabled.");
            }
            PollerAction::Status => {
                let setting = controller.store().background_polling()?;
                println!("Background polling: {}", polling_label(setting));
            }
        },
    }

    Ok(())
}

fn scope_name(scope: TestScope) -> &'static str {
    match scope {
        TestScope::All => "all",
        TestScope::Class => "class",
        TestScope::Method => "method",
        TestScope::Category => "category",
    }
}

fn polling_label(setting: Option<bool>) -> &'static str {
    match setting {
        Some(true) => "enabled",
        Some(false) => "disabled",
        None => "host default",
    }
}

fn print_request(r: &Request) {
    println!("\n=== Request #{} ===", r.id);
    println!("Kind:      {}", r.kind);
    println!("Mode:      {}", r.target_mode);
    if let Some(filter) = &r.filter {
        println!("Filter:    {}", filter);
    }
    println!("Status:    {}", r.status);
    println!("Priority:  {}", r.priority);
    println!("Created:   {}", r.created_at.to_rfc3339());
    if let Some(started) = r.started_at {
        println!("Started:   {}", started.to_rfc3339());
    }
    if let Some(completed) = r.completed_at {
        println!("Completed: {}", completed.to_rfc3339());
    }
    if let Some(kind) = r.error_kind {
        println!(
            "Error:     {}: {}",
            kind,
            r.error_message.as_deref().unwrap_or("")
        );
    }
    if r.status.is_terminal() && r.summary.total > 0 {
        println!(
            "Results:   {} total, {} passed, {} failed, {} skipped in {:.2}s",
            r.summary.total,
            r.summary.passed,
            r.summary.failed,
            r.summary.skipped,
            r.summary.duration_secs
        );
    }
    println!();
}
