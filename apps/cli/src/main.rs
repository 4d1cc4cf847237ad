mod app;
mod config;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use app::App;
use config::Config;
use todosync_core::items::{Item, ItemDraft, ItemPatch, Priority};
use todosync_core::sync::ItemSyncState;

#[derive(Debug, Parser)]
#[command(
    name = "todosync",
    version,
    about = "Offline-first todo list synced with a remote record service",
    arg_required_else_help = true
)]
struct Cli {
    #[command(flatten)]
    config: Config,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show the current list
    List,
    /// Add an item
    Add {
        text: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, value_name = "YYYY-MM-DD")]
        due: Option<NaiveDate>,
        #[arg(long)]
        priority: Option<Priority>,
        #[arg(long = "tag", value_name = "TAG")]
        tags: Vec<String>,
    },
    /// Toggle an item's done flag
    Done { id: String },
    /// Change fields of an item
    Edit {
        id: String,
        #[arg(long)]
        text: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, value_name = "YYYY-MM-DD", conflicts_with = "clear_due")]
        due: Option<NaiveDate>,
        #[arg(long)]
        clear_due: bool,
        #[arg(long)]
        priority: Option<Priority>,
        /// Replace all tags
        #[arg(long = "tag", value_name = "TAG")]
        tags: Option<Vec<String>>,
    },
    /// Delete an item
    Rm { id: String },
    /// Move an item to a position in the local order
    Move { id: String, index: usize },
    /// Push queued changes now
    Sync,
    /// Show connectivity and queued changes
    Status,
    /// Stay connected and print the list whenever it changes
    Watch,
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn due_date(date: NaiveDate) -> Result<chrono::DateTime<Utc>> {
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .with_context(|| format!("invalid due date {}", date))?;
    Ok(Utc.from_utc_datetime(&midnight))
}

fn describe(item: &Item, state: Option<ItemSyncState>) -> String {
    let mut line = format!(
        "[{}] {}  {}",
        if item.done { "x" } else { " " },
        item.id,
        item.text
    );
    let mut details = vec![item.priority.to_string()];
    if let Some(due) = item.due_date {
        details.push(format!("due {}", due.format("%Y-%m-%d")));
    }
    details.extend(item.tags.iter().map(|tag| format!("#{}", tag)));
    match state {
        Some(ItemSyncState::PendingLocal) => details.push("pending".to_string()),
        Some(ItemSyncState::Tombstoned) => details.push("deleting".to_string()),
        _ => {}
    }
    line.push_str(&format!("  ({})", details.join(", ")));
    if !item.description.is_empty() {
        line.push_str(&format!("\n      {}", item.description));
    }
    line
}

async fn print_items(app: &App) -> Result<()> {
    let items = app.engine.items();
    if items.is_empty() {
        println!("No items.");
        return Ok(());
    }
    for item in &items {
        let state = app.engine.sync_state(&item.id).await?;
        println!("{}", describe(item, state));
    }
    Ok(())
}

async fn run(command: Command, app: &App) -> Result<()> {
    match command {
        Command::List => {
            app.wait_for_sync().await;
            app.flush().await;
            print_items(app).await?;
        }
        Command::Add {
            text,
            description,
            due,
            priority,
            tags,
        } => {
            app.wait_for_sync().await;
            let mut draft = ItemDraft::new(text);
            draft.description = description;
            draft.priority = priority;
            draft.tags = tags;
            if let Some(date) = due {
                draft.due_date = Some(due_date(date)?);
            }
            let item = app.engine.add(draft).await?;
            app.flush().await;
            let state = app.engine.sync_state(&item.id).await?;
            println!("{}", describe(&item, state));
        }
        Command::Done { id } => {
            app.wait_for_sync().await;
            let Some(item) = app.engine.toggle_done(&id).await? else {
                bail!("no item with id {}", id);
            };
            app.flush().await;
            let state = app.engine.sync_state(&item.id).await?;
            println!("{}", describe(&item, state));
        }
        Command::Edit {
            id,
            text,
            description,
            due,
            clear_due,
            priority,
            tags,
        } => {
            let patch = ItemPatch {
                text,
                description,
                done: None,
                due_date: match (due, clear_due) {
                    (Some(date), _) => Some(Some(due_date(date)?)),
                    (None, true) => Some(None),
                    (None, false) => None,
                },
                priority,
                tags,
            };
            if patch.is_empty() {
                bail!("nothing to change; pass at least one field");
            }
            app.wait_for_sync().await;
            let Some(item) = app.engine.edit(&id, patch).await? else {
                bail!("no item with id {}", id);
            };
            app.flush().await;
            let state = app.engine.sync_state(&item.id).await?;
            println!("{}", describe(&item, state));
        }
        Command::Rm { id } => {
            app.wait_for_sync().await;
            if !app.engine.delete(&id).await? {
                bail!("no item with id {}", id);
            }
            app.flush().await;
            println!("Deleted {}", id);
        }
        Command::Move { id, index } => {
            if !app.engine.move_item(&id, index).await? {
                bail!("no item with id {}", id);
            }
            print_items(app).await?;
        }
        Command::Sync => {
            if !app.wait_for_sync().await {
                let pending = app.engine.pending_actions().await?.len();
                println!("Offline: {} change(s) queued", pending);
                return Ok(());
            }
            app.engine.settle().await?;
            let report = app.engine.sync_now().await?;
            app.flush().await;
            println!(
                "Sync cycle {}: attempted {}, confirmed {}, kept {}, dropped {}",
                report.cycle, report.attempted, report.confirmed, report.retained, report.dropped
            );
        }
        Command::Status => {
            app.wait_for_sync().await;
            let status = app.monitor.status();
            println!(
                "online: {}  remote reachable: {}  can sync: {}",
                status.online,
                status.remote_reachable,
                status.can_sync()
            );
            let pending = app.engine.pending_actions().await?;
            println!("{} queued change(s)", pending.len());
            for entry in pending {
                let error = entry
                    .last_error
                    .as_deref()
                    .map(|e| format!(", last error: {}", e))
                    .unwrap_or_default();
                println!(
                    "  {:?} {} (retries {}{})",
                    entry.action.kind(),
                    entry.item_id(),
                    entry.retry_count,
                    error
                );
            }
        }
        Command::Watch => {
            let mut items = app.engine.subscribe_items();
            let mut can_sync = app.engine.subscribe_can_sync();
            print_items(app).await?;
            loop {
                tokio::select! {
                    changed = items.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        items.borrow_and_update();
                        println!();
                        print_items(app).await?;
                    }
                    changed = can_sync.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = *can_sync.borrow_and_update();
                        info!("Sync {}", if online { "available" } else { "unavailable" });
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let app = App::start(&cli.config).await?;
    let result = run(cli.command, &app).await;
    app.shutdown().await;
    result
}
