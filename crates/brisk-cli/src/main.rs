mod cli;
mod config;
mod storage;
mod sync;
mod tasks;

use brisk_core::storage::SecureStore;
use brisk_task::SnapshotRepo;
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::{Command, ConfigCommand, TaskCommand};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load()?;
    let command = cli.command.unwrap_or(Command::Task(TaskCommand::List {
        list: None,
        all: false,
    }));
    match command {
        Command::Version => print_version(),
        Command::Health => run_health_check(&config).await?,
        Command::Config(ConfigCommand::Init) => init_config()?,
        Command::Task(cmd) => {
            let store = storage::open_task_store(&config).await?;
            tasks::handle(cmd, &store).await?
        }
        Command::List(cmd) => {
            let store = storage::open_task_store(&config).await?;
            tasks::handle_list(cmd, &store).await?
        }
        Command::Queue(cmd) => {
            let store = storage::open_task_store(&config).await?;
            tasks::handle_queue(cmd, &store).await?
        }
        Command::Sync { watch } => {
            let store = storage::open_task_store(&config).await?;
            sync::run(store, &config, watch).await?
        }
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters, default to info to avoid noisy stdout.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("brisk {}", env!("CARGO_PKG_VERSION"));
}

/// Round-trips a small blob through the encrypted store, then decodes the saved
/// snapshot (if any) without opening the task store.
async fn run_health_check(config: &config::Config) -> Result<()> {
    let store = storage::store_from_config(config)?;
    run_store_health(&store).await?;
    println!("Storage: ok");

    let repo = SnapshotRepo::new(store);
    println!("{}", snapshot_health(&repo).await?);
    Ok(())
}

async fn run_store_health<S: SecureStore>(store: &S) -> Result<()> {
    let check_key = "health/check";
    let payload = b"ok";
    store.put(check_key, payload).await?;
    let round_trip = store.get(check_key).await?;
    store.delete(check_key).await?;

    if round_trip != payload {
        color_eyre::eyre::bail!("storage round-trip failed");
    }
    Ok(())
}

async fn snapshot_health(repo: &SnapshotRepo) -> Result<String> {
    let snapshot = repo
        .load()
        .await
        .map_err(|e| eyre!("snapshot unreadable: {e:#}"))?;
    Ok(match snapshot {
        Some(s) => format!(
            "Snapshot: ok ({} task(s), {} list(s), {} queued change(s))",
            s.tasks_by_id.len(),
            s.lists_by_id.len(),
            s.mutation_queue.len()
        ),
        None => "Snapshot: none saved yet".to_string(),
    })
}

fn init_config() -> Result<()> {
    let path = config::write_default_if_missing(&config::Config::starter())?;
    println!("Config initialized at {}", path.display());
    Ok(())
}
