use std::io::{self, Read};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Local};
use clap::Parser;
use tasklog_core::recovery::list_artifacts;
use tasklog_core::{
    ConversationStore, HistorySource, LockManager, LockState, Record, StoreConfig, StoreError,
};

mod cli;

use cli::{Cli, CliCommand};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("tasklog: {}", e);
            if e.is_parse_failure() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(cli: Cli) -> Result<(), StoreError> {
    let config = StoreConfig::load(&cli.config_path())?;
    let store = ConversationStore::new(
        cli.root.clone(),
        cli.log_kind(),
        config,
        Arc::new(LockManager::new()),
    );

    match &cli.command {
        CliCommand::Read { task_id } => read(&store, task_id).await,
        CliCommand::Write { task_id } => write(&store, task_id).await,
        CliCommand::Inspect { task_id } => inspect(&store, task_id).await,
        CliCommand::Prune { task_id } => {
            let removed = store.prune_artifacts(task_id).await?;
            println!("{}", removed);
            Ok(())
        }
    }
}

async fn read(store: &ConversationStore, task_id: &str) -> Result<(), StoreError> {
    let outcome = store.read(task_id).await?;

    let source = match &outcome.source {
        HistorySource::Canonical => "canonical".to_string(),
        HistorySource::Legacy => "legacy (migrated)".to_string(),
        HistorySource::Recovered(path) => format!("recovered from {}", path.display()),
        HistorySource::Empty => "empty".to_string(),
    };
    let lock = match &outcome.lock {
        LockState::Held => "held".to_string(),
        LockState::Unavailable(reason) => format!("unavailable ({})", reason),
    };
    eprintln!(
        "[{} record(s), source: {}, lock: {}]",
        outcome.records.len(),
        source,
        lock
    );

    let json = serde_json::to_string_pretty(&outcome.records).map_err(|source| {
        StoreError::Serialize {
            path: "<stdout>".into(),
            source,
        }
    })?;
    println!("{}", json);
    Ok(())
}

async fn write(store: &ConversationStore, task_id: &str) -> Result<(), StoreError> {
    let mut input = String::new();
    io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| StoreError::io("reading", "<stdin>", e))?;

    let records: Vec<Record> = serde_json::from_str(&input).map_err(|e| {
        StoreError::io(
            "parsing",
            "<stdin>",
            io::Error::new(io::ErrorKind::InvalidInput, e),
        )
    })?;

    store.write(task_id, &records).await?;
    eprintln!("[wrote {} record(s)]", records.len());
    Ok(())
}

async fn inspect(store: &ConversationStore, task_id: &str) -> Result<(), StoreError> {
    let canonical = store.canonical_path(task_id).await?;
    let status = LockManager::inspect(&canonical, &store.config().lock)
        .await
        .map_err(|e| StoreError::io("inspecting lock for", &canonical, io::Error::other(e)))?;

    println!("kind:      {}", store.kind().label());
    println!("canonical: {}", canonical.display());
    println!("exists:    {}", canonical.is_file());
    println!("lock:      {:?}", status);

    let dir = canonical.parent().unwrap_or(&canonical);
    let artifacts = list_artifacts(dir, store.kind().canonical_file_name()).await?;
    println!("artifacts: {}", artifacts.len());
    for artifact in artifacts {
        let modified: DateTime<Local> = artifact.modified.into();
        println!(
            "  {} {} {}",
            artifact.role.tag(),
            modified.format("%Y-%m-%d %H:%M:%S%.3f"),
            artifact.path.display()
        );
    }
    Ok(())
}
