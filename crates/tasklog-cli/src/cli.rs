//! CLI argument parsing with clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tasklog_core::LogKind;

const CLI_AFTER_HELP: &str = "\
EXIT STATUS:
  0  success
  1  failure (I/O, bad input, unresolvable task directory)
  2  history exists on disk but could not be parsed";

/// tasklog - inspect and repair an agent's per-task conversation logs
#[derive(Parser, Debug)]
#[command(name = "tasklog", version, after_help = CLI_AFTER_HELP)]
pub struct Cli {
    /// Storage root containing the `tasks/` directory
    #[arg(long, value_name = "DIR", env = "TASKLOG_ROOT")]
    pub root: PathBuf,

    /// Config file (defaults to <root>/tasklog.toml)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Operate on the UI log instead of the API log
    #[arg(long, global = true)]
    pub ui: bool,

    /// Show debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Print a task's records as JSON
    Read { task_id: String },
    /// Replace a task's records with a JSON array read from stdin
    Write { task_id: String },
    /// Show canonical file, lock status and leftover temp artifacts
    Inspect { task_id: String },
    /// Delete idle temp artifacts once the canonical file is valid
    Prune { task_id: String },
}

impl Cli {
    pub fn log_kind(&self) -> LogKind {
        if self.ui { LogKind::Ui } else { LogKind::Api }
    }

    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| self.root.join("tasklog.toml"))
    }
}
