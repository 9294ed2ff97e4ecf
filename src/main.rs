mod commands;
mod config;
mod daemon;
mod db;
mod logging;
mod queue;
mod shell;
mod sync;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fieldpost")]
#[command(about = "Offline task queue, background sync and shell cache for field posts")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fieldpost/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the sync engine and the shell gateway (default)
  Run,
  /// Run one drain cycle now and report the result
  Flush,
  /// Show queue size, sync configuration and shell caches
  Status,
  /// Inspect or edit the task queue
  #[command(subcommand)]
  Queue(QueueCommand),
  /// Manage shell caches
  #[command(subcommand)]
  Shell(ShellCommand),
  /// Print a remote record
  Record {
    /// Record path, e.g. incidents/42
    path: String,
  },
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// Enqueue a task
  Add {
    #[arg(long, default_value = "generic")]
    kind: String,
    /// Remote record to patch once payloads are uploaded
    #[arg(long)]
    path: String,
    #[arg(long)]
    client: String,
    #[arg(long)]
    unit: String,
    /// Payload file to embed, as name=path (repeatable)
    #[arg(long = "payload")]
    payloads: Vec<String>,
  },
  /// Enqueue raw task JSON (object or array) from a file, or - for stdin
  Import { source: PathBuf },
  /// List pending tasks in drain order
  List {
    #[arg(long)]
    json: bool,
  },
  /// Remove a task by id
  Remove { id: i64 },
  Count,
  /// Remove every pending task
  Clear,
}

#[derive(Subcommand, Debug)]
enum ShellCommand {
  /// Delete every cache of every generation
  Purge,
  /// List cache names
  Caches,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = config::Config::load(args.config.as_deref())?;

  let (_log_guard, log_path) = logging::init()?;
  tracing::debug!(log = %log_path.display(), "logging initialized");

  match args.command.unwrap_or(Command::Run) {
    Command::Run => daemon::run(config).await?,
    Command::Flush => commands::flush(&config).await?,
    Command::Status => commands::status(&config)?,
    Command::Record { path } => commands::record(&config, &path).await?,
    Command::Queue(cmd) => match cmd {
      QueueCommand::Add {
        kind,
        path,
        client,
        unit,
        payloads,
      } => {
        commands::queue_add(
          &config,
          commands::AddTask {
            kind,
            path,
            client,
            unit,
            payloads,
          },
        )?;
      }
      QueueCommand::Import { source } => {
        commands::queue_import(&config, &source)?;
      }
      QueueCommand::List { json } => commands::queue_list(&config, json)?,
      QueueCommand::Remove { id } => commands::queue_remove(&config, id)?,
      QueueCommand::Count => {
        commands::queue_count(&config)?;
      }
      QueueCommand::Clear => commands::queue_clear(&config)?,
    },
    Command::Shell(cmd) => match cmd {
      ShellCommand::Purge => {
        commands::shell_purge(&config)?;
      }
      ShellCommand::Caches => commands::shell_caches(&config)?,
    },
  }

  Ok(())
}
