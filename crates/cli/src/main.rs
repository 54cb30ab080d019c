//! `cairn`: developer front-end for the incremental rule engine and its content store.

mod cmd;
mod output;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cairn_lib::config::EngineConfig;

use crate::cmd::{ExecArgs, cmd_cat, cmd_exec, cmd_gc, cmd_ls, cmd_materialize, cmd_rules, cmd_snapshot};
use crate::output::OutputFormat;

#[derive(Parser)]
#[command(name = "cairn")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable debug logging
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Output format
  #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
  output: OutputFormat,

  /// Content store directory (overrides CAIRN_STORE_DIR)
  #[arg(long, global = true, value_name = "DIR")]
  store: Option<PathBuf>,

  /// Directory that globs are expanded against
  #[arg(long, global = true, value_name = "DIR", default_value = ".")]
  root: PathBuf,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Capture files matching globs into the store and print the snapshot
  Snapshot {
    /// Globs relative to --root; prefix with ! to exclude
    #[arg(required = true)]
    globs: Vec<String>,
  },

  /// Print one file of a stored tree
  Cat {
    /// Tree digest, as printed by `snapshot`
    digest: String,
    /// Path of the file inside the tree
    path: String,
  },

  /// List the files and empty directories of a stored tree
  Ls {
    /// Tree digest
    digest: String,
  },

  /// Write a stored tree to disk
  Materialize {
    /// Tree digest
    digest: String,
    /// Destination directory, created if missing
    destination: PathBuf,
  },

  /// Run a command in a sandbox, reusing cached results
  Exec(ExecArgs),

  /// Remove store entries unreachable from the given roots and the process cache
  Gc {
    /// Report what would be removed without deleting anything
    #[arg(long)]
    dry_run: bool,
    /// Tree or file digests to keep
    roots: Vec<String>,
  },

  /// Show the compiled graph of built-in rules
  Rules {
    /// Print Graphviz dot instead of a listing
    #[arg(long)]
    dot: bool,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let filter = if cli.verbose {
    EnvFilter::new("debug")
  } else {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
  };
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let mut config = EngineConfig::from_env().context("Invalid CAIRN_* environment")?;
  if let Some(store) = cli.store {
    config.store_dir = store;
  }

  match cli.command {
    Commands::Snapshot { globs } => cmd_snapshot(&config, &cli.root, globs, cli.output),
    Commands::Cat { digest, path } => cmd_cat(&config, &digest, &path),
    Commands::Ls { digest } => cmd_ls(&config, &digest, cli.output),
    Commands::Materialize { digest, destination } => cmd_materialize(&config, &digest, &destination, cli.output),
    Commands::Exec(args) => cmd_exec(&config, &cli.root, args, cli.output),
    Commands::Gc { dry_run, roots } => cmd_gc(&config, &roots, dry_run, cli.output),
    Commands::Rules { dot } => cmd_rules(dot, cli.output),
  }
}
