//! How cairn reports snapshots, trees, rule graphs, process runs and collections.
//!
//! Every report has a text form for terminals and goes through [`print_json`] under `-o json`.

use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream};

use cairn_lib::fs::Snapshot;
use cairn_lib::rules::EntrySummary;
use cairn_lib::store::{DigestEntries, DigestEntry, GcStats};
use cairn_lib::util::hash::Digest;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

pub fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{json}");
  Ok(())
}

/// Hex prefix of a digest, enough to tell trees apart in a listing.
fn short(digest: &Digest) -> String {
  digest.hash.to_hex().chars().take(12).collect()
}

/// Rounded to milliseconds so `humantime` does not print micro and nanoseconds.
fn elapsed(duration: Duration) -> String {
  let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
  humantime::format_duration(Duration::from_millis(millis)).to_string()
}

fn size(bytes: u64) -> String {
  let units = ["B", "KiB", "MiB", "GiB"];
  let mut value = bytes as f64;
  let mut unit = 0;
  while value >= 1024.0 && unit < units.len() - 1 {
    value /= 1024.0;
    unit += 1;
  }
  if unit == 0 {
    format!("{bytes} B")
  } else {
    format!("{value:.1} {}", units[unit])
  }
}

fn done(message: &str) {
  println!("{} {message}", "✓".if_supports_color(Stream::Stdout, |s| s.green()));
}

fn stat(label: &str, value: &str) {
  println!("  {}: {value}", label.if_supports_color(Stream::Stdout, |s| s.dimmed()));
}

pub fn report_snapshot(snapshot: &Snapshot, took: Duration) {
  done(&format!(
    "Captured {} file(s) in {} director(ies)",
    snapshot.files.len(),
    snapshot.dirs.len()
  ));
  stat("Digest", &snapshot.digest.to_string());
  stat("Took", &elapsed(took));
  println!();
  for file in &snapshot.files {
    println!("  {file}");
  }
}

/// One line per entry: short digest, path, and `*` for executables.
pub fn report_tree(entries: &DigestEntries) {
  for entry in &entries.0 {
    match entry {
      DigestEntry::File {
        path,
        digest,
        is_executable,
      } => println!(
        "{}  {path}{}",
        short(digest).if_supports_color(Stream::Stdout, |s| s.dimmed()),
        if *is_executable { "*" } else { "" }
      ),
      DigestEntry::EmptyDirectory { path } => println!("{:12}  {path}/", ""),
    }
  }
}

pub fn report_materialized(digest: &Digest, destination: &std::path::Path) {
  done(&format!("Wrote {} to {}", short(digest), destination.display()));
}

/// Entries in id order, each followed by where its requests are answered from.
pub fn report_rules(summaries: &[EntrySummary]) {
  for summary in summaries {
    println!(
      "#{} {} -> {} for [{}]",
      summary.id,
      summary.rule.if_supports_color(Stream::Stdout, |s| s.bold()),
      summary.product,
      summary.params.join(", ")
    );
    for (key, source) in &summary.dependencies {
      println!("    {key} <- {source}");
    }
  }
}

/// Goes to stderr, next to the process's own stderr.
pub fn report_process_exit(exit_code: i32, took: Duration) {
  eprintln!(
    "{}",
    format!("process exited with code {exit_code} after {}", elapsed(took))
      .if_supports_color(Stream::Stderr, |s| s.yellow())
  );
}

pub fn report_outputs(digest: &Digest) {
  stat("Outputs", &digest.to_string());
}

pub fn report_gc(stats: &GcStats, dry_run: bool, took: Duration) {
  if dry_run {
    done("Dry run, nothing was deleted");
  } else {
    done("Garbage collection complete");
  }
  stat(
    "Files",
    &format!("{} of {} unreferenced", stats.files_deleted, stats.files_scanned),
  );
  stat(
    "Directories",
    &format!("{} of {} unreferenced", stats.directories_deleted, stats.directories_scanned),
  );
  stat("Space freed", &size(stats.bytes_freed));
  stat("Took", &elapsed(took));
}
