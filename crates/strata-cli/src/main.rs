mod signal;

use std::path::Path;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use strata_core::commands;
use strata_core::config::{self, BackupSetConfig};

#[derive(Parser)]
#[command(
    name = "strata",
    version,
    about = "Versioned, deduplicated, encrypted backups"
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, default_value = "strata.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a new snapshot of a backup set
    Backup {
        /// Backup set name from the configuration file
        #[arg(long)]
        name: String,
    },

    /// List manifest entries for a backup set
    List {
        #[arg(long)]
        name: String,

        /// Only show entries whose blob address starts with this prefix
        #[arg(long)]
        sha: Option<String>,

        /// Only show entries committed at or before this time
        #[arg(long)]
        before: Option<String>,

        /// Only show entries committed at or after this time
        #[arg(long)]
        after: Option<String>,

        /// Path regex
        #[arg(default_value = ".*")]
        pattern: String,
    },

    /// Restore files matching a pattern into a destination directory
    Restore {
        #[arg(long)]
        name: String,

        /// Destination directory
        #[arg(long)]
        dest: String,

        /// Restore the state at or before this time instead of the latest
        #[arg(long)]
        before: Option<String>,

        /// Restore into a non-empty destination without asking
        #[arg(long)]
        yes: bool,

        /// Path regex
        #[arg(default_value = ".*")]
        pattern: String,
    },

    /// Read back stored data and verify it against recorded addresses
    Verify {
        #[arg(long)]
        name: String,

        #[arg(long)]
        before: Option<String>,

        /// Path regex
        #[arg(default_value = ".*")]
        pattern: String,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(cli.log_level.clone())
        .with_target(false)
        .init();

    signal::install_signal_handlers();

    tracing::info!("using config: {}", cli.config);
    let config = match config::load_config(Path::new(&cli.config)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let result = match &cli.command {
        Commands::Backup { name } => run_backup(&config, name),
        Commands::List {
            name,
            sha,
            before,
            after,
            pattern,
        } => run_list(&config, name, sha.as_deref(), before.as_deref(), after.as_deref(), pattern),
        Commands::Restore {
            name,
            dest,
            before,
            yes,
            pattern,
        } => run_restore(&config, name, dest, before.as_deref(), *yes, pattern),
        Commands::Verify {
            name,
            before,
            pattern,
        } => run_verify(&config, name, before.as_deref(), pattern),
    };

    if let Err((set_name, e)) = result {
        eprintln!("Error in set '{set_name}': {e}");
        std::process::exit(1);
    }
}

type CmdResult = Result<(), (String, Box<dyn std::error::Error>)>;

fn named<E: Into<Box<dyn std::error::Error>>>(name: &str) -> impl Fn(E) -> (String, Box<dyn std::error::Error>) + '_ {
    move |e| (name.to_string(), e.into())
}

fn lookup_set<'a>(
    config: &'a config::Config,
    name: &str,
) -> Result<&'a BackupSetConfig, (String, Box<dyn std::error::Error>)> {
    config.set(name).map_err(named(name))
}

fn run_backup(config: &config::Config, name: &str) -> CmdResult {
    let set = lookup_set(config, name)?;
    let stats = commands::backup::run(name, set, Some(&signal::SHUTDOWN)).map_err(named(name))?;

    println!("Backup of '{name}' finished");
    println!(
        "  examined: {}, new: {}, changed: {}, metadata-only: {}, unchanged: {}",
        stats.files_examined,
        stats.files_new,
        stats.files_changed,
        stats.files_metadata,
        stats.files_unchanged,
    );
    println!(
        "  deleted: {}, excluded: {}, blobs written: {}, blobs reused: {}",
        stats.tombstones, stats.files_excluded, stats.blobs_written, stats.blobs_reused,
    );
    if stats.files_failed > 0 {
        // Per-file failures are summarized here and enumerated in the log;
        // they do not change the exit code.
        println!("  skipped with errors: {}", stats.files_failed);
    }
    Ok(())
}

fn run_list(
    config: &config::Config,
    name: &str,
    sha: Option<&str>,
    before: Option<&str>,
    after: Option<&str>,
    pattern: &str,
) -> CmdResult {
    let set = lookup_set(config, name)?;
    let before = parse_instant(before).map_err(named(name))?;
    let after = parse_instant(after).map_err(named(name))?;

    let rows = commands::list::run(set, pattern, sha, before, after).map_err(named(name))?;
    if rows.is_empty() {
        println!("No matching entries.");
        return Ok(());
    }

    for row in rows {
        let when = format_instant(row.commit_ns);
        match row.sha {
            Some(sha) => {
                let kind = if row.is_diff { "diff" } else { "base" };
                println!(
                    "{when}  {}  {kind}  {:>10}  {}",
                    &sha.to_hex()[..12],
                    row.size,
                    row.path
                );
            }
            None => println!("{when}  {:12}  {:>4}  {:>10}  {}", "-", "del", "-", row.path),
        }
    }
    Ok(())
}

fn run_restore(
    config: &config::Config,
    name: &str,
    dest: &str,
    before: Option<&str>,
    yes: bool,
    pattern: &str,
) -> CmdResult {
    let set = lookup_set(config, name)?;
    let before = parse_instant(before).map_err(named(name))?;

    let dest_path = Path::new(dest);
    if !yes && dest_path.exists() {
        let occupied = dest_path
            .read_dir()
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        if occupied {
            return Err((
                name.to_string(),
                format!("destination '{dest}' is not empty; pass --yes to restore into it").into(),
            ));
        }
    }

    let stats = commands::restore::run(name, set, pattern, before, dest).map_err(named(name))?;
    println!(
        "Restored {} files ({} bytes) into '{dest}'",
        stats.files, stats.bytes
    );
    if stats.errors > 0 {
        println!("  {} paths failed; see the log", stats.errors);
    }
    Ok(())
}

fn run_verify(
    config: &config::Config,
    name: &str,
    before: Option<&str>,
    pattern: &str,
) -> CmdResult {
    let set = lookup_set(config, name)?;
    let before = parse_instant(before).map_err(named(name))?;

    let rows = commands::verify::run(name, set, pattern, before).map_err(named(name))?;
    let mut bad = 0u64;
    for row in &rows {
        match &row.error {
            None => println!("ok       {}", row.path),
            Some(msg) => {
                bad += 1;
                println!("CORRUPT  {}  ({msg})", row.path);
            }
        }
    }
    println!("Verified {} paths, {bad} corrupt", rows.len());
    if bad > 0 {
        return Err((name.to_string(), "verification found corrupt data".into()));
    }
    Ok(())
}

/// Parse a time bound: RFC 3339, or bare unix seconds. Returns unix nanos.
fn parse_instant(raw: Option<&str>) -> Result<Option<i64>, String> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    if let Ok(secs) = raw.parse::<i64>() {
        return Ok(Some(secs.saturating_mul(1_000_000_000)));
    }
    let parsed = DateTime::parse_from_rfc3339(raw)
        .map_err(|e| format!("invalid time '{raw}' (expected RFC 3339 or unix seconds): {e}"))?;
    let nanos = parsed
        .timestamp_nanos_opt()
        .ok_or_else(|| format!("time '{raw}' is out of range"))?;
    Ok(Some(nanos))
}

fn format_instant(unix_nanos: i64) -> String {
    match DateTime::<Utc>::from_timestamp(
        unix_nanos.div_euclid(1_000_000_000),
        unix_nanos.rem_euclid(1_000_000_000) as u32,
    ) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => unix_nanos.to_string(),
    }
}
