//! embellish - cache maintenance and host simulation
//!
//! CLI front end for `embellish-core`.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::debug;

use embellish_core::cache::TtlCache;
use embellish_core::clock::{Clock, SystemClock};
use embellish_core::config::{Config, LogFormat};
use embellish_core::error::{ConfigError, Remediation, StoreError};
use embellish_core::logging::{LogConfig, init_logging};
use embellish_core::store::FileStore;

mod simulate;

/// embellish - keeps metadata annotations attached to a host-rendered UI
#[derive(Parser, Debug)]
#[command(name = "embellish")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, env = "EMBELLISH_CONFIG")]
    config: Option<PathBuf>,

    /// Path to the cache store file
    #[arg(long, global = true, env = "EMBELLISH_STORE")]
    store: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inspect and maintain the persisted cache
    #[command(subcommand)]
    Cache(CacheCommands),

    /// Show or validate configuration
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Run a scripted host session against the in-memory host
    Simulate,
}

#[derive(Subcommand, Debug)]
enum CacheCommands {
    /// Entry counts and size
    Stats {
        /// Emit JSON
        #[arg(long)]
        json: bool,
    },

    /// List entries, oldest first
    #[command(alias = "ls")]
    List,

    /// Print the payload stored under a key
    Get {
        /// Logical key (without the namespace prefix)
        key: String,
    },

    /// Remove expired and unreadable entries
    Cleanup {
        /// Evict the oldest half regardless of age
        #[arg(long)]
        force: bool,
    },

    /// Remove every entry in the namespace
    Clear,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,

    /// Validate a configuration file
    Check {
        /// File to validate
        path: PathBuf,
    },
}

fn load_config(cli: &Cli) -> Result<Config> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(&Config::default_path())?,
    };
    Ok(config)
}

fn setup_logging(cli: &Cli, config: &Config) -> Result<()> {
    let mut log: LogConfig = config.logging.clone();
    if let Some(level) = &cli.log_level {
        log.level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        log.format = format;
    }
    init_logging(&log).context("failed to initialize logging")?;
    Ok(())
}

fn open_cache(store_path: &Path, config: &Config) -> Result<TtlCache> {
    let store = FileStore::open(store_path)?.with_quota(config.cache.quota_bytes);
    debug!(path = %store_path.display(), quota_bytes = config.cache.quota_bytes, "Cache store opened");
    Ok(TtlCache::new(
        Arc::new(store),
        Arc::new(SystemClock),
        config.cache.prefix.clone(),
        config.cache.ttl(),
    ))
}

fn format_timestamp(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map_or_else(
            || "-".to_string(),
            |t| t.format("%Y-%m-%d %H:%M:%S").to_string(),
        )
}

fn format_age(ms: u64) -> String {
    let secs = ms / 1000;
    match secs {
        0..60 => format!("{secs}s"),
        60..3_600 => format!("{}m", secs / 60),
        3_600..86_400 => format!("{}h{}m", secs / 3_600, (secs % 3_600) / 60),
        _ => format!("{}d{}h", secs / 86_400, (secs % 86_400) / 3_600),
    }
}

fn run_cache(command: &CacheCommands, store_path: &Path, config: &Config) -> Result<()> {
    let cache = open_cache(store_path, config)?;
    match command {
        CacheCommands::Stats { json } => {
            let stats = cache.stats();
            if *json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("store:   {}", store_path.display());
                println!("entries: {}", stats.entries);
                println!("expired: {}", stats.expired);
                println!("corrupt: {}", stats.corrupt);
                println!("bytes:   {}", stats.bytes);
            }
        }
        CacheCommands::List => {
            let entries = cache.entries();
            if entries.is_empty() {
                println!("cache is empty");
                return Ok(());
            }
            let now = SystemClock.now_ms();
            println!("{:<40} {:<20} {:>8} {:>8}  STATUS", "KEY", "STORED", "AGE", "BYTES");
            for entry in entries {
                let (stored, age) = entry.stored_at.map_or_else(
                    || ("-".to_string(), "-".to_string()),
                    |at| (format_timestamp(at), format_age(now.saturating_sub(at))),
                );
                let status = match (entry.stored_at, entry.expired) {
                    (None, _) => "corrupt",
                    (Some(_), true) => "expired",
                    (Some(_), false) => "valid",
                };
                println!(
                    "{:<40} {:<20} {:>8} {:>8}  {status}",
                    entry.key, stored, age, entry.bytes
                );
            }
        }
        CacheCommands::Get { key } => match cache.get(key) {
            Some(data) => println!("{}", serde_json::to_string_pretty(&data)?),
            None => bail!("no valid cache entry for {key}"),
        },
        CacheCommands::Cleanup { force } => {
            let removed = cache.cleanup(*force);
            println!("removed {removed} entries");
        }
        CacheCommands::Clear => {
            let removed = cache.clear();
            println!("cleared {removed} entries");
        }
    }
    Ok(())
}

fn run_config(command: &ConfigCommands, config: &Config) -> Result<()> {
    match command {
        ConfigCommands::Show => print!("{}", config.to_toml_string()?),
        ConfigCommands::Check { path } => {
            Config::load(path)?;
            println!("{}: ok", path.display());
        }
    }
    Ok(())
}

fn remediation_for(err: &anyhow::Error) -> Option<Remediation> {
    if let Some(err) = err.downcast_ref::<embellish_core::Error>() {
        return err.remediation();
    }
    if let Some(err) = err.downcast_ref::<ConfigError>() {
        return Some(err.remediation());
    }
    err.downcast_ref::<StoreError>().map(StoreError::remediation)
}

async fn run(cli: Cli) -> Result<()> {
    // `config check` must work even when the default config is broken.
    let config = match &cli.command {
        Commands::Config(ConfigCommands::Check { .. }) => Config::default(),
        _ => load_config(&cli)?,
    };
    setup_logging(&cli, &config)?;

    match &cli.command {
        Commands::Cache(command) => {
            let store_path = cli.store.clone().unwrap_or_else(FileStore::default_path);
            run_cache(command, &store_path, &config)
        }
        Commands::Config(command) => run_config(command, &config),
        Commands::Simulate => {
            print!("{}", simulate::run(config).await?);
            Ok(())
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            if let Some(remediation) = remediation_for(&err) {
                eprint!("\n{}", remediation.render_plain());
            }
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "embellish",
            "cache",
            "cleanup",
            "--force",
            "--store",
            "/tmp/x.json",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.store, Some(PathBuf::from("/tmp/x.json")));
        assert_eq!(cli.log_format, Some(LogFormat::Json));
        assert!(matches!(
            cli.command,
            Commands::Cache(CacheCommands::Cleanup { force: true })
        ));
    }

    #[test]
    fn ages_are_compact() {
        assert_eq!(format_age(5_000), "5s");
        assert_eq!(format_age(125_000), "2m");
        assert_eq!(format_age(3_660_000), "1h1m");
        assert_eq!(format_age(90_000_000), "1d1h");
    }

    #[test]
    fn timestamps_render_in_utc() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00");
    }

    #[test]
    fn opened_cache_enforces_configured_quota() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.cache.quota_bytes = 8;
        let cache = open_cache(&dir.path().join("cache.json"), &config).unwrap();
        let outcome = cache.set("k", &serde_json::json!("too large"));
        assert_eq!(outcome, embellish_core::cache::WriteOutcome::Dropped);
        assert!(!dir.path().join("cache.json").exists());
    }

    #[test]
    fn config_errors_carry_remediation() {
        let err: anyhow::Error = ConfigError::Parse("bad".into()).into();
        let text = remediation_for(&err).unwrap().render_plain();
        assert!(text.contains("embellish config check"));
    }
}
