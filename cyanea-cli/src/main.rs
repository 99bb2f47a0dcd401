mod render;
mod utils;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use clap::{ArgAction, Parser};
use cyanea_core::{Config, PluginLoader, Run};
use owo_colors::{OwoColorize, Stream};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::utils::tui;

#[derive(Parser)]
#[command(name = "cyanea", version)]
#[command(about = "Sync a canonical list of events to every configured sink")]
struct Cli {
    /// Run config (JSON, or TOML if the file ends in .toml)
    #[arg(short, long)]
    config: PathBuf,

    /// Change to this directory before anything else
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Run as if it were this instant (RFC 3339, or epoch milliseconds)
    #[arg(long, value_parser = parse_now)]
    now: Option<DateTime<Utc>>,

    /// Also look for external plugins here
    #[arg(long = "plugin-dir")]
    plugin_dirs: Vec<PathBuf>,

    #[arg(long)]
    no_color: bool,

    /// -v for info logs, -vv for debug logs
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);
    if cli.no_color {
        owo_colors::set_override(false);
    }

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!(
                "{} {:#}",
                "error:".if_supports_color(Stream::Stderr, |t| t.red()),
                e
            );
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<bool> {
    if let Some(dir) = &cli.cwd {
        std::env::set_current_dir(dir)
            .with_context(|| format!("Failed to change directory to {}", dir.display()))?;
    }

    let config = Config::load(&cli.config)?;
    let loader = plugin_loader(&cli.plugin_dirs);
    let now = cli.now.unwrap_or_else(Utc::now);
    info!(
        config = %cli.config.display(),
        sinks = config.sinks.len(),
        now = %now,
        "starting sync"
    );

    let spinner = (cli.verbose == 0).then(|| {
        tui::create_spinner(format!(
            "Syncing to {}",
            render::count(config.sinks.len(), "sink")
        ))
    });

    let result = Run::new(now).execute(&config, &loader).await;

    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }

    match result {
        Ok(summary) => {
            println!("{}", render::summary(&summary));
            Ok(true)
        }
        Err(e) => {
            eprintln!("{}", render::failure(&e));
            Ok(false)
        }
    }
}

/// Log level used when `RUST_LOG` is unset.
fn default_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

fn init_logging(verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level(verbose)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Bundled plugins, plus external ones from `--plugin-dir`, the user's
/// config directory and `PATH`, in that order.
fn plugin_loader(extra_dirs: &[PathBuf]) -> PluginLoader {
    let mut loader = cyanea_plugins::builtin_loader();
    for dir in extra_dirs {
        loader = loader.with_search_dir(dir.clone());
    }
    if let Some(config_dir) = dirs::config_dir() {
        loader = loader.with_search_dir(config_dir.join("cyanea").join("plugins"));
    }
    debug!(bundled = ?loader.builtin_names(), extra_dirs = ?extra_dirs, "plugin loader ready");
    loader
}

fn parse_now(value: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ms) = value.parse::<i64>() {
        return Utc
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| format!("{ms} is out of range"));
    }

    humantime::parse_rfc3339_weak(value)
        .map(DateTime::<Utc>::from)
        .map_err(|e| format!("expected RFC 3339 or epoch milliseconds: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_now_accepts_epoch_millis() {
        let now = parse_now("1700000000000").unwrap();

        assert_eq!(now.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_parse_now_accepts_rfc3339() {
        let now = parse_now("2023-11-14T22:13:20Z").unwrap();

        assert_eq!(now.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_parse_now_rejects_garbage() {
        assert!(parse_now("next tuesday").is_err());
    }

    #[test]
    fn test_cli_collects_repeated_plugin_dirs() {
        let cli = Cli::parse_from([
            "cyanea",
            "-c",
            "cyanea.json",
            "--plugin-dir",
            "a",
            "--plugin-dir",
            "b",
            "-vv",
        ]);

        assert_eq!(cli.plugin_dirs, vec![PathBuf::from("a"), PathBuf::from("b")]);
        assert_eq!(cli.verbose, 2);
        assert!(cli.now.is_none());
    }

    #[test]
    fn test_verbosity_raises_the_default_level() {
        assert_eq!(default_level(0), "warn");
        assert_eq!(default_level(1), "info");
        assert_eq!(default_level(2), "debug");
        assert_eq!(default_level(5), "debug");
    }

    #[test]
    fn test_config_is_required() {
        assert!(Cli::try_parse_from(["cyanea"]).is_err());
    }
}
