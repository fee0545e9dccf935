use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tabtime_cli::commands::{clear, report, run, status, stopwatch, timer};
use tabtime_cli::{Cli, Commands, Config};
use tabtime_db::SqliteStore;

/// Load config and open the store, ensuring the parent directory exists.
fn open_store(config_path: Option<&Path>) -> Result<(SqliteStore, Config)> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }

    let store = SqliteStore::open(&config.database_path).context("failed to open database")?;
    Ok((store, config))
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing with verbose flag support. Stdout carries command
    // output (and the `run` protocol), so logs go to stderr.
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    // `run` writes through tokio's stdout; never hold the std lock across it.
    match &cli.command {
        Some(Commands::Run) => {
            let (store, config) = open_store(cli.config.as_deref())?;
            runtime()?.block_on(run::run(&config, Arc::new(store)))?;
        }
        Some(Commands::Report { json }) => {
            let (store, _config) = open_store(cli.config.as_deref())?;
            report::run(&mut io::stdout().lock(), &store, *json)?;
        }
        Some(Commands::Clear) => {
            let (store, _config) = open_store(cli.config.as_deref())?;
            clear::run(&mut io::stdout().lock(), &store)?;
        }
        Some(Commands::Status) => {
            let (store, config) = open_store(cli.config.as_deref())?;
            status::run(&mut io::stdout().lock(), &store, &config)?;
        }
        Some(Commands::Timer(action)) => {
            let (store, _config) = open_store(cli.config.as_deref())?;
            runtime()?.block_on(timer::run(
                &mut io::stdout().lock(),
                &store,
                *action,
                Utc::now(),
            ))?;
        }
        Some(Commands::Stopwatch(action)) => {
            let (store, _config) = open_store(cli.config.as_deref())?;
            runtime()?.block_on(stopwatch::run(
                &mut io::stdout().lock(),
                &store,
                *action,
                Utc::now(),
            ))?;
        }
        None => {
            // No subcommand, show help
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
        }
    }

    Ok(())
}
