//! # bao-driver
//!
//! Command-line entry point of the rule configuration benchmark.
//!
//! ```text
//! bao-driver span queries/tpch/                      # record query spans
//! bao-driver record queries/tpch/ --repeats 5 --dot  # search configurations
//! bao-driver approximate queries/job/2c.sql --knobs knobs/presto.txt
//! ```
//!
//! Measurements are kept in a JSON snapshot (`--storage`) so interrupted runs can
//! resume; configurations measured before are skipped. Ctrl-C resets the engine
//! session, closes the callback listener and saves the snapshot before exiting.
//!
//! Logging is controlled by `RUST_LOG`; without it `--log-level` applies to the
//! `bao_*` crates.

use anyhow::{Context, Result};
use bao_core::search::{SearchConfig, MAX_DP_DEPTH};
use bao_core::storage::InMemoryStorage;
use bao_driver::approximate::approximate_query_span;
use bao_driver::orchestrator::{Mode, Orchestrator};
use bao_driver::queries::{discover, load_query};
use bao_driver::settings::{DriverSettings, DEFAULT_CALLBACK_ADDR};
use bao_presto::callback::CallbackChannel;
use bao_presto::client::{ClientSettings, PrestoClient};
use bao_presto::session::{ExportFlags, Session};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "bao-driver",
    version,
    about = "Benchmark Presto with optimizer rules selectively disabled"
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Presto coordinator URL
    #[arg(long, default_value = "http://localhost:8080", env = "BAO_PRESTO_URL")]
    presto_url: String,

    /// Presto catalog to query
    #[arg(long, default_value = "tpch", env = "BAO_CATALOG")]
    catalog: String,

    /// Schema to query
    #[arg(long, default_value = "tiny", env = "BAO_SCHEMA")]
    schema: String,

    #[arg(long, default_value = "admin", env = "BAO_USER")]
    user: String,

    /// Upper bound for a single query (Presto duration, e.g. 4m)
    #[arg(long, default_value = "4m")]
    execution_timeout: String,

    /// Address the engine pushes callbacks to
    #[arg(long, default_value = DEFAULT_CALLBACK_ADDR, env = "BAO_CALLBACK_ADDR")]
    callback_addr: SocketAddr,

    /// Seconds to wait for a single callback, 0 waits forever
    #[arg(long, default_value_t = 600)]
    callback_timeout: u64,

    /// Measurement snapshot, loaded at start and saved at exit
    #[arg(long, value_name = "FILE", default_value = "bao-storage.json", env = "BAO_STORAGE")]
    storage: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", env = "BAO_LOG_LEVEL")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record the query span of every query
    Span {
        /// Query file or directory of query files
        queries: PathBuf,
    },
    /// Search optimizer configurations and record execution times
    Record {
        /// Query file or directory of query files
        queries: PathBuf,

        /// Timed executions per configuration
        #[arg(long, default_value_t = 1)]
        repeats: usize,

        /// Export logical and fragmented plans as Graphviz
        #[arg(long)]
        dot: bool,

        /// Export logical and fragmented plans as JSON
        #[arg(long)]
        json: bool,

        /// Highest number of simultaneously disabled items
        #[arg(long, default_value_t = MAX_DP_DEPTH)]
        max_dp_depth: usize,

        /// Retries per execution while no worker nodes are available
        #[arg(long, default_value_t = 10)]
        max_transient_retries: usize,
    },
    /// Approximate the span of a query by disabling one optimizer at a time
    Approximate {
        query: PathBuf,

        /// File with one optimizer name per line
        #[arg(long, value_name = "FILE")]
        knobs: PathBuf,

        /// Also search for optimizers masked by the effective ones
        #[arg(long)]
        find_alternatives: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let client = PrestoClient::new(ClientSettings {
        base_url: args.presto_url.clone(),
        user: args.user.clone(),
        catalog: args.catalog.clone(),
        schema: args.schema.clone(),
        query_max_execution_time: Some(args.execution_timeout.clone()),
        ..ClientSettings::default()
    })
    .context("Failed to create Presto client")?;
    info!("connect to catalog:schema={}:{}", args.catalog, args.schema);

    match &args.command {
        Command::Span { queries } => {
            let settings = driver_settings(&args);
            run_benchmark(&args, client, settings, Mode::Span, queries).await
        }
        Command::Record {
            queries,
            repeats,
            dot,
            json,
            max_dp_depth,
            max_transient_retries,
        } => {
            let settings = DriverSettings {
                repeats: *repeats,
                max_transient_retries: *max_transient_retries,
                export: ExportFlags {
                    dot: *dot,
                    json: *json,
                },
                search: SearchConfig {
                    max_dp_depth: *max_dp_depth,
                },
                ..driver_settings(&args)
            };
            run_benchmark(&args, client, settings, Mode::Record, queries).await
        }
        Command::Approximate {
            query,
            knobs,
            find_alternatives,
        } => run_approximation(client, query, knobs, *find_alternatives).await,
    }
}

fn init_logging(args: &Args) {
    let level = &args.log_level;
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("bao_driver={level},bao_presto={level},bao_core={level}")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn driver_settings(args: &Args) -> DriverSettings {
    DriverSettings {
        callback_addr: args.callback_addr,
        callback_timeout: (args.callback_timeout > 0).then(|| Duration::from_secs(args.callback_timeout)),
        ..DriverSettings::default()
    }
}

fn query_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_dir() {
        Ok(discover(path)?)
    } else {
        Ok(vec![path.to_path_buf()])
    }
}

async fn run_benchmark(
    args: &Args,
    client: PrestoClient,
    settings: DriverSettings,
    mode: Mode,
    queries: &Path,
) -> Result<()> {
    let queries = query_files(queries)?;
    let storage = Arc::new(
        InMemoryStorage::load(&args.storage)
            .with_context(|| format!("Failed to load {}", args.storage.display()))?,
    );
    let channel = CallbackChannel::bind(settings.callback_addr, settings.callback_timeout)
        .with_context(|| format!("Failed to bind callback channel on {}", settings.callback_addr))?;
    let mut orchestrator = Orchestrator::new(Session::new(client, channel), storage.clone(), settings);
    orchestrator.prepare_session().await?;

    info!("{:?} run over {} queries", mode, queries.len());
    let outcome = tokio::select! {
        summary = orchestrator.run_queries(mode, &queries) => Some(summary),
        _ = tokio::signal::ctrl_c() => None,
    };
    match &outcome {
        Some(summary) => info!(
            "Finished: {} queries succeeded, {} failed",
            summary.succeeded,
            summary.failed.len()
        ),
        None => warn!("Interrupted, reset the session configuration"),
    }

    let session = orchestrator.session_mut();
    if let Err(e) = session.reset_configuration().await {
        warn!("Failed to reset the session configuration: {}", e);
    }
    session.shutdown();
    storage
        .save(&args.storage)
        .with_context(|| format!("Failed to save {}", args.storage.display()))?;
    Ok(())
}

async fn run_approximation(
    mut client: PrestoClient,
    query: &Path,
    knobs: &Path,
    find_alternatives: bool,
) -> Result<()> {
    let sql = load_query(query)?;
    let knobs: Vec<String> = std::fs::read_to_string(knobs)
        .with_context(|| format!("Failed to read {}", knobs.display()))?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect();

    let span = approximate_query_span(&mut client, &sql, &knobs, find_alternatives).await?;
    println!("{}", serde_json::to_string_pretty(&span)?);
    Ok(())
}
