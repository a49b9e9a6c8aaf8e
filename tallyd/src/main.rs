use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tally_slice::SeriesFile;
use tallyd::ReplayOptions;
use tracing::info;

/// Tally rollup engine command-line interface.
#[derive(Parser)]
#[command(name = "tallyd", author, version, about = "Tally rollup CLI", long_about = None)]
struct Cli {
    #[command(flatten)]
    opts: Options,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct Options {
    /// Write JSON logs to hourly files in this directory instead of stderr.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Log level for file logging.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Serve Prometheus metrics on this address (e.g. 127.0.0.1:9898).
    #[arg(long, global = true)]
    metrics_addr: Option<String>,

    /// Require `user:password` basic auth on the metrics endpoint.
    #[arg(long, global = true)]
    metrics_auth: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run health check and exit.
    HealthCheck,

    /// Validate a series config file.
    CheckConfig {
        /// Series YAML file.
        #[arg(long)]
        config: PathBuf,
    },

    /// Ingest a JSONL sample file into a fresh store and print a query as JSON.
    Replay {
        /// Series YAML file.
        #[arg(long)]
        config: PathBuf,
        /// JSONL samples: {"series", "key", "value", "at"} per line.
        #[arg(long)]
        samples: PathBuf,
        /// Compact every series before querying.
        #[arg(long)]
        compact: bool,
        /// Series to query.
        #[arg(long, default_value = "shares")]
        series: String,
        /// Query the last N seconds.
        #[arg(long)]
        lower_secs: Option<i64>,
        /// Read this level instead of planning one.
        #[arg(long)]
        level: Option<usize>,
        /// Merge finer levels into the chosen one.
        #[arg(long)]
        cross_level: bool,
        /// Clock reading in epoch seconds (default: newest sample).
        #[arg(long)]
        now: Option<i64>,
    },

    /// Print the level the planner reads for a range.
    Plan {
        /// Series YAML file.
        #[arg(long)]
        config: PathBuf,
        /// Series name.
        #[arg(long)]
        series: String,
        /// Range starts this many seconds before now; omit for an open range.
        #[arg(long)]
        lower_secs: Option<i64>,
        /// Clock reading in epoch seconds (default: 0).
        #[arg(long, default_value_t = 0)]
        now: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = match &cli.opts.log_dir {
        Some(dir) => {
            let level = tally_log::parse_level(&cli.opts.log_level)?;
            let (_handle, guard) = tally_log::init(dir, level)?;
            Some(guard)
        }
        None => {
            tally_log::init_stdout()?;
            None
        }
    };

    if let Some(addr) = &cli.opts.metrics_addr {
        let auth = match &cli.opts.metrics_auth {
            Some(pair) => match pair.split_once(':') {
                Some((user, pass)) => Some((user.to_string(), pass.to_string())),
                None => bail!("--metrics-auth expects user:password"),
            },
            None => None,
        };
        tally_metrics::serve(addr, auth).await?;
    }

    match cli.command {
        Some(Commands::HealthCheck) => {
            if tallyd::health_check() {
                println!("OK");
            } else {
                println!("FAILED");
            }
        }
        Some(Commands::CheckConfig { config }) => {
            let file = SeriesFile::load(&config).with_context(|| format!("loading {}", config.display()))?;
            let registry = file.registry()?;
            for name in registry.names() {
                let kind = registry.get(name)?;
                println!("{name}: {} levels, keys [{}]", kind.levels().len(), kind.key_fields().join(", "));
            }
        }
        Some(Commands::Replay {
            config,
            samples,
            compact,
            series,
            lower_secs,
            level,
            cross_level,
            now,
        }) => {
            let file = SeriesFile::load(&config).with_context(|| format!("loading {}", config.display()))?;
            let reader = BufReader::new(File::open(&samples).with_context(|| format!("opening {}", samples.display()))?);
            let samples = tallyd::parse_samples(reader)?;
            info!(count = samples.len(), "samples loaded");
            let opts = ReplayOptions {
                series,
                compact,
                lower_secs,
                level,
                cross_level,
                now,
            };
            let report = tallyd::replay(&file, &samples, &opts).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Some(Commands::Plan {
            config,
            series,
            lower_secs,
            now,
        }) => {
            let file = SeriesFile::load(&config).with_context(|| format!("loading {}", config.display()))?;
            println!("{}", tallyd::plan(&file, &series, lower_secs, now)?);
        }
        None => {
            Cli::command().print_help()?;
        }
    }
    Ok(())
}
