#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use mecombo::config::{MegateConfig, ProjectConfig};
use mecombo::execute::{run_combos, ProcessScorer, RunOptions};
use mecombo::megate::{write_selection, Megate};
use mecombo::prepare::prepare_combos;
use mecombo::store::{ComboStore, FloatFormat};

#[derive(Parser)]
#[command(name = "mecombo", version, about = "E-model / morphology combination scoring")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the combination table and store it
    Prepare {
        #[arg(long)]
        config: PathBuf,
        /// Overrides scores_db from the config
        #[arg(long)]
        db: Option<PathBuf>,
        /// Replace an existing table
        #[arg(long)]
        replace: bool,
    },
    /// Score every pending combination with the configured scorer
    Run {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        db: Option<PathBuf>,
        /// Maximum scorer processes in flight
        #[arg(long)]
        parallel: Option<usize>,
        /// Kill a scorer process after this many seconds
        #[arg(long)]
        timeout_secs: Option<f64>,
    },
    /// Apply MEGate thresholds and write the accepted combinations
    Select {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Write the per-e-model summary as JSON
        #[arg(long)]
        summary: Option<PathBuf>,
    },
    /// Show row counts of a store
    Status {
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Export the combination table to JSONL
    Export {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Prepare {
            config,
            db,
            replace,
        } => {
            let config = ProjectConfig::from_path(&config)?;
            let path = db.unwrap_or_else(|| config.scores_db());
            let store = ComboStore::open(path, config.float_format)?;
            let summary = prepare_combos(&config, &store, replace).await?;
            println!(
                "prepared {} combinations ({} exemplar rows, {} e-models) in {}",
                summary.rows,
                summary.exemplars,
                summary.emodels,
                store.path().display()
            );
        }
        Commands::Run {
            config,
            db,
            parallel,
            timeout_secs,
        } => {
            let config = ProjectConfig::from_path(&config)?;
            let scorer_config = config
                .scorer
                .clone()
                .ok_or("run requires a `scorer` section in the config")?;
            if matches!(parallel, Some(0)) {
                return Err("--parallel must be >= 1".into());
            }
            let timeout = match timeout_secs {
                Some(secs) if !(secs.is_finite() && secs > 0.0) => {
                    return Err("--timeout-secs must be positive".into());
                }
                Some(secs) => Some(std::time::Duration::from_secs_f64(secs)),
                None => scorer_config.timeout(),
            };
            let scorer = ProcessScorer::new(&scorer_config.program)
                .with_args(scorer_config.args.clone())
                .with_timeout(timeout);
            let options = RunOptions {
                parallel: parallel
                    .or(scorer_config.parallel)
                    .unwrap_or(RunOptions::default().parallel),
            };

            let path = db.unwrap_or_else(|| config.scores_db());
            let store = ComboStore::open_existing(path, config.float_format)?;
            let summary = run_combos(&store, Arc::new(scorer), &options).await?;
            println!(
                "scored {} combinations, {} failed ({} pending at start)",
                summary.scored, summary.failed, summary.pending
            );
        }
        Commands::Select {
            config,
            db,
            output_dir,
            summary,
        } => {
            let mut config = MegateConfig::from_path(&config)?;
            if let Some(dir) = output_dir {
                config.output_dir = dir;
            }
            let path = db.unwrap_or_else(|| config.scores_db());
            let store = ComboStore::open_existing(path, FloatFormat::default())?;
            let status = store.status().await?;
            if status.pending > 0 {
                warn!(
                    pending = status.pending,
                    total = status.total,
                    "combinations were never scored; they fail every gate"
                );
            }
            let rows = store.read_table().await?;

            let megate = Megate::new(&config)?;
            let mut selection = megate.select(&rows)?;
            let files = write_selection(&mut selection, &config)?;
            if let Some(path) = summary {
                let json = serde_json::to_string_pretty(&selection.summary)?;
                std::fs::write(path, json)?;
            }
            for outcome in &selection.summary.emodels {
                eprintln!(
                    "[select] {} {:?}: {} candidates, {} passed, {} selected",
                    outcome.emodel, outcome.status, outcome.candidates, outcome.passed, outcome.selected
                );
            }
            println!(
                "selected {} combinations -> {}",
                selection.accepted.len(),
                files.extneurondb.display()
            );
        }
        Commands::Status { db } => {
            let path = db.unwrap_or_else(ComboStore::default_path);
            let store = ComboStore::open_existing(path, FloatFormat::default())?;
            let status = store.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Export { db, out } => {
            let path = db.unwrap_or_else(ComboStore::default_path);
            let store = ComboStore::open_existing(path, FloatFormat::default())?;
            let rows = store.export_jsonl(&out).await?;
            println!("exported {rows} rows to {}", out.display());
        }
    }

    Ok(())
}
