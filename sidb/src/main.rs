use std::fs;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sidb::script::ScriptRunner;
use sidb::Database;
use si_txn::TxnConfig;
use tokio::runtime::Runtime;
use tracing::Level;

/// sidb command-line interface.
#[derive(Parser)]
#[command(name = "sidb", author, version, about = "sidb transaction core CLI", long_about = None)]
struct Cli {
    /// YAML transaction config.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level written to stdout.
    #[arg(long, default_value = "warn")]
    log_level: Level,

    /// Print Prometheus metrics after the command.
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run health check and exit.
    HealthCheck,

    /// Execute a transaction script against a fresh in-memory database.
    Run {
        /// Script file, one command per line.
        script: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    si_log::init_stdout(cli.log_level)?;

    let config = match &cli.config {
        Some(path) => TxnConfig::load(path)?,
        None => TxnConfig::default(),
    };

    // Start async runtime manually since main is sync.
    let rt = Runtime::new()?;
    match cli.command {
        Some(Commands::HealthCheck) => {
            let healthy = rt.block_on(async {
                let db = Database::open(config)?;
                let healthy = db.health_check().await;
                db.shutdown().await;
                Ok::<_, anyhow::Error>(healthy)
            })?;
            println!("{}", if healthy { "OK" } else { "FAILED" });
        }
        Some(Commands::Run { script }) => {
            let text = fs::read_to_string(&script)?;
            let lines = rt.block_on(async {
                let db = Database::open(config)?;
                let out = ScriptRunner::new(&db).run(&text).await;
                db.shutdown().await;
                out
            })?;
            for line in lines {
                println!("{line}");
            }
        }
        None => {
            // Clap will print help.
        }
    }

    if cli.metrics {
        print!("{}", si_metrics::render()?);
    }
    Ok(())
}
