//! MosaicDB CLI
//!
//! Command-line workloads for the MosaicDB transactional core.
//!
//! # Commands
//!
//! - `stress` - Run concurrent writers against an in-memory database
//! - `replicate` - Run replicated writers against a leader and a follower
//! - `scenarios` - Run the named end-to-end scenarios

mod commands;

use clap::{Parser, Subcommand};
use commands::OutputFormat;
use mosaic_testkit::StressConfig;
use tracing_subscriber::EnvFilter;

/// MosaicDB command-line tools.
#[derive(Parser)]
#[command(name = "mosaic")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(global = true, short, long, default_value = "text")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone, Debug)]
struct WorkloadArgs {
    /// Number of writer threads
    #[arg(short, long, default_value = "4")]
    threads: usize,

    /// Transactions per writer thread
    #[arg(long, default_value = "100")]
    transactions: usize,

    /// Documents inserted per transaction
    #[arg(long, default_value = "8")]
    inserts: usize,

    /// Fraction of transactions that abort
    #[arg(long, default_value = "0.1")]
    abort_ratio: f64,

    /// Commit intermediately after this many operations
    #[arg(long)]
    intermediate_commit_count: Option<usize>,

    /// Random seed
    #[arg(long, default_value = "24301")]
    seed: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Run concurrent writers against an in-memory database
    Stress {
        #[command(flatten)]
        workload: WorkloadArgs,
    },

    /// Run replicated writers against a leader and a follower
    Replicate {
        #[command(flatten)]
        workload: WorkloadArgs,

        /// Follower acknowledgements needed to commit a log entry
        #[arg(short, long, default_value = "1")]
        write_concern: usize,
    },

    /// Run the named end-to-end scenarios
    Scenarios {
        /// Run only this scenario
        #[arg(short, long)]
        name: Option<String>,

        /// List scenario names and exit
        #[arg(short, long)]
        list: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let format: OutputFormat = cli.format.parse()?;
    match cli.command {
        Commands::Stress { workload } => {
            let intermediate = workload.intermediate_commit_count;
            let config = StressConfig::try_from(workload)?;
            commands::stress::run(&config, intermediate, format)?;
        }
        Commands::Replicate {
            workload,
            write_concern,
        } => {
            let intermediate = workload.intermediate_commit_count;
            let config = StressConfig::try_from(workload)?;
            commands::replicate::run(&config, intermediate, write_concern, format)?;
        }
        Commands::Scenarios { name, list } => {
            commands::scenarios::run(name.as_deref(), list, format)?;
        }
        Commands::Version => {
            println!("MosaicDB CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("MosaicDB Core v{}", mosaic_core::VERSION);
        }
    }

    Ok(())
}

impl TryFrom<WorkloadArgs> for StressConfig {
    type Error = commands::CliError;

    fn try_from(args: WorkloadArgs) -> Result<Self, Self::Error> {
        if !(0.0..=1.0).contains(&args.abort_ratio) {
            return Err(commands::CliError::InvalidArgument(format!(
                "abort ratio must lie in [0, 1], got {}",
                args.abort_ratio
            )));
        }
        Ok(Self {
            threads: args.threads,
            transactions_per_thread: args.transactions,
            inserts_per_transaction: args.inserts,
            abort_ratio: args.abort_ratio,
            seed: args.seed,
            ..Self::default()
        })
    }
}
