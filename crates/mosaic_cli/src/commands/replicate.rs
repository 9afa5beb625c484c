//! Replicate command implementation.

use super::{print_json, workload_config, CliError, OutputFormat};
use mosaic_replication::FollowerStats;
use mosaic_testkit::{run_replicated_stress, ReplicatedCluster, StressConfig, StressReport, USERS};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ReplicateOutput {
    report: StressReport,
    write_concern: usize,
    log_entries: u64,
    follower_committed: u64,
    follower_aborted: u64,
    follower_duplicates: u64,
    converged: bool,
}

/// Runs the replicate command.
pub fn run(
    config: &StressConfig,
    intermediate_commit_count: Option<usize>,
    write_concern: usize,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let cluster = ReplicatedCluster::with_config(write_concern, workload_config(intermediate_commit_count));
    tracing::info!(
        threads = config.threads,
        transactions = config.transactions_per_thread,
        write_concern,
        "starting replicated stress run"
    );

    let report = run_replicated_stress(&cluster, USERS, config)?;
    let FollowerStats {
        committed,
        aborted,
        duplicates,
        ..
    } = cluster.follower.stats();
    let output = ReplicateOutput {
        write_concern,
        log_entries: cluster.log.last_index().as_u64(),
        follower_committed: committed,
        follower_aborted: aborted,
        follower_duplicates: duplicates,
        converged: cluster.converged(USERS)?,
        report,
    };

    match format {
        OutputFormat::Json => print_json(&output)?,
        OutputFormat::Text => {
            output.report.print_summary("Replicated stress");
            println!("Log entries: {}", output.log_entries);
            println!(
                "Follower: {} committed, {} aborted, {} duplicate markers",
                output.follower_committed, output.follower_aborted, output.follower_duplicates
            );
            println!("Converged: {}", output.converged);
        }
    }

    if !output.converged || !output.report.is_consistent() {
        return Err(CliError::Failed("follower diverged from leader".to_string()).into());
    }
    Ok(())
}
