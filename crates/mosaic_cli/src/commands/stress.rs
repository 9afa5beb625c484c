//! Stress command implementation.

use super::{print_json, workload_config, CliError, OutputFormat};
use mosaic_core::StatsSnapshot;
use mosaic_testkit::{run_local_stress, StressConfig, StressReport, TestDatabase, USERS};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct StressOutput {
    report: StressReport,
    folded_documents: u64,
    stats: StatsSnapshot,
}

/// Runs the stress command.
pub fn run(
    config: &StressConfig,
    intermediate_commit_count: Option<usize>,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = TestDatabase::with_config(workload_config(intermediate_commit_count));
    tracing::info!(
        threads = config.threads,
        transactions = config.transactions_per_thread,
        "starting local stress run"
    );

    let report = run_local_stress(&db, USERS, config)?;
    db.sync_metadata(true)?;
    let output = StressOutput {
        folded_documents: db.collection(USERS)?.document_count().number_documents(),
        stats: db.stats().snapshot(),
        report,
    };

    match format {
        OutputFormat::Json => print_json(&output)?,
        OutputFormat::Text => {
            output.report.print_summary("Local stress");
            println!("Folded count: {}", output.folded_documents);
            println!("Intermediate commits: {}", output.stats.intermediate_commits);
            println!("Conflicts: {}", output.stats.conflicts);
        }
    }

    if !output.report.is_consistent() || output.folded_documents != output.report.expected_documents {
        return Err(CliError::Failed(format!(
            "document count mismatch: expected {}, live {}, folded {}",
            output.report.expected_documents, output.report.counted_documents, output.folded_documents
        ))
        .into());
    }
    Ok(())
}
