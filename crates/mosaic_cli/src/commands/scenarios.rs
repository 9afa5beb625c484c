//! Scenarios command implementation.

use super::{print_json, CliError, OutputFormat};
use mosaic_testkit::scenarios::{run_all, run_named, SCENARIOS};

/// Runs the scenarios command.
pub fn run(name: Option<&str>, list: bool, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    if list {
        for (name, _) in SCENARIOS {
            println!("{name}");
        }
        return Ok(());
    }

    let outcomes = match name {
        Some(name) => vec![run_named(name)
            .ok_or_else(|| CliError::InvalidArgument(format!("no scenario named '{name}'")))?],
        None => run_all(),
    };

    match format {
        OutputFormat::Json => print_json(&outcomes)?,
        OutputFormat::Text => {
            for outcome in &outcomes {
                match &outcome.detail {
                    None => println!("✓ {}", outcome.name),
                    Some(detail) => println!("✗ {}: {}", outcome.name, detail),
                }
            }
        }
    }

    let failed = outcomes.iter().filter(|o| !o.passed).count();
    tracing::info!(total = outcomes.len(), failed, "scenarios finished");
    if failed > 0 {
        return Err(CliError::Failed(format!("{failed} scenario(s) failed")).into());
    }
    Ok(())
}
