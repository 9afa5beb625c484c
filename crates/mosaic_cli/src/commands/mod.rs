//! CLI command implementations.

pub mod replicate;
pub mod scenarios;
pub mod stress;

use mosaic_core::Config;
use mosaic_testkit::test_config;
use serde::Serialize;
use std::str::FromStr;
use thiserror::Error;

/// Errors reported by the CLI itself.
#[derive(Debug, Error)]
pub enum CliError {
    /// `--format` named an unknown format.
    #[error("unknown output format '{0}', expected text or json")]
    UnknownFormat(String),

    /// A workload argument is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A workload finished with inconsistent results.
    #[error("{0}")]
    Failed(String),
}

/// How results are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text.
    Text,
    /// Pretty JSON.
    Json,
}

impl FromStr for OutputFormat {
    type Err = CliError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(CliError::UnknownFormat(other.to_string())),
        }
    }
}

/// Prints `value` as JSON.
pub fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Database configuration for workloads.
pub fn workload_config(intermediate_commit_count: Option<usize>) -> Config {
    match intermediate_commit_count {
        Some(count) => test_config().intermediate_commit_count(count),
        None => test_config(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_formats() {
        assert_eq!("text".parse::<OutputFormat>().unwrap(), OutputFormat::Text);
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!(matches!(
            "yaml".parse::<OutputFormat>(),
            Err(CliError::UnknownFormat(f)) if f == "yaml"
        ));
    }

    #[test]
    fn intermediate_commit_override() {
        assert_eq!(workload_config(Some(7)).intermediate_commit_count, 7);
        assert_eq!(
            workload_config(None).intermediate_commit_count,
            Config::default().intermediate_commit_count
        );
    }
}
