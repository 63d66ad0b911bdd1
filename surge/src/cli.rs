use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use surge_core::ExecutionMode;

/// Same forms as the scenario file: humantime (`10s`, `250ms`, `1m 30s`) or a bare
/// number of seconds (`10`, `1.5`).
fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("duration cannot be empty (expected e.g. 10s, 250ms, 1m)".to_string());
    }

    if let Ok(secs) = s.parse::<f64>() {
        return Duration::try_from_secs_f64(secs)
            .map_err(|_| format!("invalid duration '{s}' (must be a finite, non-negative number)"));
    }

    humantime::parse_duration(s)
        .map_err(|err| format!("invalid duration '{s}' ({err}; expected e.g. 10s, 250ms, 1m)"))
}

fn parse_mode(input: &str) -> Result<ExecutionMode, String> {
    ExecutionMode::parse(input).map_err(|err| err.to_string())
}

fn parse_workers(input: &str) -> Result<usize, String> {
    match input.trim().parse::<usize>() {
        Ok(0) | Err(_) => Err(format!("invalid worker count '{input}' (expected a positive integer)")),
        Ok(n) => Ok(n),
    }
}

/// `Name: value` (curl style). The value may be empty; the name may not.
pub(crate) fn parse_header(input: &str) -> Result<(String, String), String> {
    let (name, value) = input
        .split_once(':')
        .ok_or_else(|| format!("invalid header '{input}' (expected 'Name: value')"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("invalid header '{input}' (empty name)"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable progress and summary.
    HumanReadable,
    /// Emit JSON progress lines (NDJSON) to stdout.
    Json,
}

impl From<OutputFormat> for surge_core::ReportFormat {
    fn from(value: OutputFormat) -> Self {
        match value {
            OutputFormat::HumanReadable => Self::Human,
            OutputFormat::Json => Self::Json,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "surge",
    author,
    version,
    about = "Closed-loop HTTP load generator",
    long_about = "surge fires weighted JSON POST requests at a service for a fixed duration.\n\nThe number of requests in flight adapts to the completion rate observed in the last reporting period, with a floor of ten per worker. Progress is printed every second and appended to a CSV time series.",
    after_help = "Examples:\n  surge run scenario.yaml\n  surge run scenario.yaml --duration 30s --mode multi-process\n  surge run scenario.yaml --base-url http://localhost:8080 --header 'Authorization: Bearer x'\n  surge run scenario.yaml --output json --results out/results.csv"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a load test scenario
    #[command(
        long_about = "Run the targets described by a scenario YAML file.\n\nCLI flags override values from the scenario file."
    )]
    Run(RunArgs),

    /// Serve jobs over stdin/stdout for a parent `surge run --mode multi-process`
    #[command(hide = true)]
    Worker,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Path to the scenario (.yaml)
    pub scenario: PathBuf,

    /// Base URL every target path is appended to
    #[arg(long, env = "SURGE_BASE_URL")]
    pub base_url: Option<String>,

    /// Test duration (e.g. 10s, 250ms, 1m)
    #[arg(long, value_parser = parse_duration)]
    pub duration: Option<Duration>,

    /// Worker isolation: threaded or multi-process
    #[arg(long, value_parser = parse_mode)]
    pub mode: Option<ExecutionMode>,

    /// Number of workers (default: 2 * cores + 1)
    #[arg(long, value_parser = parse_workers)]
    pub workers: Option<usize>,

    /// Value of the `testid` query parameter sent with every request
    #[arg(long)]
    pub test_id: Option<String>,

    /// Extra request header (repeatable, 'Name: value')
    #[arg(long = "header", short = 'H', value_name = "NAME: VALUE", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Per-request timeout
    #[arg(long, value_parser = parse_duration, default_value = "30s")]
    pub request_timeout: Duration,

    /// How long to wait for each outstanding request once the duration is over
    #[arg(long, value_parser = parse_duration, default_value = "30s")]
    pub flush_timeout: Duration,

    /// CSV time series output path
    #[arg(long, default_value = "results.csv")]
    pub results: PathBuf,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::HumanReadable)]
    pub output: OutputFormat,
}
