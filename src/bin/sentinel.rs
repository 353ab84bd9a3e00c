//! Sentinel CLI - Command-line interface for Synheart Sentinel
//!
//! Commands:
//! - baseline: Compute per-user baselines from daily samples
//! - detect: Replay daily samples through the engine and report anomalies
//! - validate: Validate daily samples

use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use chrono::{DateTime, NaiveTime, Utc};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use synheart_sentinel::baseline::{BaselineCalculator, BaselineOutcome};
use synheart_sentinel::config::DetectionConfig;
use synheart_sentinel::pipeline::{DetectionEngine, DetectionReport};
use synheart_sentinel::store::{BaselineRepository, InMemoryStore};
use synheart_sentinel::types::{Anomaly, MetricSample, UserBaseline};
use synheart_sentinel::{EngineError, PRODUCER_NAME, SENTINEL_VERSION};

/// Sentinel - Baseline and anomaly detection for daily health metrics
#[derive(Parser)]
#[command(name = "sentinel")]
#[command(author = "Synheart AI Inc")]
#[command(version = SENTINEL_VERSION)]
#[command(about = "Detect deviations from personal health baselines", long_about = None)]
struct Cli {
    /// Detection configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Rolling baseline window in days (overrides config)
    #[arg(long, global = true)]
    baseline_days: Option<u32>,

    /// Minimum samples before a baseline is used (overrides config)
    #[arg(long, global = true)]
    min_baseline_days: Option<u32>,

    /// Z-score threshold in standard deviations (overrides config)
    #[arg(long, global = true)]
    threshold: Option<f64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute per-user baselines from daily samples
    Baseline {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Output format
        #[arg(long, default_value = "ndjson")]
        output_format: OutputFormat,
    },

    /// Replay daily samples in date order and report anomalies
    Detect {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Output format
        #[arg(long, default_value = "ndjson")]
        output_format: OutputFormat,

        /// Emit anomaly records instead of full daily reports
        #[arg(long)]
        anomalies_only: bool,

        /// Save final baselines to file after processing
        #[arg(long)]
        save_baselines: Option<PathBuf>,
    },

    /// Validate daily samples
    Validate {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Output validation report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, ValueEnum)]
enum InputFormat {
    /// Newline-delimited JSON (one sample per line)
    Ndjson,
    /// JSON array of samples
    Json,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Newline-delimited JSON (one record per line)
    Ndjson,
    /// JSON array of records
    Json,
    /// Pretty-printed JSON
    JsonPretty,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), SentinelCliError> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(days) = cli.baseline_days {
        config.baseline_window_days = days;
    }
    if let Some(days) = cli.min_baseline_days {
        config.min_baseline_days = days;
    }
    if let Some(threshold) = cli.threshold {
        config.threshold_std_dev = threshold;
    }
    config.validate()?;

    match cli.command {
        Commands::Baseline {
            input,
            output,
            input_format,
            output_format,
        } => cmd_baseline(&config, &input, &output, input_format, output_format),

        Commands::Detect {
            input,
            output,
            input_format,
            output_format,
            anomalies_only,
            save_baselines,
        } => cmd_detect(
            config,
            &input,
            &output,
            input_format,
            output_format,
            anomalies_only,
            save_baselines.as_deref(),
        ),

        Commands::Validate {
            input,
            input_format,
            json,
        } => cmd_validate(&input, input_format, json),
    }
}

fn load_config(path: Option<&Path>) -> Result<DetectionConfig, SentinelCliError> {
    match path {
        Some(path) => Ok(DetectionConfig::from_json(&fs::read_to_string(path)?)?),
        None => Ok(DetectionConfig::default()),
    }
}

fn cmd_baseline(
    config: &DetectionConfig,
    input: &Path,
    output: &Path,
    input_format: InputFormat,
    output_format: OutputFormat,
) -> Result<(), SentinelCliError> {
    let samples = read_samples(input, input_format)?;
    validate_all(&samples)?;

    let calculator = BaselineCalculator::from_config(config);
    let mut outcomes: Vec<UserBaselineOutcome> = Vec::new();

    for (user_id, mut history) in group_by_user(samples) {
        history.sort_by_key(|s| s.date);
        let start = history.len().saturating_sub(config.baseline_window_days as usize);
        let outcome = calculator.compute(&history[start..])?;
        info!(user_id = %user_id, ready = outcome.is_ready(), "Computed baseline");
        outcomes.push(UserBaselineOutcome { user_id, outcome });
    }

    write_output(output, &format_output(&outcomes, &output_format)?)
}

fn cmd_detect(
    config: DetectionConfig,
    input: &Path,
    output: &Path,
    input_format: InputFormat,
    output_format: OutputFormat,
    anomalies_only: bool,
    save_baselines: Option<&Path>,
) -> Result<(), SentinelCliError> {
    let mut samples = read_samples(input, input_format)?;
    validate_all(&samples)?;
    samples.sort_by(|a, b| a.user_id.cmp(&b.user_id).then(a.date.cmp(&b.date)));

    let engine = DetectionEngine::with_config(std::sync::Arc::new(InMemoryStore::new()), config)?;
    let mut reports: Vec<DetectionReport> = Vec::new();

    for sample in samples {
        // Each day is evaluated as if by its nightly run, before it joins the history
        let report = engine.process_day_at(&sample, None, nightly_run(&sample))?;
        engine.store().upsert_sample(sample);
        reports.push(report);
    }

    let output_data = if anomalies_only {
        let anomalies: Vec<&Anomaly> = reports
            .iter()
            .flat_map(|r| r.outcome.anomalies.iter())
            .collect();
        format_output(&anomalies, &output_format)?
    } else {
        format_output(&reports, &output_format)?
    };
    write_output(output, &output_data)?;

    if let Some(path) = save_baselines {
        let mut baselines: Vec<UserBaseline> = Vec::new();
        // reports are grouped by user, so dedup is enough
        let mut users: Vec<&str> = reports
            .iter()
            .filter_map(|r| r.baseline.as_ref().map(|b| b.user_id.as_str()))
            .collect();
        users.dedup();
        for user_id in users {
            if let Some(baseline) = engine.store().load(user_id)? {
                baselines.push(baseline);
            }
        }
        fs::write(path, serde_json::to_string_pretty(&baselines)?)?;
    }

    Ok(())
}

fn cmd_validate(input: &Path, input_format: InputFormat, json: bool) -> Result<(), SentinelCliError> {
    let samples = read_samples(input, input_format)?;

    let errors: Vec<ValidationErrorDetail> = samples
        .iter()
        .enumerate()
        .filter_map(|(index, sample)| {
            sample.validate().err().map(|e| ValidationErrorDetail {
                index,
                user_id: sample.user_id.clone(),
                date: sample.date.to_string(),
                error: e.to_string(),
            })
        })
        .collect();

    let report = ValidationReport {
        producer: PRODUCER_NAME.to_string(),
        total_samples: samples.len(),
        valid_samples: samples.len() - errors.len(),
        invalid_samples: errors.len(),
        errors,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Validation Report");
        println!("=================");
        println!("Total samples:   {}", report.total_samples);
        println!("Valid samples:   {}", report.valid_samples);
        println!("Invalid samples: {}", report.invalid_samples);

        if !report.errors.is_empty() {
            println!("\nErrors:");
            for err in &report.errors {
                println!(
                    "  - {} on {} (index {}): {}",
                    err.user_id, err.date, err.index, err.error
                );
            }
        }
    }

    if report.invalid_samples > 0 {
        Err(SentinelCliError::ValidationFailed(report.invalid_samples))
    } else {
        Ok(())
    }
}

// Helper functions

fn read_samples(input: &Path, format: InputFormat) -> Result<Vec<MetricSample>, SentinelCliError> {
    let input_data = if input.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        fs::read_to_string(input)?
    };

    let samples = match format {
        InputFormat::Json => serde_json::from_str(&input_data)?,
        InputFormat::Ndjson => input_data
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(number, line)| {
                serde_json::from_str::<MetricSample>(line).map_err(|e| {
                    SentinelCliError::ParseError(format!("line {}: {}", number + 1, e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?,
    };

    if samples.is_empty() {
        return Err(SentinelCliError::NoSamples);
    }
    Ok(samples)
}

fn validate_all(samples: &[MetricSample]) -> Result<(), SentinelCliError> {
    for sample in samples {
        sample.validate().map_err(EngineError::from)?;
    }
    Ok(())
}

fn group_by_user(samples: Vec<MetricSample>) -> BTreeMap<String, Vec<MetricSample>> {
    let mut grouped: BTreeMap<String, Vec<MetricSample>> = BTreeMap::new();
    for sample in samples {
        grouped.entry(sample.user_id.clone()).or_default().push(sample);
    }
    grouped
}

/// Timestamp of the nightly run that evaluates `sample`
fn nightly_run(sample: &MetricSample) -> DateTime<Utc> {
    sample.date.and_time(NaiveTime::MIN).and_utc()
}

fn format_output<T: serde::Serialize>(
    records: &[T],
    format: &OutputFormat,
) -> Result<String, SentinelCliError> {
    match format {
        OutputFormat::Ndjson => {
            let mut lines: Vec<String> = Vec::new();
            for record in records {
                lines.push(serde_json::to_string(record)?);
            }
            Ok(lines.join("\n") + "\n")
        }
        OutputFormat::Json => Ok(serde_json::to_string(records)?),
        OutputFormat::JsonPretty => Ok(serde_json::to_string_pretty(records)?),
    }
}

fn write_output(output: &Path, data: &str) -> Result<(), SentinelCliError> {
    if output.to_string_lossy() == "-" {
        print!("{}", data);
    } else {
        fs::write(output, data)?;
    }
    Ok(())
}

// Error handling

#[derive(Debug)]
enum SentinelCliError {
    Io(io::Error),
    Engine(EngineError),
    Json(serde_json::Error),
    NoSamples,
    ValidationFailed(usize),
    ParseError(String),
}

impl From<io::Error> for SentinelCliError {
    fn from(e: io::Error) -> Self {
        SentinelCliError::Io(e)
    }
}

impl From<EngineError> for SentinelCliError {
    fn from(e: EngineError) -> Self {
        SentinelCliError::Engine(e)
    }
}

impl From<serde_json::Error> for SentinelCliError {
    fn from(e: serde_json::Error) -> Self {
        SentinelCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<SentinelCliError> for CliError {
    fn from(e: SentinelCliError) -> Self {
        match e {
            SentinelCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            SentinelCliError::Engine(EngineError::InvalidSample(e)) => CliError {
                code: "VALIDATION_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Run 'sentinel validate' for details".to_string()),
            },
            SentinelCliError::Engine(EngineError::InvalidConfig(message)) => CliError {
                code: "CONFIG_ERROR".to_string(),
                message,
                hint: Some("Check the --config file".to_string()),
            },
            SentinelCliError::Engine(e) => CliError {
                code: "ENGINE_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            SentinelCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            SentinelCliError::NoSamples => CliError {
                code: "NO_SAMPLES".to_string(),
                message: "No samples found in input".to_string(),
                hint: Some("Ensure input file is not empty".to_string()),
            },
            SentinelCliError::ValidationFailed(count) => CliError {
                code: "VALIDATION_FAILED".to_string(),
                message: format!("{} samples failed validation", count),
                hint: Some("Fix validation errors and retry".to_string()),
            },
            SentinelCliError::ParseError(msg) => CliError {
                code: "PARSE_ERROR".to_string(),
                message: msg,
                hint: Some("Ensure each line is one daily sample".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct UserBaselineOutcome {
    user_id: String,
    outcome: BaselineOutcome,
}

#[derive(serde::Serialize)]
struct ValidationReport {
    producer: String,
    total_samples: usize,
    valid_samples: usize,
    invalid_samples: usize,
    errors: Vec<ValidationErrorDetail>,
}

#[derive(serde::Serialize)]
struct ValidationErrorDetail {
    index: usize,
    user_id: String,
    date: String,
    error: String,
}
