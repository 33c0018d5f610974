//! labelwise CLI - label JSONL records with a judge ensemble

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use labelwise_core::config::config_schema;
use labelwise_core::{LabelingConfig, Record};
use labelwise_runtime::{BackendRegistry, BatchSummary, Orchestrator};

#[derive(Parser)]
#[command(name = "labelwise")]
#[command(author, version, about = "Label conversation turns with an ensemble of LLM judges", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Label records from a JSONL file
    Label {
        /// Labeling configuration (YAML, or JSON with a .json extension)
        #[arg(short, long)]
        config: PathBuf,

        /// Input records as JSONL ("-" reads stdin)
        #[arg(short, long, default_value = "-")]
        input: String,

        /// Output file for labeled/failed records as JSONL (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write the batch summary as JSON to this file
        #[arg(long)]
        summary: Option<PathBuf>,
    },

    /// Validate a configuration without calling any backend
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print the configuration JSON Schema
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("labelwise=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Label {
            config,
            input,
            output,
            summary,
        } => cmd_label(&config, &input, output.as_deref(), summary.as_deref()).await,
        Commands::Validate { config } => cmd_validate(&config),
        Commands::Schema => {
            println!("{}", config_schema());
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<LabelingConfig> {
    LabelingConfig::from_file(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

fn read_records(input: &str) -> Result<(Vec<Record>, usize)> {
    let reader: Box<dyn Read> = if input == "-" {
        Box::new(io::stdin())
    } else {
        Box::new(File::open(input).with_context(|| format!("failed to open {}", input))?)
    };
    parse_records(BufReader::new(reader))
}

/// Parse JSONL records, skipping lines that are not valid records.
///
/// Returns the records and the number of skipped lines. Read errors abort.
fn parse_records<R: BufRead>(reader: R) -> Result<(Vec<Record>, usize)> {
    let mut records = Vec::new();
    let mut skipped = 0;
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read line {}", index + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Record>(&line) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(line = index + 1, error = %e, "Skipping malformed record");
                skipped += 1;
            }
        }
    }
    Ok((records, skipped))
}

async fn cmd_label(
    config_path: &Path,
    input: &str,
    output: Option<&Path>,
    summary_path: Option<&Path>,
) -> Result<()> {
    let config = load_config(config_path)?;
    let registry = BackendRegistry::with_defaults();
    let orchestrator = Orchestrator::from_config(&config, &registry)
        .context("failed to build the labeling pipeline")?;

    let (records, skipped) = read_records(input)?;
    info!(records = records.len(), skipped, "Loaded records");

    let mut out: Box<dyn Write> = match output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };

    let mut summary = BatchSummary::begin();
    let mut outcomes = std::pin::pin!(orchestrator.label_stream(stream::iter(records)));
    while let Some(outcome) = outcomes.next().await {
        summary.observe(&outcome);
        serde_json::to_writer(&mut out, &outcome)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    orchestrator.finish(&mut summary);

    info!(
        total = summary.total,
        labeled = summary.labeled,
        failed = summary.failed_total(),
        reasoning_required = summary.labels.reasoning_required,
        non_reasoning_sufficient = summary.labels.non_reasoning_sufficient,
        agreement_rate = summary.agreement_rate(),
        mean_confidence = summary.mean_confidence(),
        mean_soft_label = summary.mean_soft_label(),
        duration_seconds = summary.duration_seconds(),
        records_per_second = summary.records_per_second(),
        skipped_lines = skipped,
        requests = summary.usage.total.requests,
        tokens = summary.usage.total.total_tokens(),
        "Labeling complete"
    );
    for backend in &summary.unhealthy_backends {
        warn!(backend = %backend, "Backend unhealthy at end of run");
    }

    if let Some(path) = summary_path {
        let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &summary)?;
    }

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let registry = BackendRegistry::with_defaults();

    for judge in &config.judges {
        registry
            .validate(&judge.backend.provider, &judge.backend.settings_value())
            .with_context(|| format!("judge '{}' has an invalid backend", judge.id))?;
    }

    println!(
        "Configuration OK: {} judge(s), policy {}",
        config.judges.len(),
        config.policy
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_parse_records_skips_malformed_lines() {
        let input = concat!(
            "{\"id\": \"r1\", \"text\": \"What is 2+2?\"}\n",
            "{\"id\": \"r2\", \"text\": \n",
            "\n",
            "[1, 2, 3]\n",
            "{\"id\": \"r3\", \"text\": \"Prove Fermat's last theorem.\"}\n",
        );

        let (records, skipped) = parse_records(Cursor::new(input)).unwrap();
        assert_eq!(skipped, 2);
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["r1", "r3"]);
    }

    #[test]
    fn test_parse_records_empty_input() {
        let (records, skipped) = parse_records(Cursor::new("")).unwrap();
        assert!(records.is_empty());
        assert_eq!(skipped, 0);
    }
}
