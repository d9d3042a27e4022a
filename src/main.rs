use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use spam_pipeline::config::PipelineConfig;
use spam_pipeline::pipeline::SpamReport;
use spam_pipeline::services::{Fixture, InMemoryServices, Services};

/// Fallback limits for the demo binary when the environment sets none.
const DEMO_MAX_USERS_BATCH: usize = 2;
const DEMO_MAX_CLASSIFY_REQUESTS: usize = 5;
const DEMO_MAX_LOOKUPS: usize = 16;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config()?;

    let fixture_path = std::env::var("SPAM_PIPELINE_FIXTURE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            eprintln!("Error: SPAM_PIPELINE_FIXTURE not set");
            eprintln!("  export SPAM_PIPELINE_FIXTURE=./fixture.json");
            std::process::exit(1);
        });
    let fixture = Fixture::load(&fixture_path)
        .with_context(|| format!("loading fixture {}", fixture_path.display()))?;

    let backend = Arc::new(InMemoryServices::new(fixture).with_limits(&config));
    let report = SpamReport::new(Services::from_backend(backend), config);

    let mut addresses: Vec<String> = std::env::args().skip(1).collect();
    if addresses.is_empty() {
        addresses = std::io::stdin()
            .lock()
            .lines()
            .map(|line| line.map(|l| l.trim().to_string()))
            .filter(|line| !matches!(line, Ok(l) if l.is_empty()))
            .collect::<Result<_, _>>()
            .context("reading addresses from stdin")?;
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling pipeline");
            ctrl_c.cancel();
        }
    });

    let summary = report.run(addresses, cancel).await?;
    tracing::info!(run_id = %summary.run_id, lines = summary.output.len(), "Report ready");
    for stage in &summary.stages {
        tracing::debug!(
            stage = stage.stage,
            emitted = stage.emitted,
            elapsed_ms = stage.elapsed.as_millis() as u64,
            "Stage summary"
        );
    }
    for line in summary.output {
        println!("{line}");
    }

    Ok(())
}

/// Limits from the environment, or the demo limits when none are set.
fn load_config() -> spam_pipeline::error::Result<PipelineConfig> {
    let demo = PipelineConfig::new(
        DEMO_MAX_USERS_BATCH,
        DEMO_MAX_CLASSIFY_REQUESTS,
        DEMO_MAX_LOOKUPS,
    )?;
    Ok(PipelineConfig::from_env_or(demo)?)
}
