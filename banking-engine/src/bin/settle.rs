//! Batch settlement runner
//!
//! Usage:
//!   settle --aggregates aggregates.json --date 2024-03-15 [--end 2024-03-20]
//!          [--client "Acme Textiles"] [--config banking.toml] [--recompute]
//!
//! Loads a JSON aggregate export, runs the settlement pipeline for the
//! requested scope and prints the batch report plus a validation pass.

use anyhow::{bail, Context};
use banking_engine::{
    aggregation::StaticAggregationSource,
    metrics::Metrics,
    orchestrator::BankingOrchestrator,
    validator::ConservationValidator,
    Config,
};
use chrono::NaiveDate;
use settlement_store::{DateRange, SettlementStore};
use std::sync::Arc;

struct Args {
    config_path: Option<String>,
    aggregates_path: Option<String>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    client: Option<String>,
    recompute: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        config_path: None,
        aggregates_path: None,
        start: None,
        end: None,
        client: None,
        recompute: false,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => args.config_path = Some(expect_value(&mut iter, "--config")?),
            "--aggregates" => args.aggregates_path = Some(expect_value(&mut iter, "--aggregates")?),
            "--date" => {
                args.start = Some(parse_date(&expect_value(&mut iter, "--date")?)?);
            }
            "--end" => {
                args.end = Some(parse_date(&expect_value(&mut iter, "--end")?)?);
            }
            "--client" => args.client = Some(expect_value(&mut iter, "--client")?),
            "--recompute" => args.recompute = true,
            "--help" | "-h" => {
                println!(
                    "settle --aggregates FILE --date YYYY-MM-DD [--end YYYY-MM-DD] \
                     [--client NAME] [--config FILE] [--recompute]"
                );
                std::process::exit(0);
            }
            other => bail!("unknown argument: {}", other),
        }
    }

    Ok(args)
}

fn expect_value(iter: &mut impl Iterator<Item = String>, flag: &str) -> anyhow::Result<String> {
    iter.next()
        .with_context(|| format!("{} requires a value", flag))
}

fn parse_date(s: &str) -> anyhow::Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid date: {}", s))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = parse_args()?;

    let config = match &args.config_path {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    let start = args.start.context("--date is required")?;
    let range = DateRange::new(start, args.end.unwrap_or(start));

    let aggregates_path = args
        .aggregates_path
        .clone()
        .or_else(|| {
            config
                .aggregates_file
                .as_ref()
                .map(|p| p.display().to_string())
        })
        .context("--aggregates (or aggregates_file in config) is required")?;

    let source = Arc::new(StaticAggregationSource::from_file(&aggregates_path)?);
    tracing::info!(
        path = %aggregates_path,
        keys = source.len(),
        "Loaded aggregate export"
    );

    let store = Arc::new(SettlementStore::open(&config.store)?);
    let metrics = Metrics::new().context("failed to register metrics")?;
    let orchestrator = BankingOrchestrator::new(
        Arc::clone(&store),
        source,
        config.orchestrator.clone(),
    )
    .with_metrics(metrics);

    let report = orchestrator
        .run_batch(range, args.client.clone(), args.recompute)
        .await?;

    println!(
        "batch {}: {} settled, {} failed",
        report.batch_id,
        report.succeeded.len(),
        report.failed.len()
    );
    for (key, failure) in &report.failed {
        println!("  FAILED {} ({})", key, failure);
    }

    let validator = ConservationValidator::new();
    let validation = validator.check_scope(&store, Some(range), args.client.as_deref())?;
    if validation.findings.is_empty() {
        println!("validation: clean");
    } else {
        println!(
            "validation: {} errors, {} warnings",
            validation.error_count(),
            validation.warning_count()
        );
        for finding in &validation.findings {
            println!("  {}", finding);
        }
    }

    if !report.is_clean() || !validation.is_clean() {
        std::process::exit(1);
    }

    Ok(())
}
