#![allow(dead_code)]

mod app_config;
mod batching;
mod checkpoint;
mod client;
mod credentials;
mod dataset;
mod decoder;
mod error;
mod model;
mod orchestrator;
mod pacing;
mod prompt;
mod resolver;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use mimalloc::MiMalloc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use app_config::AppConfig;
use checkpoint::Checkpoint;
use client::{HttpChatBackend, InferenceClient};
use credentials::{CredentialPool, SystemClock};
use orchestrator::{Orchestrator, RunSettings};
use pacing::Pacer;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::Layer::default().with_ansi(false))
        .init();

    let cfg = AppConfig::load()?;
    if cfg.api.keys.is_empty() {
        anyhow::bail!("no credentials configured; set [api].keys in config.toml or the API_KEYS env var");
    }
    tracing::info!(
        credentials = cfg.api.keys.len(),
        model = %cfg.model.id,
        "stanceclerk starting"
    );

    let records = dataset::read_records(Path::new(&cfg.run.input_path))?;
    if records.is_empty() {
        tracing::warn!("no input records, nothing to do");
        return Ok(());
    }

    let http_client = reqwest::ClientBuilder::new()
        .use_rustls_tls()
        .timeout(Duration::from_secs(90))
        .build()?;

    let backend = HttpChatBackend::new(
        http_client,
        cfg.api.endpoint.clone(),
        cfg.model.id.clone(),
        cfg.model.temperature,
    );
    let pacer = Pacer::new(cfg.run.min_call_interval_ms, cfg.quotas.tokens_per_minute);
    let client = InferenceClient::new(backend, pacer, cfg.run.max_attempts);
    let pool = CredentialPool::new(cfg.api.keys.clone(), cfg.quotas, Arc::new(SystemClock));

    let stop = CancellationToken::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, will stop after the current batch");
                stop.cancel();
            }
        });
    }

    let run_tag = checkpoint::run_tag(&cfg.model.id);
    let checkpoint_path = PathBuf::from(&cfg.run.checkpoint_path);
    let checkpoint = Checkpoint::load(&checkpoint_path, &run_tag)?;

    let settings = RunSettings {
        batch_token_budget: cfg.run.batch_token_budget,
        checkpoint_every: cfg.run.checkpoint_every,
        checkpoint_path,
    };
    let mut orchestrator = Orchestrator::new(client, pool, settings, stop);

    let report = orchestrator.run(records, checkpoint).await?;

    dataset::write_results(Path::new(&cfg.run.output_path), &report.results)?;

    let summary = &report.summary;
    tracing::info!(
        total = summary.total,
        labeled = summary.labeled,
        resumed = summary.resumed,
        succeeded = summary.succeeded,
        refused = summary.refused,
        decode_failed = summary.decode_failed,
        ambiguous = summary.ambiguous,
        "run complete"
    );
    for (label, count) in dataset::label_distribution(&report.results) {
        let share = count as f64 / summary.labeled.max(1) as f64 * 100.0;
        tracing::info!("  {label}: {count} ({share:.1}%)");
    }

    if summary.quota_exhausted {
        tracing::error!(
            unlabeled = summary.unlabeled,
            "stopped early: daily quota exhausted on every credential"
        );
        std::process::exit(2);
    }
    if summary.stopped {
        tracing::warn!(unlabeled = summary.unlabeled, "stopped early on interrupt");
    }

    Ok(())
}
