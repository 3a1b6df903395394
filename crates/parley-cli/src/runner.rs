use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parley_chat::{
    parse_chat_webhook_batch, ChatBatchSummary, ChatCommandRouter, ChatEventProcessor,
    ChatPipelineCounters, ChatReadinessReport, FaqCatalog, LineMessagingClient,
};
use parley_store::{spawn_kv_sweeper, InMemoryKvStore, KvStore, SqliteKvStore};

use crate::cli_args::{Cli, CliStoreBackend};

fn store_backend_label(backend: CliStoreBackend) -> &'static str {
    match backend {
        CliStoreBackend::Memory => "memory",
        CliStoreBackend::Sqlite => "sqlite",
    }
}

pub fn build_store(cli: &Cli) -> Result<Arc<dyn KvStore>> {
    let store: Arc<dyn KvStore> = match cli.store {
        CliStoreBackend::Memory => Arc::new(InMemoryKvStore::new()),
        CliStoreBackend::Sqlite => Arc::new(
            SqliteKvStore::new(&cli.store_sqlite_path).with_context(|| {
                format!(
                    "failed to open sqlite store {}",
                    cli.store_sqlite_path.display()
                )
            })?,
        ),
    };
    Ok(store)
}

pub fn render_summary_text(summary: &ChatBatchSummary) -> String {
    format!(
        "chat batch: received={} duplicates={} debounced={} rate_limited={} dispatched={} delivered={} delivery_skipped={} delivery_failed={} handler_failed={} fallback_used={} elapsed_ms={}",
        summary.received,
        summary.duplicates,
        summary.debounced,
        summary.rate_limited,
        summary.dispatched,
        summary.delivered,
        summary.delivery_skipped,
        summary.delivery_failed,
        summary.handler_failed,
        summary.fallback_used,
        summary.elapsed_ms
    )
}

pub fn render_readiness_text(report: &ChatReadinessReport) -> String {
    format!(
        "readiness: store_backend={} store_reachable={} detail={}",
        report.store_backend, report.store_reachable, report.detail
    )
}

fn print_readiness(cli: &Cli, report: &ChatReadinessReport) -> Result<()> {
    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(report).context("failed to render readiness json")?
        );
    } else {
        println!("{}", render_readiness_text(report));
    }
    Ok(())
}

async fn run_readiness_inspect(cli: &Cli) -> Result<()> {
    let report = match build_store(cli) {
        Ok(store) => {
            let store_backend = store.backend_name();
            match store.ping().await {
                Ok(()) => ChatReadinessReport {
                    store_backend,
                    store_reachable: true,
                    detail: "ok".to_string(),
                },
                Err(error) => ChatReadinessReport {
                    store_backend,
                    store_reachable: false,
                    detail: error.to_string(),
                },
            }
        }
        Err(error) => ChatReadinessReport {
            store_backend: store_backend_label(cli.store),
            store_reachable: false,
            detail: format!("{error:#}"),
        },
    };
    print_readiness(cli, &report)?;
    if !report.store_reachable {
        bail!(
            "admission store '{}' is not reachable: {}",
            report.store_backend,
            report.detail
        );
    }
    Ok(())
}

fn load_catalog(path: Option<&Path>) -> Result<FaqCatalog> {
    match path {
        Some(path) => FaqCatalog::load(path),
        None => Ok(FaqCatalog::default()),
    }
}

pub async fn run_cli(cli: Cli) -> Result<()> {
    if cli.readiness_inspect {
        return run_readiness_inspect(&cli).await;
    }
    let Some(events_file) = cli.events_file.as_deref() else {
        bail!("--events-file is required unless --readiness-inspect is set");
    };
    let raw = std::fs::read_to_string(events_file)
        .with_context(|| format!("failed to read events file {}", events_file.display()))?;
    let events = parse_chat_webhook_batch(&raw)
        .with_context(|| format!("failed to parse events file {}", events_file.display()))?;

    let store = build_store(&cli)?;
    let sweeper = spawn_kv_sweeper(
        Arc::clone(&store),
        Duration::from_millis(cli.store_sweep_interval_ms),
    );
    if cli
        .messaging_access_token
        .as_deref()
        .map(str::trim)
        .unwrap_or_default()
        .is_empty()
    {
        tracing::warn!("no messaging access token configured; outbound calls will be rejected");
    }
    let api = Arc::new(LineMessagingClient::new(cli.messaging_config())?);
    let counters = Arc::new(ChatPipelineCounters::default());
    let router = ChatCommandRouter::new(load_catalog(cli.faq_catalog.as_deref())?)
        .with_admin_user_ids(cli.admin_user_id.iter().cloned())
        .with_counters(Arc::clone(&counters));
    let processor =
        ChatEventProcessor::new(cli.pipeline_config(), store, api, Arc::new(router))
            .with_counters(counters);

    tracing::info!(
        events = events.len(),
        store = store_backend_label(cli.store),
        "processing chat webhook batch"
    );
    let summary = processor.process_batch(events).await;
    sweeper.abort();

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("failed to render summary json")?
        );
    } else {
        println!("{}", render_summary_text(&summary));
    }
    Ok(())
}
