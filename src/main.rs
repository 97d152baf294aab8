mod cli;
mod client;
mod config;
mod error;
mod loader;
mod manager;
mod metrics;
mod router;
mod row;
mod shard;
mod value;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::client::mock::MockClient;
use crate::client::{CallResponse, ProcedureClient};
use crate::cli::Cli;
use crate::config::IngestConfig;
use crate::error::IngestResult;
use crate::loader::BulkLoaderBuilder;
use crate::manager::IngestManager;
use crate::metrics::IngestMetrics;
use crate::router::{HashPartitioner, PartitionRouter};
use crate::value::{ColumnType, Value};

#[tokio::main]
async fn main() -> IngestResult<()> {
    let cli = Cli::parse();

    let config = IngestConfig::load(&cli.config).unwrap_or_else(|err| {
        eprintln!("falling back to defaults: failed to load {}: {err}", cli.config);
        IngestConfig::default()
    });

    init_tracing(&config.logging.level);

    let metrics = Arc::new(IngestMetrics::new()?);

    let metrics_server = if config.metrics.enabled {
        Some(spawn_metrics_server(metrics.clone(), &config)?)
    } else {
        None
    };

    let mock_client = Arc::new(MockClient::new());
    if cli.simulate_connection_loss {
        mock_client.push_script(crate::client::mock::Scripted::Unreachable);
    }
    let client: Arc<dyn ProcedureClient> = mock_client;

    let router = Arc::new(PartitionRouter::new(Arc::new(HashPartitioner)));
    let manager = IngestManager::new(
        client,
        metrics.clone(),
        router,
        config.partitioning.partition_count,
        config.shard.queue_capacity_multiplier,
    );

    if cli.simulate_connection_loss {
        let reconnect_manager = manager.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            tracing::info!("simulated reconnect: waking parked shards");
            reconnect_manager.notify_reconnected();
        });
    }

    run_demo(manager, cli.rows, config.shard.default_trigger_size, config.shard.auto_reconnect).await?;

    if let Some(handle) = metrics_server {
        handle.abort();
    }

    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn spawn_metrics_server(
    metrics: Arc<IngestMetrics>,
    config: &IngestConfig,
) -> IngestResult<tokio::task::JoinHandle<()>> {
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;

    async fn metrics_handler(State(metrics): State<Arc<IngestMetrics>>) -> impl IntoResponse {
        match metrics.encode_text() {
            Ok(text) => {
                let mut headers = HeaderMap::new();
                headers.insert(
                    axum::http::header::CONTENT_TYPE,
                    "text/plain; version=0.0.4; charset=utf-8".parse().unwrap(),
                );
                (StatusCode::OK, headers, text).into_response()
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to gather metrics");
                (StatusCode::INTERNAL_SERVER_ERROR, "gather metrics failed\n").into_response()
            }
        }
    }

    let addr: std::net::SocketAddr = format!("{}:{}", config.metrics.bind_addr, config.metrics.port)
        .parse()
        .map_err(|e| crate::error::IngestError::InvalidConfig(format!("invalid metrics bind/port: {e}")))?;

    let app = Router::new()
        .route(&config.metrics.metrics_path, get(metrics_handler))
        .with_state(metrics);

    tracing::info!(
        bind_addr = %config.metrics.bind_addr,
        port = config.metrics.port,
        path = %config.metrics.metrics_path,
        "metrics server starting (axum)"
    );

    Ok(tokio::spawn(async move {
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!(error = %e, "metrics server exited");
                }
            }
            Err(e) => tracing::error!(error = %e, addr = %addr, "failed to bind metrics listener"),
        }
    }))
}

/// Demo wiring: one MP table, a handful of rows, drained to completion.
/// Exercises the same insert/flush/drain/close path the scenario tests do,
/// just against whatever `ProcedureClient` was constructed in `main`.
async fn run_demo(
    manager: Arc<IngestManager>,
    rows: usize,
    trigger_size: usize,
    auto_reconnect: bool,
) -> IngestResult<()> {
    let loader = BulkLoaderBuilder::<u64>::new("ticks")
        .column("id", ColumnType::Int)
        .column("symbol", ColumnType::Text)
        .trigger_size(trigger_size)
        .auto_reconnect(auto_reconnect)
        .on_failure(|handle, _values, response: CallResponse| {
            tracing::warn!(handle, status = ?response.status, "row failed");
        })
        .on_success(|handle, _response| {
            tracing::debug!(handle, "row succeeded");
        })
        .build(manager.clone())?;

    for i in 0..rows as u64 {
        loader
            .insert(i, vec![Value::Int(i as i64), Value::Text(format!("SYM{i}"))])
            .await?;
    }

    loader.close().await?;
    tracing::info!(
        completed = loader.completed(),
        failed = loader.failed(),
        "demo run finished"
    );
    Ok(())
}
