use anyhow::{Context, Result};
use eventlens_gallery::{
    start_api_server, AppState, Config, FaceResolution, HttpFaceDetector, IdentityRegistry,
    PhotoStore, ProcessingDispatcher, ProcessingWorker,
};
use metrics::{describe_counter, describe_histogram, Unit};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level)?;

    info!(
        service = %config.service.name,
        uploads_dir = %config.storage.uploads_dir.display(),
        processed_dir = %config.storage.processed_dir.display(),
        "Starting EventLens Gallery Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let store = Arc::new(PhotoStore::new(&config.storage));

    // Face resolution: remote detector plus the local identity registry
    let registry = IdentityRegistry::load(&config.identity).await;
    info!(known_people = registry.len(), "Identity registry loaded");

    let detector =
        HttpFaceDetector::new(&config.detector).context("Failed to initialize face detector")?;
    info!(
        endpoint = %config.detector.endpoint,
        timeout_secs = config.detector_timeout().as_secs(),
        "Face detector configured"
    );

    let resolver = Arc::new(FaceResolution::new(detector, registry));
    let worker = Arc::new(ProcessingWorker::new(store.as_ref().clone(), resolver));
    let dispatcher = ProcessingDispatcher::new(worker, config.processing.max_concurrent_runs);

    // Pick up uploads that arrived while the service was down
    let backlog_handle = if config.processing.process_backlog_on_startup {
        let dispatcher = dispatcher.clone();
        let store = store.clone();
        Some(tokio::spawn(async move {
            match dispatcher.enqueue_backlog(&store).await {
                Ok(handles) => {
                    let runs = futures::future::join_all(handles).await;
                    let aborted = runs
                        .iter()
                        .filter(|run| run.as_ref().map(|r| r.is_aborted()).unwrap_or(true))
                        .count();
                    info!(events = runs.len(), aborted = aborted, "Startup backlog processed");
                }
                Err(e) => warn!(error = %e, "Failed to list events for startup backlog"),
            }
        }))
    } else {
        None
    };

    // Create API state
    let api_state = AppState {
        store: store.clone(),
        dispatcher,
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Gallery service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down gallery service");

    // In-flight runs are abandoned; unprocessed files are picked up next start
    if let Some(handle) = backlog_handle {
        handle.abort();
    }
    api_handle.abort();

    info!("Gallery service stopped");

    Ok(())
}

/// JSON logs filtered by RUST_LOG, falling back to the configured level
fn init_tracing(log_level: &str) -> Result<()> {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV)
        .unwrap_or_else(|_| format!("eventlens_gallery={log_level},tower_http={log_level}"));

    tracing_subscriber::registry()
        .with(log_filter(&directives)?)
        .with(fmt::layer().json().with_current_span(false))
        .init();

    Ok(())
}

/// Rejected paths and names are logged under the `security` target, which
/// stays at warn or louder whatever the service level is.
fn log_filter(directives: &str) -> Result<EnvFilter> {
    let filter = EnvFilter::try_new(directives)
        .with_context(|| format!("Invalid log filter: {directives}"))?;

    Ok(filter.add_directive(SECURITY_LOG_DIRECTIVE.parse()?))
}

const SECURITY_LOG_DIRECTIVE: &str = "security=warn";

/// Serve Prometheus metrics and register descriptions for the gallery series
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    describe_counter!("gallery.files.processed", "Uploads filed into person partitions");
    describe_counter!("gallery.files.skipped", "Uploads left in place without processing");
    describe_counter!("gallery.files.failed", "Uploads that could not be processed");
    describe_counter!("gallery.runs.aborted", "Processing runs that stopped before any file");
    describe_counter!("gallery.serve.not_found", "Photo requests answered with 404");
    describe_histogram!(
        "gallery.run.duration_seconds",
        Unit::Seconds,
        "Wall time of one processing run"
    );

    info!(port, "Metrics exporter listening");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
