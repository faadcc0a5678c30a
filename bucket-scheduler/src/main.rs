use std::sync::Arc;

use anyhow::{Context, Result};
use bucket_coordination::store::EtcdBucketStore;
use bucket_coordination::{BucketServiceFactory, ServiceType};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

mod action;
mod config;
mod http;

use action::VisitLogger;
use config::Config;

async fn shutdown_signal() -> Result<()> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("failed to register SIGTERM handler")?;
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("failed to register SIGINT handler")?;

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutting down gracefully...");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;

    // Initialize tracing
    let log_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .with_filter(EnvFilter::from_default_env())
        .boxed();

    tracing_subscriber::registry().with(log_layer).init();

    let host_id = config.resolve_host_id();
    info!(host = %host_id, "Starting bucket scheduler");
    info!("Configuration loaded: {:?}", config);

    let store = Arc::new(
        EtcdBucketStore::connect(config.store_config())
            .await
            .context("Failed to connect to etcd")?,
    );

    let factory = BucketServiceFactory::with_defaults(store.clone(), config.service_defaults(&host_id));
    let mut managers = vec![factory.create_retention_service(
        config.retention_bucket_count,
        config.retention_tick_period(),
        VisitLogger::new(ServiceType::RetentionService),
    )?];
    if config.watermarking_bucket_count > 0 {
        managers.push(factory.create_watermarking_service(
            config.watermarking_bucket_count,
            config.watermarking_tick_period(),
            VisitLogger::new(ServiceType::WatermarkingService),
        )?);
    }

    let metrics = if config.export_prometheus {
        Some(
            PrometheusBuilder::new()
                .install_recorder()
                .context("Failed to install metrics recorder")?,
        )
    } else {
        None
    };

    let app = http::router(http::AppState::new(managers.clone()), metrics);
    let bind = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    let mut server = tokio::spawn(async move { axum::serve(listener, app).await });
    info!("Started HTTP server on {}", bind);

    for manager in &managers {
        manager.start()?;
    }

    tokio::select! {
        res = shutdown_signal() => res?,
        res = &mut server => {
            error!("http server exited");
            if let Ok(Err(e)) = res {
                error!("server failed with: {}", e);
            }
        }
    }

    for manager in &managers {
        manager.stop();
    }
    for manager in &managers {
        manager.await_terminated().await;
    }

    if let Err(e) = store.close().await {
        warn!(error = %e, "failed to revoke etcd session lease");
    }
    server.abort();

    info!("exiting");
    Ok(())
}
