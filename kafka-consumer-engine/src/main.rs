use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use kafka_consumer_engine::config::Config;
use kafka_consumer_engine::engine::ConsumerEngine;
use kafka_consumer_engine::metrics_server::{router, serve};
use kafka_consumer_engine::service::ConsumerService;

fn start_server(config: &Config, engine: Arc<ConsumerEngine>) -> Result<JoinHandle<()>> {
    let router = router(engine)?;
    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!(error = ?e, bind = %bind, "Failed to serve metrics");
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;

    // Initialize tracing
    let log_layer = if config.log_json {
        fmt::layer()
            .json()
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    };
    tracing_subscriber::registry().with(log_layer).init();

    info!("Starting Kafka consumer engine service");
    info!("Configuration loaded: {:?}", config);

    let service = ConsumerService::new(&config)
        .context("Failed to create consumer service. Check your Kafka connection settings.")?;

    // Start HTTP server with metrics endpoint
    let server_handle = start_server(&config, service.engine().clone())?;
    info!("Started metrics server on {}", config.bind_address());

    // Run the service (this blocks until shutdown)
    service.run().await?;

    // Clean up metrics server
    server_handle.abort();

    Ok(())
}
