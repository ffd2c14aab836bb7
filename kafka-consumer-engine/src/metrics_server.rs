use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::future::ready;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use crate::engine::ConsumerEngine;
use crate::kafka::metrics_consts::{FETCH_BATCH_SIZE, FETCH_DURATION_MS};
use crate::metrics_const::{
    BARRIER_WAIT_DURATION_HISTOGRAM, RECORD_PROCESSING_DURATION_HISTOGRAM,
    SHUTDOWN_DURATION_HISTOGRAM,
};

/// Default buckets, used for HTTP request latency
const HTTP_SECONDS_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5];

/// A single Process call or a whole barrier wait, up to the record timeout
const PROCESSING_SECONDS_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0,
];

const SHUTDOWN_SECONDS_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];

const FETCH_MS_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0];

const FETCH_SIZE_BUCKETS: &[f64] = &[0.0, 1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0];

pub async fn index() -> &'static str {
    "kafka consumer engine"
}

/// Ready while the engine is consuming, unavailable once shutdown finished
pub async fn readiness(State(engine): State<Arc<ConsumerEngine>>) -> (StatusCode, String) {
    if engine.is_done() {
        (StatusCode::SERVICE_UNAVAILABLE, "shut down".to_string())
    } else {
        (
            StatusCode::OK,
            format!("ready, {} partitions", engine.active_partitions().len()),
        )
    }
}

/// Health routes without the prometheus recorder
pub fn health_routes(engine: Arc<ConsumerEngine>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(readiness))
        .route("/_liveness", get(|| ready("ok")))
        .with_state(engine)
}

/// Health and metrics routes for the service binary
pub fn router(engine: Arc<ConsumerEngine>) -> Result<Router> {
    setup_metrics_routes(health_routes(engine))
}

/// Bind a `TcpListener` on the provided bind address and serve `router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Add the prometheus endpoint and middleware to a router, should be called last.
pub fn setup_metrics_routes(router: Router) -> Result<Router> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(router
        .route(
            "/metrics",
            get(move || ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics)))
}

fn metrics_builder() -> Result<PrometheusBuilder> {
    let per_metric = [
        (RECORD_PROCESSING_DURATION_HISTOGRAM, PROCESSING_SECONDS_BUCKETS),
        (BARRIER_WAIT_DURATION_HISTOGRAM, PROCESSING_SECONDS_BUCKETS),
        (SHUTDOWN_DURATION_HISTOGRAM, SHUTDOWN_SECONDS_BUCKETS),
        (FETCH_DURATION_MS, FETCH_MS_BUCKETS),
        (FETCH_BATCH_SIZE, FETCH_SIZE_BUCKETS),
    ];

    per_metric.into_iter().try_fold(
        PrometheusBuilder::new()
            .set_buckets(HTTP_SECONDS_BUCKETS)
            .context("invalid histogram buckets")?,
        |builder, (name, buckets)| {
            builder
                .set_buckets_for_metric(Matcher::Full(name.to_string()), buckets)
                .with_context(|| format!("invalid buckets for {name}"))
        },
    )
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle> {
    metrics_builder()?
        .install_recorder()
        .context("failed to install prometheus recorder")
}

/// Middleware to record some common HTTP metrics
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ConsumerTopicConfig;
    use crate::test_utils::{MockBrokerClient, RecordingProcessor};

    #[test]
    fn test_histogram_buckets_are_valid() {
        assert!(metrics_builder().is_ok());
    }

    #[tokio::test]
    async fn test_readiness_follows_engine_shutdown() {
        let engine = Arc::new(
            ConsumerEngine::builder(Arc::new(MockBrokerClient::new()))
                .topic(
                    ConsumerTopicConfig::new("orders", false),
                    Arc::new(RecordingProcessor::new()),
                )
                .build()
                .unwrap(),
        );

        let (status, _) = readiness(State(engine.clone())).await;
        assert_eq!(status, StatusCode::OK);

        engine.close().await.unwrap();

        let (status, body) = readiness(State(engine)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "shut down");
    }
}
