use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Latency buckets sized for this service's request mix: capture and query
/// calls cluster under a second, hydration of large result sets and slow
/// webhook destinations stretch into the tens of seconds.
const LATENCY_SECONDS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0];

/// Add a prometheus `/metrics` route and the request tracking middleware to
/// a router. Installs a global recorder, so call at most once per process.
pub fn setup_metrics_routes(router: Router) -> Router {
    let recorder_handle = setup_metrics_recorder();

    router
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_requests))
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets(LATENCY_SECONDS)
        .expect("latency bucket list is non-empty")
        .install_recorder()
        .expect("no other global metrics recorder is installed")
}

/// Middleware recording per-route request counts and latency.
pub async fn track_requests(request: Request<Body>, next: Next) -> impl IntoResponse {
    let started = Instant::now();

    // Label by the matched route template, never the raw path: capture ids
    // and query names must not explode the label cardinality.
    let route = match request.extensions().get::<MatchedPath>() {
        Some(matched) => matched.as_str().to_owned(),
        None => "unmatched".to_owned(),
    };
    let verb = request.method().as_str().to_owned();

    let response = next.run(request).await;

    let labels = [
        ("route", route),
        ("verb", verb),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("epcis_requests_total", &labels).increment(1);
    metrics::histogram!("epcis_request_duration_seconds", &labels)
        .record(started.elapsed().as_secs_f64());

    response
}
