//! Route table and shared handler state.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use epcis_capture::CaptureHandler;
use epcis_common::health::HealthRegistry;
use epcis_query::engine::QueryEngine;
use epcis_store::EventStore;
use epcis_subscriptions::SubscriptionEngine;

use crate::rest;
use crate::soap_endpoint;

pub struct Api<S: EventStore + 'static> {
    pub store: Arc<S>,
    pub capture: CaptureHandler<S>,
    pub query: Arc<QueryEngine<S>>,
    pub subscriptions: Arc<SubscriptionEngine<S>>,
    pub super_tenants: Vec<String>,
    pub capture_size_limit: usize,
    pub discovery_limit: usize,
}

pub struct AppState<S: EventStore + 'static>(pub Arc<Api<S>>);

impl<S: EventStore> Clone for AppState<S> {
    fn clone(&self) -> Self {
        AppState(self.0.clone())
    }
}

pub fn router<S: EventStore + 'static>(api: Arc<Api<S>>, health: HealthRegistry) -> Router {
    let state = AppState(api);

    Router::new()
        .route("/capture", post(rest::capture_post::<S>).get(rest::capture_list::<S>))
        .route("/capture/:id", get(rest::capture_get::<S>))
        .route("/events", get(rest::events_get::<S>))
        .route("/eventTypes", get(rest::event_types::<S>))
        .route("/epcs", get(rest::epcs::<S>))
        .route("/bizSteps", get(rest::biz_steps::<S>))
        .route("/bizLocations", get(rest::biz_locations::<S>))
        .route("/readPoints", get(rest::read_points::<S>))
        .route("/dispositions", get(rest::dispositions::<S>))
        .route(
            "/queries",
            post(rest::query_create::<S>).get(rest::query_list::<S>),
        )
        .route(
            "/queries/:name",
            get(rest::query_get::<S>).delete(rest::query_delete::<S>),
        )
        .route("/queries/:name/events", get(rest::query_events::<S>))
        .route(
            "/queries/:name/subscriptions",
            post(rest::subscription_create::<S>).get(rest::subscription_list::<S>),
        )
        .route(
            "/queries/:name/subscriptions/:subscription",
            axum::routing::delete(rest::subscription_delete::<S>),
        )
        .route("/Query.svc", post(soap_endpoint::query_service::<S>))
        .route("/_liveness", get(move || std::future::ready(health.get_status())))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
