use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use eyre::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use epcis_api::{router, Api};
use epcis_capture::CaptureHandler;
use epcis_common::bus::EventBus;
use epcis_common::config::{Config, StorageProvider};
use epcis_common::health::HealthRegistry;
use epcis_common::metrics::setup_metrics_routes;
use epcis_common::retry::RetryPolicy;
use epcis_query::engine::QueryEngine;
use epcis_store::memory::MemoryStore;
use epcis_store::postgres::PgStore;
use epcis_store::EventStore;
use epcis_subscriptions::delivery::WebhookDeliverer;
use epcis_subscriptions::SubscriptionEngine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    match config.storage_provider {
        StorageProvider::Postgres => {
            let store = PgStore::connect(
                &config.database_url,
                Duration::from_secs(config.command_timeout),
            )
            .await?;
            serve(config, Arc::new(store)).await
        }
        StorageProvider::Memory => serve(config, Arc::new(MemoryStore::new())).await,
    }
}

async fn serve<S: EventStore + 'static>(config: Config, store: Arc<S>) -> Result<()> {
    let bus = EventBus::default();
    let health = HealthRegistry::new("liveness");
    let cancel = CancellationToken::new();

    let query = Arc::new(QueryEngine::new(
        store.clone(),
        config.max_events_returned_in_query,
        config.pagination_secret.as_bytes(),
    ));

    // Deliveries run on their own runtime: webhook backpressure must not
    // occupy the request-serving workers.
    let subscription_runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("subscriptions")
        .enable_all()
        .build()?;

    let deliverer = Arc::new(WebhookDeliverer::new(
        bus.clone(),
        Duration::from_secs(config.delivery_timeout),
    ));
    let retry_policy = RetryPolicy::new(
        2,
        Duration::from_secs(1),
        Duration::from_secs(300),
        0.25,
        config.delivery_max_attempts,
    );
    let subscriptions = Arc::new(SubscriptionEngine::new(
        store.clone(),
        query.clone(),
        deliverer,
        retry_policy,
        Duration::from_millis(config.subscription_debounce_ms),
        subscription_runtime.handle().clone(),
        cancel.clone(),
    ));
    subscriptions
        .start(
            &bus,
            health.register("capture-listener", chrono::Duration::seconds(300)),
            health.register("scheduler", chrono::Duration::seconds(300)),
        )
        .await?;

    let api = Arc::new(Api {
        store: store.clone(),
        capture: CaptureHandler::new(store, bus, config.max_events_per_call),
        query,
        subscriptions,
        super_tenants: config.super_tenants(),
        capture_size_limit: config.capture_size_limit,
        discovery_limit: 1000,
    });

    let mut app = router(api, health);
    if config.export_prometheus {
        app = setup_metrics_routes(app);
    }

    let listener = tokio::net::TcpListener::bind(config.address).await?;
    info!(address = %config.address, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await?;

    subscription_runtime.shutdown_timeout(Duration::from_secs(5));
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutting down");
    cancel.cancel();
}
