//! Standing-query execution: per-subscription runner tasks with trigger
//! coalescing, the capture-bus listener, the cron scheduler loop, and the
//! delivery retry state machine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use epcis_common::bus::EventBus;
use epcis_common::error::EpcisError;
use epcis_common::health::HealthHandle;
use epcis_common::model::{Subscription, SubscriptionTrigger};
use epcis_common::retry::RetryPolicy;
use epcis_format::json::encode::encode_query_results;
use epcis_query::engine::{subscription_plan, QueryEngine};
use epcis_store::EventStore;

use crate::delivery::{Deliverer, DeliveryError};
use crate::scheduler::{FireQueue, ScheduleEntry};

/// Where one run of a subscription ended up.
#[derive(Debug, PartialEq)]
pub enum RunOutcome {
    /// Empty result and `reportIfEmpty=false`: no delivery, cursor holds.
    Skipped,
    /// Delivered; the cursor advanced to the batch's max record time.
    Delivered { events: usize, cursor: DateTime<Utc> },
    /// Delivery was exhausted or permanently refused. Cursor holds; the
    /// subscription stays active for the operator to inspect.
    Failed { error: String },
}

/// Execute one run: query from the cursor, deliver with retries, advance.
///
/// Reentrancy is excluded by construction: only the subscription's single
/// runner task calls this, so cursor reads and advances are serial.
#[instrument(skip_all, fields(subscription = %subscription.name, tenant = %subscription.tenant_id))]
pub async fn run_subscription_once<S: EventStore>(
    store: &S,
    query: &QueryEngine<S>,
    deliverer: &dyn Deliverer,
    retry_policy: &RetryPolicy,
    subscription: &mut Subscription,
    cancel: &CancellationToken,
) -> Result<RunOutcome, EpcisError> {
    let plan = subscription_plan(
        &subscription.parameters,
        subscription.cursor(),
        &subscription.tenant_id,
    )?;
    let outcome = query.run_plan(plan, cancel).await?;

    if outcome.events.is_empty() && !subscription.report_if_empty {
        return Ok(RunOutcome::Skipped);
    }

    let body = encode_query_results(
        &outcome.events,
        &subscription.query_name,
        Some(&subscription.name),
    );

    let labels = [("subscription", subscription.name.clone())];
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(EpcisError::Canceled);
        }
        match deliverer.deliver(subscription, &body).await {
            Ok(()) => break,
            Err(DeliveryError::Retryable {
                message,
                retry_after,
            }) => {
                attempt += 1;
                if !retry_policy.can_retry(attempt) {
                    metrics::counter!("subscription_deliveries_failed_total", &labels)
                        .increment(1);
                    store
                        .record_subscription_error(subscription.id, &message)
                        .await?;
                    error!(
                        subscription = %subscription.name,
                        error = %message,
                        attempts = attempt,
                        "delivery attempts exhausted"
                    );
                    return Ok(RunOutcome::Failed { error: message });
                }
                let backoff = retry_policy.retry_interval(attempt - 1, retry_after);
                metrics::counter!("subscription_deliveries_retried_total", &labels)
                    .increment(1);
                warn!(
                    subscription = %subscription.name,
                    error = %message,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "delivery failed, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return Err(EpcisError::Canceled),
                }
            }
            Err(DeliveryError::Permanent { message }) => {
                metrics::counter!("subscription_deliveries_failed_total", &labels).increment(1);
                store
                    .record_subscription_error(subscription.id, &message)
                    .await?;
                error!(subscription = %subscription.name, error = %message, "delivery refused");
                return Ok(RunOutcome::Failed { error: message });
            }
        }
    }

    // Cursor advances exactly once per delivered batch, to the max record
    // time among the delivered events. Empty reportIfEmpty deliveries hold
    // the cursor.
    let max_record_time = outcome
        .events
        .iter()
        .filter_map(|e| e.record_time)
        .max();

    metrics::counter!("subscription_deliveries_total", &labels).increment(1);

    match max_record_time {
        Some(cursor) => {
            store
                .advance_subscription_cursor(subscription.id, cursor)
                .await?;
            if subscription.last_executed_time.map(|t| t < cursor).unwrap_or(true) {
                subscription.last_executed_time = Some(cursor);
            }
            Ok(RunOutcome::Delivered {
                events: outcome.events.len(),
                cursor,
            })
        }
        None => Ok(RunOutcome::Delivered {
            events: 0,
            cursor: subscription.cursor().unwrap_or(DateTime::UNIX_EPOCH),
        }),
    }
}

struct RunnerHandle {
    trigger: mpsc::Sender<()>,
    tenant_id: String,
    on_capture: bool,
}

struct Shared {
    runners: Mutex<HashMap<i64, RunnerHandle>>,
}

enum SchedulerCommand {
    Add(ScheduleEntry),
    Remove(i64),
}

/// The long-lived engine: owns the runner registry, the bus listener, and
/// the scheduler. Runs on the dedicated subscription runtime so delivery
/// backpressure cannot starve capture handling.
pub struct SubscriptionEngine<S: EventStore + 'static> {
    store: Arc<S>,
    query: Arc<QueryEngine<S>>,
    deliverer: Arc<dyn Deliverer>,
    retry_policy: RetryPolicy,
    debounce: Duration,
    shared: Arc<Shared>,
    scheduler_tx: mpsc::UnboundedSender<SchedulerCommand>,
    scheduler_rx: Mutex<Option<mpsc::UnboundedReceiver<SchedulerCommand>>>,
    /// Runtime the runner/listener/scheduler tasks are pinned to. A pool
    /// separate from the request-serving runtime, so delivery backpressure
    /// cannot starve captures.
    runtime: tokio::runtime::Handle,
    cancel: CancellationToken,
}

impl<S: EventStore + 'static> SubscriptionEngine<S> {
    pub fn new(
        store: Arc<S>,
        query: Arc<QueryEngine<S>>,
        deliverer: Arc<dyn Deliverer>,
        retry_policy: RetryPolicy,
        debounce: Duration,
        runtime: tokio::runtime::Handle,
        cancel: CancellationToken,
    ) -> Self {
        let (scheduler_tx, scheduler_rx) = mpsc::unbounded_channel();
        SubscriptionEngine {
            store,
            query,
            deliverer,
            retry_policy,
            debounce,
            shared: Arc::new(Shared {
                runners: Mutex::new(HashMap::new()),
            }),
            scheduler_tx,
            scheduler_rx: Mutex::new(Some(scheduler_rx)),
            runtime,
            cancel,
        }
    }

    /// Load persisted subscriptions and start the listener and scheduler
    /// loops. Call once.
    pub async fn start(
        self: &Arc<Self>,
        bus: &EventBus,
        listener_health: HealthHandle,
        scheduler_health: HealthHandle,
    ) -> Result<(), EpcisError> {
        let existing = self.store.all_active_subscriptions().await?;
        info!(count = existing.len(), "starting subscription engine");
        for subscription in existing {
            self.spawn_runner(subscription)?;
        }

        let engine = self.clone();
        let mut captures = bus.subscribe_captures();
        self.runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = engine.cancel.cancelled() => break,
                    notice = captures.recv() => {
                        listener_health.report_healthy();
                        match notice {
                            Ok(notice) => engine.trigger_on_capture(&notice.tenant_id),
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                                // Catch-up run for everyone; a lagged trigger
                                // is still just a trigger.
                                warn!(skipped, "capture listener lagged, firing all");
                                engine.trigger_all_on_capture();
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });

        let engine = self.clone();
        let mut rx = self
            .scheduler_rx
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or_else(|| {
                EpcisError::storage(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "subscription engine started twice",
                ))
            })?;
        self.runtime.spawn(async move {
            let mut queue = FireQueue::new();
            let mut entries: HashMap<i64, ScheduleEntry> = HashMap::new();
            loop {
                scheduler_health.report_healthy();
                let sleep_until = queue.peek_at();
                let sleep = match sleep_until {
                    Some(at) => {
                        let delta = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                        tokio::time::sleep(delta)
                    }
                    // Nothing queued: doze briefly and re-check for commands.
                    None => tokio::time::sleep(Duration::from_secs(30)),
                };
                tokio::select! {
                    _ = engine.cancel.cancelled() => break,
                    command = rx.recv() => match command {
                        Some(SchedulerCommand::Add(entry)) => {
                            if let Some(at) = entry.next_fire(Utc::now()) {
                                queue.push(at, entry.subscription_id);
                            }
                            entries.insert(entry.subscription_id, entry);
                        }
                        Some(SchedulerCommand::Remove(id)) => {
                            entries.remove(&id);
                            queue.remove(id);
                        }
                        None => break,
                    },
                    _ = sleep => {
                        for id in queue.due(Utc::now()) {
                            engine.trigger(id);
                            if let Some(entry) = entries.get(&id) {
                                if let Some(next) = entry.next_fire(Utc::now()) {
                                    queue.push(next, id);
                                }
                            }
                        }
                    }
                }
            }
        });

        Ok(())
    }

    /// Register a new subscription: persist, start its runner, queue its
    /// schedule. Cron expressions are validated before anything persists.
    pub async fn register(&self, mut subscription: Subscription) -> Result<Subscription, EpcisError> {
        if let SubscriptionTrigger::OnSchedule(expression) = &subscription.trigger {
            ScheduleEntry::new(0, expression)?;
        }
        self.store.insert_subscription(&mut subscription).await?;
        self.spawn_runner(subscription.clone())?;
        Ok(subscription)
    }

    pub async fn unregister(&self, tenant_id: &str, name: &str) -> Result<bool, EpcisError> {
        let existing = self
            .store
            .list_subscriptions(tenant_id)
            .await?
            .into_iter()
            .find(|s| s.name == name);
        let removed = self.store.delete_subscription(tenant_id, name).await?;
        if let Some(subscription) = existing {
            if let Ok(mut runners) = self.shared.runners.lock() {
                runners.remove(&subscription.id);
            }
            let _ = self
                .scheduler_tx
                .send(SchedulerCommand::Remove(subscription.id));
        }
        Ok(removed)
    }

    fn spawn_runner(&self, subscription: Subscription) -> Result<(), EpcisError> {
        // Capacity 1 gives the coalescing rule for free: a trigger during a
        // run queues exactly one follow-up; further triggers collapse.
        let (trigger_tx, trigger_rx) = mpsc::channel(1);

        if let SubscriptionTrigger::OnSchedule(expression) = &subscription.trigger {
            let entry = ScheduleEntry::new(subscription.id, expression)?;
            let _ = self.scheduler_tx.send(SchedulerCommand::Add(entry));
        }

        if let Ok(mut runners) = self.shared.runners.lock() {
            runners.insert(
                subscription.id,
                RunnerHandle {
                    trigger: trigger_tx,
                    tenant_id: subscription.tenant_id.clone(),
                    on_capture: subscription.trigger == SubscriptionTrigger::OnCapture,
                },
            );
        }

        let store = self.store.clone();
        let query = self.query.clone();
        let deliverer = self.deliverer.clone();
        let retry_policy = self.retry_policy;
        let debounce = self.debounce;
        let cancel = self.cancel.clone();
        self.runtime.spawn(run_subscription_loop(
            store,
            query,
            deliverer,
            retry_policy,
            debounce,
            subscription,
            trigger_rx,
            cancel,
        ));
        Ok(())
    }

    fn trigger(&self, subscription_id: i64) {
        if let Ok(runners) = self.shared.runners.lock() {
            if let Some(handle) = runners.get(&subscription_id) {
                // Full channel means a run is already queued: coalesce.
                let _ = handle.trigger.try_send(());
            }
        }
    }

    fn trigger_on_capture(&self, tenant_id: &str) {
        if let Ok(runners) = self.shared.runners.lock() {
            for handle in runners.values() {
                if handle.on_capture && handle.tenant_id == tenant_id {
                    let _ = handle.trigger.try_send(());
                }
            }
        }
    }

    fn trigger_all_on_capture(&self) {
        if let Ok(runners) = self.shared.runners.lock() {
            for handle in runners.values() {
                if handle.on_capture {
                    let _ = handle.trigger.try_send(());
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_subscription_loop<S: EventStore>(
    store: Arc<S>,
    query: Arc<QueryEngine<S>>,
    deliverer: Arc<dyn Deliverer>,
    retry_policy: RetryPolicy,
    debounce: Duration,
    mut subscription: Subscription,
    mut trigger_rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            trigger = trigger_rx.recv() => {
                if trigger.is_none() {
                    break;
                }
            }
        }

        // Debounce: coalesce a burst of captures into one run. Triggers that
        // land during the window are folded in, triggers during the run
        // itself queue one follow-up.
        if !debounce.is_zero() {
            tokio::time::sleep(debounce).await;
            while trigger_rx.try_recv().is_ok() {}
        }

        match run_subscription_once(
            store.as_ref(),
            query.as_ref(),
            deliverer.as_ref(),
            &retry_policy,
            &mut subscription,
            &cancel,
        )
        .await
        {
            Ok(RunOutcome::Delivered { events, .. }) => {
                info!(subscription = %subscription.name, events, "delivered");
            }
            Ok(RunOutcome::Skipped) => {}
            Ok(RunOutcome::Failed { .. }) => {}
            Err(EpcisError::Canceled) => break,
            Err(e) => {
                error!(subscription = %subscription.name, error = %e, "subscription run failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::DeliveryError;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use epcis_common::model::{
        Capture, Epc, EpcType, Event, EventAction, EventType, SchemaVersion,
    };
    use epcis_store::memory::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted deliverer: fails the first `failures` attempts, records
    /// every delivered body.
    struct ScriptedDeliverer {
        failures: AtomicUsize,
        permanent: bool,
        delivered: Mutex<Vec<String>>,
        attempts: AtomicUsize,
    }

    impl ScriptedDeliverer {
        fn failing(failures: usize) -> Self {
            ScriptedDeliverer {
                failures: AtomicUsize::new(failures),
                permanent: false,
                delivered: Mutex::new(Vec::new()),
                attempts: AtomicUsize::new(0),
            }
        }

        fn succeeding() -> Self {
            Self::failing(0)
        }
    }

    #[async_trait]
    impl Deliverer for ScriptedDeliverer {
        async fn deliver(
            &self,
            _subscription: &Subscription,
            body: &str,
        ) -> Result<(), DeliveryError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return if self.permanent {
                    Err(DeliveryError::Permanent {
                        message: "410 Gone".to_owned(),
                    })
                } else {
                    Err(DeliveryError::Retryable {
                        message: "503 Service Unavailable".to_owned(),
                        retry_after: None,
                    })
                };
            }
            self.delivered.lock().unwrap().push(body.to_owned());
            Ok(())
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(10), 0.0, 10)
    }

    fn subscription() -> Subscription {
        Subscription {
            id: 0,
            name: "cold-chain".to_owned(),
            query_name: "SimpleEventQuery".to_owned(),
            parameters: vec![(
                "MATCH_anyEPC".to_owned(),
                "urn:epc:id:sgtin:8901213.*".to_owned(),
            )],
            destination: "https://hooks.example.com/epcis".to_owned(),
            tenant_id: "tenant-a".to_owned(),
            report_if_empty: false,
            initial_record_time: None,
            last_executed_time: None,
            trigger: SubscriptionTrigger::OnCapture,
            active: true,
            last_error: None,
        }
    }

    async fn seed_events(store: &MemoryStore, count: u32, record_minute: u32) -> DateTime<Utc> {
        let record_time = Utc
            .with_ymd_and_hms(2025, 1, 15, 12, record_minute, 0)
            .unwrap();
        let mut capture = Capture::new(SchemaVersion::V2_0);
        capture.tenant_id = "tenant-a".to_owned();
        capture.record_time = Some(record_time);
        for i in 0..count {
            let time = Utc.with_ymd_and_hms(2025, 1, 15, 10, i, 0).unwrap();
            let mut event = Event::new(EventType::Object, time, "+00:00");
            event.action = Some(EventAction::Observe);
            event.epcs.push(Epc::new(
                EpcType::List,
                format!("urn:epc:id:sgtin:8901213.105919.{i:06}"),
            ));
            capture.events.push(event);
        }
        store
            .insert_capture(&mut capture, &CancellationToken::new())
            .await
            .unwrap();
        record_time
    }

    fn harness(
        store: Arc<MemoryStore>,
    ) -> (Arc<MemoryStore>, QueryEngine<MemoryStore>) {
        let query = QueryEngine::new(store.clone(), 10_000, b"secret");
        (store, query)
    }

    #[tokio::test]
    async fn delivers_matching_events_and_advances_cursor() {
        let (store, query) = harness(Arc::new(MemoryStore::new()));
        let record_time = seed_events(&store, 3, 0).await;

        let mut sub = subscription();
        store.insert_subscription(&mut sub).await.unwrap();
        let deliverer = ScriptedDeliverer::succeeding();

        let outcome = run_subscription_once(
            store.as_ref(),
            &query,
            &deliverer,
            &fast_retry(),
            &mut sub,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(
            outcome,
            RunOutcome::Delivered {
                events: 3,
                cursor: record_time
            }
        );
        assert_eq!(sub.last_executed_time, Some(record_time));

        let bodies = deliverer.delivered.lock().unwrap();
        assert_eq!(bodies.len(), 1);
        assert!(bodies[0].contains("\"subscriptionID\":\"cold-chain\""));
        assert!(bodies[0].contains("urn:epc:id:sgtin:8901213.105919.000000"));
    }

    #[tokio::test]
    async fn second_run_sees_only_new_events() {
        let (store, query) = harness(Arc::new(MemoryStore::new()));
        seed_events(&store, 2, 0).await;

        let mut sub = subscription();
        store.insert_subscription(&mut sub).await.unwrap();
        let deliverer = ScriptedDeliverer::succeeding();
        let cancel = CancellationToken::new();

        run_subscription_once(store.as_ref(), &query, &deliverer, &fast_retry(), &mut sub, &cancel)
            .await
            .unwrap();

        // No new events: the run is skipped and the cursor holds.
        let outcome = run_subscription_once(
            store.as_ref(),
            &query,
            &deliverer,
            &fast_retry(),
            &mut sub,
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(outcome, RunOutcome::Skipped);

        // Later capture: only its events are delivered.
        let later = seed_events(&store, 1, 30).await;
        let outcome = run_subscription_once(
            store.as_ref(),
            &query,
            &deliverer,
            &fast_retry(),
            &mut sub,
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Delivered {
                events: 1,
                cursor: later
            }
        );
    }

    #[tokio::test]
    async fn transient_failure_retries_then_advances_once() {
        let (store, query) = harness(Arc::new(MemoryStore::new()));
        let record_time = seed_events(&store, 3, 0).await;

        let mut sub = subscription();
        store.insert_subscription(&mut sub).await.unwrap();
        let deliverer = ScriptedDeliverer::failing(1);

        let outcome = run_subscription_once(
            store.as_ref(),
            &query,
            &deliverer,
            &fast_retry(),
            &mut sub,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(deliverer.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(deliverer.delivered.lock().unwrap().len(), 1);
        assert_eq!(
            outcome,
            RunOutcome::Delivered {
                events: 3,
                cursor: record_time
            }
        );
        // The stored cursor advanced exactly once.
        let stored = store.list_subscriptions("tenant-a").await.unwrap();
        assert_eq!(stored[0].last_executed_time, Some(record_time));
    }

    #[tokio::test]
    async fn exhausted_retries_fail_and_hold_the_cursor() {
        let (store, query) = harness(Arc::new(MemoryStore::new()));
        seed_events(&store, 1, 0).await;

        let mut sub = subscription();
        store.insert_subscription(&mut sub).await.unwrap();
        let policy = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2), 0.0, 3);
        let deliverer = ScriptedDeliverer::failing(99);

        let outcome = run_subscription_once(
            store.as_ref(),
            &query,
            &deliverer,
            &policy,
            &mut sub,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(matches!(outcome, RunOutcome::Failed { .. }));
        assert_eq!(deliverer.attempts.load(Ordering::SeqCst), 3);
        assert!(sub.last_executed_time.is_none());

        let stored = store.list_subscriptions("tenant-a").await.unwrap();
        assert!(stored[0].last_error.as_deref().unwrap().contains("503"));
        // Failure does not deactivate; that is operator-controlled.
        assert!(stored[0].active);
    }

    #[tokio::test]
    async fn empty_with_report_if_empty_delivers_but_holds_cursor() {
        let (store, query) = harness(Arc::new(MemoryStore::new()));
        let mut sub = subscription();
        sub.report_if_empty = true;
        store.insert_subscription(&mut sub).await.unwrap();
        let deliverer = ScriptedDeliverer::succeeding();

        let outcome = run_subscription_once(
            store.as_ref(),
            &query,
            &deliverer,
            &fast_retry(),
            &mut sub,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(matches!(outcome, RunOutcome::Delivered { events: 0, .. }));
        assert_eq!(deliverer.delivered.lock().unwrap().len(), 1);
        assert!(sub.last_executed_time.is_none());
    }

    #[tokio::test]
    async fn engine_fires_on_capture_and_coalesces() {
        let store = Arc::new(MemoryStore::new());
        let query = Arc::new(QueryEngine::new(store.clone(), 10_000, b"secret"));
        let deliverer = Arc::new(ScriptedDeliverer::succeeding());
        let bus = EventBus::new(64);
        let cancel = CancellationToken::new();

        let engine = Arc::new(SubscriptionEngine::new(
            store.clone(),
            query,
            deliverer.clone(),
            fast_retry(),
            Duration::from_millis(20),
            tokio::runtime::Handle::current(),
            cancel.clone(),
        ));
        let health = epcis_common::health::HealthRegistry::new("test");
        engine
            .start(
                &bus,
                health.register("listener", chrono::Duration::seconds(30)),
                health.register("scheduler", chrono::Duration::seconds(30)),
            )
            .await
            .unwrap();

        engine.register(subscription()).await.unwrap();

        // A burst of captures within the debounce window coalesces into one
        // delivery covering all of them.
        seed_events(&store, 1, 0).await;
        bus.publish_capture(epcis_common::bus::CaptureNotice {
            capture_id: uuid::Uuid::now_v7(),
            tenant_id: "tenant-a".to_owned(),
            record_time: Utc::now(),
            event_count: 1,
        });
        seed_events(&store, 1, 1).await;
        bus.publish_capture(epcis_common::bus::CaptureNotice {
            capture_id: uuid::Uuid::now_v7(),
            tenant_id: "tenant-a".to_owned(),
            record_time: Utc::now(),
            event_count: 1,
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();

        let bodies = deliverer.delivered.lock().unwrap();
        assert_eq!(bodies.len(), 1, "burst must coalesce into one delivery");
        assert!(bodies[0].contains("105919.000000"));
    }

    #[tokio::test]
    async fn captures_for_other_tenants_do_not_fire() {
        let store = Arc::new(MemoryStore::new());
        let query = Arc::new(QueryEngine::new(store.clone(), 10_000, b"secret"));
        let deliverer = Arc::new(ScriptedDeliverer::succeeding());
        let bus = EventBus::new(64);
        let cancel = CancellationToken::new();

        let engine = Arc::new(SubscriptionEngine::new(
            store.clone(),
            query,
            deliverer.clone(),
            fast_retry(),
            Duration::from_millis(5),
            tokio::runtime::Handle::current(),
            cancel.clone(),
        ));
        let health = epcis_common::health::HealthRegistry::new("test");
        engine
            .start(
                &bus,
                health.register("listener", chrono::Duration::seconds(30)),
                health.register("scheduler", chrono::Duration::seconds(30)),
            )
            .await
            .unwrap();
        engine.register(subscription()).await.unwrap();

        bus.publish_capture(epcis_common::bus::CaptureNotice {
            capture_id: uuid::Uuid::now_v7(),
            tenant_id: "tenant-b".to_owned(),
            record_time: Utc::now(),
            event_count: 1,
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        assert!(deliverer.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn register_rejects_bad_cron() {
        let store = Arc::new(MemoryStore::new());
        let query = Arc::new(QueryEngine::new(store.clone(), 10_000, b"secret"));
        let engine = SubscriptionEngine::new(
            store,
            query,
            Arc::new(ScriptedDeliverer::succeeding()),
            fast_retry(),
            Duration::ZERO,
            tokio::runtime::Handle::current(),
            CancellationToken::new(),
        );

        let mut sub = subscription();
        sub.trigger = SubscriptionTrigger::OnSchedule("definitely not cron".to_owned());
        assert!(matches!(
            engine.register(sub).await,
            Err(EpcisError::InvalidParameterValue { .. })
        ));
    }
}
