//! The capture handler: cap check, validate, hash, persist in one
//! transaction, then notify the bus.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use epcis_common::bus::{CaptureNotice, EventBus};
use epcis_common::error::EpcisError;
use epcis_common::model::Capture;
use epcis_format::hash::hash_event;
use epcis_store::EventStore;

use crate::validation::validate_capture;

pub struct CaptureHandler<S: EventStore> {
    store: Arc<S>,
    bus: EventBus,
    max_events_per_call: usize,
}

impl<S: EventStore> CaptureHandler<S> {
    pub fn new(store: Arc<S>, bus: EventBus, max_events_per_call: usize) -> Self {
        CaptureHandler {
            store,
            bus,
            max_events_per_call,
        }
    }

    /// Take a decoded capture to durable state. On success the capture comes
    /// back with `record_time`, storage ids, and derived event ids filled.
    #[instrument(skip_all, fields(tenant = %capture.tenant_id, events = capture.events.len()))]
    pub async fn store(
        &self,
        mut capture: Capture,
        cancel: &CancellationToken,
    ) -> Result<Capture, EpcisError> {
        if capture.events.len() > self.max_events_per_call {
            metrics::counter!("capture_rejected_total", &[("reason", "limit_exceeded")])
                .increment(1);
            return Err(EpcisError::CaptureLimitExceeded);
        }

        let violations = validate_capture(&capture);
        if !violations.is_empty() {
            metrics::counter!("capture_rejected_total", &[("reason", "validation")])
                .increment(1);
            tracing::debug!(violations = violations.len(), "capture failed validation");
            return Err(EpcisError::ValidationFailed(violations));
        }

        for event in &mut capture.events {
            if event.event_id.is_empty() {
                event.event_id = hash_event(event);
            }
        }

        let record_time = Utc::now();
        capture.record_time = Some(record_time);
        if let Some(document_time) = capture.document_time {
            if record_time < document_time {
                // Clock skew between client and server; keep the invariant
                // recordTime >= documentTime by clamping the document side.
                capture.document_time = Some(record_time);
            }
        }

        self.store.insert_capture(&mut capture, cancel).await?;

        metrics::counter!("capture_events_stored_total")
            .increment(capture.events.len() as u64);

        // Best-effort: a full bus never affects the caller's result. The
        // publish happens strictly after commit, so listeners that query
        // back see consistent state.
        self.bus.publish_capture(CaptureNotice {
            capture_id: capture.capture_id,
            tenant_id: capture.tenant_id.clone(),
            record_time,
            event_count: capture.events.len(),
        });

        Ok(capture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use epcis_common::model::{
        Epc, EpcType, Event, EventAction, EventType, SchemaVersion,
    };
    use epcis_store::memory::MemoryStore;

    fn handler(max: usize) -> (CaptureHandler<MemoryStore>, EventBus) {
        let bus = EventBus::new(16);
        (
            CaptureHandler::new(Arc::new(MemoryStore::new()), bus.clone(), max),
            bus,
        )
    }

    fn object_event(minute: u32) -> Event {
        let time = Utc.with_ymd_and_hms(2025, 1, 15, 10, minute, 0).unwrap();
        let mut event = Event::new(EventType::Object, time, "+00:00");
        event.action = Some(EventAction::Observe);
        event
            .epcs
            .push(Epc::new(EpcType::List, "urn:epc:id:sgtin:8901213.105919.000000"));
        event
    }

    fn capture_with(count: u32) -> Capture {
        let mut capture = Capture::new(SchemaVersion::V2_0);
        capture.tenant_id = "tenant-a".to_owned();
        capture.events = (0..count).map(object_event).collect();
        capture
    }

    #[tokio::test]
    async fn stores_and_fills_server_fields() {
        let (handler, _bus) = handler(500);
        let stored = handler
            .store(capture_with(2), &CancellationToken::new())
            .await
            .unwrap();

        assert!(stored.record_time.is_some());
        assert!(stored.id > 0);
        for event in &stored.events {
            assert!(event.id > 0);
            assert!(event.event_id.starts_with("ni:///sha-256;"));
            assert_eq!(event.record_time, stored.record_time);
        }
    }

    #[tokio::test]
    async fn exactly_at_the_limit_succeeds_one_more_fails() {
        let (handler, _bus) = handler(3);
        assert!(handler
            .store(capture_with(3), &CancellationToken::new())
            .await
            .is_ok());

        let err = handler
            .store(capture_with(4), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EpcisError::CaptureLimitExceeded));
    }

    #[tokio::test]
    async fn invalid_capture_is_rejected_with_rules() {
        let (handler, _bus) = handler(500);
        let mut capture = capture_with(1);
        capture.events[0].action = None;
        let err = handler
            .store(capture, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            EpcisError::ValidationFailed(violations) => {
                assert_eq!(violations[0].rule, "ActionRequired");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn publishes_after_commit() {
        let (handler, bus) = handler(500);
        let mut rx = bus.subscribe_captures();
        let stored = handler
            .store(capture_with(3), &CancellationToken::new())
            .await
            .unwrap();

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.capture_id, stored.capture_id);
        assert_eq!(notice.tenant_id, "tenant-a");
        assert_eq!(notice.event_count, 3);
    }

    #[tokio::test]
    async fn cancellation_leaves_nothing_behind_and_stays_silent() {
        let bus = EventBus::new(16);
        let store = Arc::new(MemoryStore::new());
        let handler = CaptureHandler::new(store.clone(), bus.clone(), 500);
        let mut rx = bus.subscribe_captures();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = handler.store(capture_with(1), &cancel).await.unwrap_err();
        assert!(matches!(err, EpcisError::Canceled));

        assert!(rx.try_recv().is_err());
        let captures = store.list_captures("tenant-a", 10, 0).await.unwrap();
        assert!(captures.is_empty());
    }

    #[tokio::test]
    async fn identical_events_get_identical_ids_across_captures() {
        let (handler, _bus) = handler(500);
        let first = handler
            .store(capture_with(1), &CancellationToken::new())
            .await
            .unwrap();
        let second = handler
            .store(capture_with(1), &CancellationToken::new())
            .await
            .unwrap();

        assert_ne!(first.capture_id, second.capture_id);
        assert_eq!(first.events[0].event_id, second.events[0].event_id);
    }

    #[tokio::test]
    async fn record_time_is_at_least_document_time() {
        let (handler, _bus) = handler(500);
        let mut capture = capture_with(1);
        // A document "from the future" must not break the invariant.
        capture.document_time = Some(Utc::now() + chrono::Duration::hours(1));
        let stored = handler
            .store(capture, &CancellationToken::new())
            .await
            .unwrap();
        assert!(stored.record_time.unwrap() >= stored.document_time.unwrap());
    }
}
