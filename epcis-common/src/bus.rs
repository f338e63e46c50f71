use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Published on the bus after a capture transaction commits. Subscribers that
/// query back are therefore guaranteed a consistent view of the store.
#[derive(Debug, Clone)]
pub struct CaptureNotice {
    pub capture_id: Uuid,
    pub tenant_id: String,
    pub record_time: DateTime<Utc>,
    pub event_count: usize,
}

/// In-process fan-out from the capture handler to listeners.
///
/// Publish is non-blocking and best-effort: a full or receiver-less channel
/// never affects the capture result. Subscribers buffer up to the channel
/// capacity and observe `Lagged` if they fall behind.
#[derive(Clone)]
pub struct EventBus {
    captures: broadcast::Sender<CaptureNotice>,
    deliveries: broadcast::Sender<DeliveryPayload>,
}

/// A subscription result pushed to a `topic://` destination.
#[derive(Debug, Clone)]
pub struct DeliveryPayload {
    pub topic: String,
    pub subscription: String,
    pub body: String,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (captures, _) = broadcast::channel(capacity);
        let (deliveries, _) = broadcast::channel(capacity);
        EventBus {
            captures,
            deliveries,
        }
    }

    pub fn publish_capture(&self, notice: CaptureNotice) {
        // Err means no live receivers, which is fine.
        let _ = self.captures.send(notice);
    }

    pub fn subscribe_captures(&self) -> broadcast::Receiver<CaptureNotice> {
        self.captures.subscribe()
    }

    pub fn publish_delivery(&self, payload: DeliveryPayload) {
        let _ = self.deliveries.send(payload);
    }

    pub fn subscribe_deliveries(&self) -> broadcast::Receiver<DeliveryPayload> {
        self.deliveries.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(1024)
    }
}
