//! Outbound delivery of subscription results: HTTP webhooks and in-process
//! stream topics, with retryable/permanent failure classification.

use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use reqwest::header;

use epcis_common::bus::{DeliveryPayload, EventBus};
use epcis_common::model::Subscription;

/// Destination prefix for in-process stream deliveries.
pub const TOPIC_SCHEME: &str = "topic://";

#[derive(Debug)]
pub enum DeliveryError {
    /// Transient: network failure, 429, or 5xx. Worth retrying.
    Retryable {
        message: String,
        retry_after: Option<Duration>,
    },
    /// Permanent: bad destination or a 4xx. Retrying cannot help.
    Permanent { message: String },
}

impl DeliveryError {
    pub fn message(&self) -> &str {
        match self {
            DeliveryError::Retryable { message, .. } => message,
            DeliveryError::Permanent { message } => message,
        }
    }
}

/// One delivery attempt to a subscription's destination.
#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(&self, subscription: &Subscription, body: &str)
        -> Result<(), DeliveryError>;
}

/// Production deliverer: webhooks over reqwest, `topic://` destinations over
/// the in-process bus.
pub struct WebhookDeliverer {
    client: reqwest::Client,
    bus: EventBus,
}

impl WebhookDeliverer {
    pub fn new(bus: EventBus, request_timeout: Duration) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("epcis-repository-subscriptions")
            .timeout(request_timeout)
            .build()
            .expect("reqwest client builds with static configuration");
        WebhookDeliverer { client, bus }
    }
}

#[async_trait]
impl Deliverer for WebhookDeliverer {
    async fn deliver(
        &self,
        subscription: &Subscription,
        body: &str,
    ) -> Result<(), DeliveryError> {
        if let Some(topic) = subscription.destination.strip_prefix(TOPIC_SCHEME) {
            self.bus.publish_delivery(DeliveryPayload {
                topic: topic.to_owned(),
                subscription: subscription.name.clone(),
                body: body.to_owned(),
            });
            return Ok(());
        }

        let url: reqwest::Url =
            subscription
                .destination
                .parse()
                .map_err(|e| DeliveryError::Permanent {
                    message: format!("invalid destination url: {e}"),
                })?;

        let response = self
            .client
            .post(url)
            .body(body.to_owned())
            .send()
            .await
            .map_err(|e| DeliveryError::Retryable {
                message: e.to_string(),
                retry_after: None,
            })?;

        let retry_after = parse_retry_after(response.headers());
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if is_retryable_status(status) {
            Err(DeliveryError::Retryable {
                message: format!("destination answered {status}"),
                retry_after,
            })
        } else {
            Err(DeliveryError::Permanent {
                message: format!("destination answered {status}"),
            })
        }
    }
}

pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Retry-After as seconds or an HTTP date; absent or unreadable is None.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    if let Ok(at) = chrono::DateTime::parse_from_rfc2822(value) {
        let delta = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
        return delta.to_std().ok();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use epcis_common::model::SubscriptionTrigger;

    fn topic_subscription(destination: &str) -> Subscription {
        Subscription {
            id: 1,
            name: "s".to_owned(),
            query_name: "q".to_owned(),
            parameters: vec![],
            destination: destination.to_owned(),
            tenant_id: "tenant-a".to_owned(),
            report_if_empty: false,
            initial_record_time: None,
            last_executed_time: None,
            trigger: SubscriptionTrigger::OnCapture,
            active: true,
            last_error: None,
        }
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn retry_after_seconds_and_absence() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "120".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(120)));

        headers.remove(reqwest::header::RETRY_AFTER);
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(reqwest::header::RETRY_AFTER, "garbage".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[tokio::test]
    async fn topic_destinations_publish_on_the_bus() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe_deliveries();
        let deliverer = WebhookDeliverer::new(bus.clone(), Duration::from_secs(5));

        deliverer
            .deliver(&topic_subscription("topic://cold-chain"), "{\"x\":1}")
            .await
            .unwrap();

        let payload = rx.recv().await.unwrap();
        assert_eq!(payload.topic, "cold-chain");
        assert_eq!(payload.subscription, "s");
        assert_eq!(payload.body, "{\"x\":1}");
    }

    #[tokio::test]
    async fn invalid_destination_is_permanent() {
        let bus = EventBus::new(8);
        let deliverer = WebhookDeliverer::new(bus, Duration::from_secs(5));
        let err = deliverer
            .deliver(&topic_subscription("not a url"), "{}")
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Permanent { .. }));
    }
}
