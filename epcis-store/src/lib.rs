//! Storage contract and backends.
//!
//! The contract is engine-agnostic: persistence of capture aggregates,
//! two-phase query support, subscriptions, named queries, and the discovery
//! projections. `postgres` is the production backend; `memory` backs the
//! test suite and single-node dev setups.

pub mod memory;
pub mod postgres;
mod sql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use epcis_common::error::EpcisError;
use epcis_common::model::{Capture, NamedQuery, SchemaVersion, Subscription};
use epcis_query::engine::EventSource;

/// A capture envelope without its event bodies, for listings.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSummary {
    pub capture_id: Uuid,
    pub tenant_id: String,
    pub schema_version: SchemaVersion,
    pub document_time: Option<DateTime<Utc>>,
    pub record_time: Option<DateTime<Utc>>,
    pub event_count: usize,
}

/// Dimensions served by the discovery endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discovery {
    EventTypes,
    Epcs,
    BizSteps,
    BizLocations,
    ReadPoints,
    Dispositions,
}

/// The persistence surface of the repository.
///
/// Writes are transactional per call: `insert_capture` persists the whole
/// aggregate or nothing. Reads take NoTracking snapshots; hydrated
/// aggregates are plain values with no store affinity.
#[async_trait]
pub trait EventStore: EventSource {
    /// Persist a capture and everything it owns in one transaction,
    /// assigning storage ids. The caller has already set `record_time`.
    async fn insert_capture(
        &self,
        capture: &mut Capture,
        cancel: &CancellationToken,
    ) -> Result<(), EpcisError>;

    async fn get_capture(
        &self,
        tenant_id: &str,
        capture_id: Uuid,
    ) -> Result<Option<Capture>, EpcisError>;

    async fn list_captures(
        &self,
        tenant_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CaptureSummary>, EpcisError>;

    /// Distinct values of one discovery dimension, tenant-scoped, bounded.
    async fn distinct_values(
        &self,
        tenant_id: &str,
        dimension: Discovery,
        limit: usize,
    ) -> Result<Vec<String>, EpcisError>;

    async fn insert_named_query(&self, query: &NamedQuery) -> Result<(), EpcisError>;
    async fn get_named_query(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> Result<Option<NamedQuery>, EpcisError>;
    async fn list_named_queries(&self, tenant_id: &str) -> Result<Vec<NamedQuery>, EpcisError>;
    /// Returns whether anything was deleted.
    async fn delete_named_query(&self, tenant_id: &str, name: &str) -> Result<bool, EpcisError>;

    /// Create a subscription; fails `DuplicateName` if the tenant already
    /// has one by that name. Assigns the storage id.
    async fn insert_subscription(&self, subscription: &mut Subscription)
        -> Result<(), EpcisError>;
    async fn list_subscriptions(&self, tenant_id: &str) -> Result<Vec<Subscription>, EpcisError>;
    /// Active subscriptions across all tenants, for engine startup.
    async fn all_active_subscriptions(&self) -> Result<Vec<Subscription>, EpcisError>;
    async fn delete_subscription(&self, tenant_id: &str, name: &str) -> Result<bool, EpcisError>;

    /// Advance the delivery cursor. Cursor moves are monotonic: a value
    /// behind the stored watermark is ignored.
    async fn advance_subscription_cursor(
        &self,
        subscription_id: i64,
        to: DateTime<Utc>,
    ) -> Result<(), EpcisError>;

    /// Record a delivery failure for operators; does not deactivate.
    async fn record_subscription_error(
        &self,
        subscription_id: i64,
        error: &str,
    ) -> Result<(), EpcisError>;
}
