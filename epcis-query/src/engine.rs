//! Two-phase query execution: select matching ids under the filter chain,
//! then hydrate exactly those aggregates, preserving phase-1 order.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use epcis_common::error::EpcisError;
use epcis_common::model::Event;

use crate::cursor::{decode_token, encode_token, PageCursor};
use crate::eval::order_value;
use crate::params;
use crate::predicate::{OrderDirection, Predicate, QueryPlan};

/// The storage surface phase 1 and phase 2 run against.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Event primary keys matching the plan's filter chain, in the plan's
    /// order, at most `limit` of them.
    async fn event_ids_matching(
        &self,
        plan: &QueryPlan,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<i64>, EpcisError>;

    /// Full aggregates for the given ids. Order of the result is not
    /// guaranteed; the engine restores phase-1 order itself.
    async fn hydrate_events(
        &self,
        ids: &[i64],
        cancel: &CancellationToken,
    ) -> Result<Vec<Event>, EpcisError>;
}

/// The caller identity a query runs under.
#[derive(Debug, Clone)]
pub struct QueryIdentity {
    pub tenant_id: String,
    /// Explicitly-configured bypass of the tenant filter.
    pub super_user: bool,
}

impl QueryIdentity {
    pub fn tenant(tenant_id: impl Into<String>) -> Self {
        QueryIdentity {
            tenant_id: tenant_id.into(),
            super_user: false,
        }
    }
}

#[derive(Debug)]
pub struct QueryOutcome {
    pub events: Vec<Event>,
    pub next_page_token: Option<String>,
}

/// Stateless query engine: parses parameters, enforces tenancy and caps,
/// runs the two phases, emits the next-page cursor.
pub struct QueryEngine<S: EventSource> {
    source: Arc<S>,
    max_events_returned: usize,
    pagination_secret: Vec<u8>,
}

impl<S: EventSource> QueryEngine<S> {
    pub fn new(source: Arc<S>, max_events_returned: usize, pagination_secret: &[u8]) -> Self {
        QueryEngine {
            source,
            max_events_returned,
            pagination_secret: pagination_secret.to_vec(),
        }
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    #[instrument(skip_all, fields(tenant = %identity.tenant_id, params = parameters.len()))]
    pub async fn execute(
        &self,
        identity: &QueryIdentity,
        parameters: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<QueryOutcome, EpcisError> {
        let (mut plan, page_token) = params::parse(parameters)?;

        if !identity.super_user {
            plan.enforce_tenant(&identity.tenant_id);
        }

        if let Some(token) = &page_token {
            let cursor = decode_token(token, &self.pagination_secret)?;
            if cursor.order_key != plan.order_key {
                return Err(EpcisError::InvalidParameterValue {
                    name: "nextPageToken".to_owned(),
                    reason: "token ordering does not match the query".to_owned(),
                });
            }
            plan.predicates.push(Predicate::PageBoundary {
                key: cursor.order_key,
                time: cursor.order_value,
                id: cursor.id,
                direction: plan.direction,
            });
        }

        self.run_plan(plan, cancel).await
    }

    /// Execute an already-built plan (used by the subscription engine, which
    /// augments a frozen parameter set with its cursor).
    pub async fn run_plan(
        &self,
        plan: QueryPlan,
        cancel: &CancellationToken,
    ) -> Result<QueryOutcome, EpcisError> {
        if cancel.is_cancelled() {
            return Err(EpcisError::Canceled);
        }

        // The page size is the tightest client-facing bound; fetch one extra
        // row to tell "more available" from "exactly at the bound".
        let mut bound = self.max_events_returned;
        for candidate in [plan.event_count_limit, plan.max_event_count, plan.per_page]
            .into_iter()
            .flatten()
        {
            bound = bound.min(candidate);
        }
        let fetch = bound + 1;

        let ids = self.source.event_ids_matching(&plan, fetch, cancel).await?;
        let more_available = ids.len() > bound;
        metrics::counter!("query_phase1_ids_total").increment(ids.len() as u64);

        if more_available {
            // A result set the caps would cut off: eventCountLimit and the
            // hard cap fail loudly, maxEventCount and perPage truncate.
            if let Some(limit) = plan.event_count_limit {
                if bound == limit {
                    return Err(EpcisError::QueryTooLarge);
                }
            }
            if plan.max_event_count.is_none()
                && plan.per_page.is_none()
                && bound == self.max_events_returned
            {
                return Err(EpcisError::QueryTooLarge);
            }
        }

        let page_ids = &ids[..ids.len().min(bound)];

        if cancel.is_cancelled() {
            return Err(EpcisError::Canceled);
        }

        let hydrated = self.source.hydrate_events(page_ids, cancel).await?;

        // Restore phase-1 order with an id -> position map.
        let position: HashMap<i64, usize> = page_ids
            .iter()
            .enumerate()
            .map(|(pos, id)| (*id, pos))
            .collect();
        let mut events = hydrated;
        events.sort_by_key(|e| position.get(&e.id).copied().unwrap_or(usize::MAX));

        let next_page_token = if more_available && plan.per_page.is_some() {
            events.last().map(|last| {
                encode_token(
                    &PageCursor {
                        order_key: plan.order_key,
                        order_value: order_value(last, plan.order_key),
                        id: last.id,
                    },
                    &self.pagination_secret,
                )
            })
        } else {
            None
        };

        metrics::counter!("query_events_returned_total").increment(events.len() as u64);

        Ok(QueryOutcome {
            events,
            next_page_token,
        })
    }
}

/// Build the plan a subscription run uses: the frozen parameters plus a
/// `GT_recordTime` watermark, ordered by record time ascending.
pub fn subscription_plan(
    parameters: &[(String, String)],
    cursor: Option<chrono::DateTime<chrono::Utc>>,
    tenant_id: &str,
) -> Result<QueryPlan, EpcisError> {
    let (mut plan, _) = params::parse(parameters)?;
    plan.order_key = crate::predicate::OrderKey::RecordTime;
    plan.direction = OrderDirection::Asc;
    if let Some(watermark) = cursor {
        plan.predicates.push(Predicate::Scalar {
            field: crate::predicate::ScalarField::RecordTime,
            cmp: crate::predicate::Comparator::Gt,
            value: crate::predicate::CmpValue::Time(watermark),
        });
    }
    plan.enforce_tenant(tenant_id);
    Ok(plan)
}
