//! Postgres backend over sqlx.
//!
//! Phase-1 selection runs the translated filter chain (see [`crate::sql`]);
//! hydration reads the JSONB aggregate snapshots back. Capture persistence
//! is one transaction covering the capture row, every event, and every
//! owned child row.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use epcis_common::error::EpcisError;
use epcis_common::model::{
    Capture, Event, NamedQuery, SchemaVersion, Subscription, SubscriptionTrigger,
};
use epcis_query::engine::EventSource;
use epcis_query::predicate::{CmpValue, Comparator, Predicate, QueryPlan, ScalarField};

use crate::sql::build_id_query;
use crate::{CaptureSummary, Discovery, EventStore};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and run pending migrations.
    pub async fn connect(database_url: &str, command_timeout: Duration) -> Result<Self, EpcisError> {
        let pool = PgPoolOptions::new()
            .acquire_timeout(command_timeout)
            .connect(database_url)
            .await
            .map_err(EpcisError::storage)?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(EpcisError::storage)?;
        Ok(PgStore { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        PgStore { pool }
    }

    /// Replace `WithDescendants` predicates with equality over the resolved
    /// descendant sets, walking the masterdata children edges recursively.
    async fn expand_plan(&self, plan: &QueryPlan) -> Result<QueryPlan, EpcisError> {
        let tenant = plan.predicates.iter().find_map(|p| match p {
            Predicate::TenantIs(t) => Some(t.clone()),
            _ => None,
        });

        let mut expanded = plan.clone();
        for predicate in &mut expanded.predicates {
            if let Predicate::WithDescendants { field, roots } = predicate {
                let ids = self.descendants_of(tenant.as_deref(), roots).await?;
                *predicate = Predicate::Scalar {
                    field: match field {
                        epcis_query::predicate::LocationField::ReadPoint => ScalarField::ReadPoint,
                        epcis_query::predicate::LocationField::BizLocation => {
                            ScalarField::BizLocation
                        }
                    },
                    cmp: Comparator::Eq,
                    value: CmpValue::Text(ids),
                };
            }
        }
        Ok(expanded)
    }

    async fn descendants_of(
        &self,
        tenant: Option<&str>,
        roots: &[String],
    ) -> Result<Vec<String>, EpcisError> {
        let rows = sqlx::query(
            r#"
WITH RECURSIVE descendants (id) AS (
    SELECT unnest($1::text[])
    UNION
    SELECT child.value #>> '{}'
    FROM masterdata m
    JOIN descendants d ON m.element_id = d.id
    CROSS JOIN LATERAL jsonb_array_elements(m.children) AS child
    WHERE $2::text IS NULL OR m.tenant_id = $2
)
SELECT DISTINCT id FROM descendants
            "#,
        )
        .bind(roots)
        .bind(tenant)
        .fetch_all(&self.pool)
        .await
        .map_err(EpcisError::storage)?;

        Ok(rows.iter().map(|r| r.get::<String, _>("id")).collect())
    }
}

#[async_trait]
impl EventSource for PgStore {
    async fn event_ids_matching(
        &self,
        plan: &QueryPlan,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<i64>, EpcisError> {
        if cancel.is_cancelled() {
            return Err(EpcisError::Canceled);
        }
        let expanded = self.expand_plan(plan).await?;
        let mut query = build_id_query(&expanded, limit);

        let rows = tokio::select! {
            rows = query.build().fetch_all(&self.pool) => rows.map_err(EpcisError::storage)?,
            _ = cancel.cancelled() => return Err(EpcisError::Canceled),
        };
        Ok(rows.iter().map(|r| r.get::<i64, _>(0)).collect())
    }

    async fn hydrate_events(
        &self,
        ids: &[i64],
        cancel: &CancellationToken,
    ) -> Result<Vec<Event>, EpcisError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let fetch = sqlx::query("SELECT payload FROM events WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool);
        let rows = tokio::select! {
            rows = fetch => rows.map_err(EpcisError::storage)?,
            _ = cancel.cancelled() => return Err(EpcisError::Canceled),
        };

        rows.iter()
            .map(|row| {
                let payload: serde_json::Value = row.get("payload");
                serde_json::from_value(payload).map_err(EpcisError::storage)
            })
            .collect()
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn insert_capture(
        &self,
        capture: &mut Capture,
        cancel: &CancellationToken,
    ) -> Result<(), EpcisError> {
        let record_time = capture.record_time.ok_or_else(|| {
            EpcisError::storage(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "capture reached the store without a record time",
            ))
        })?;
        let mut tx = self.pool.begin().await.map_err(EpcisError::storage)?;

        let capture_pk: i64 = sqlx::query_scalar(
            r#"
INSERT INTO captures
    (capture_id, tenant_id, schema_version, document_time, record_time,
     standard_business_header, subscription_correlation, namespaces, event_count)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
RETURNING id
            "#,
        )
        .bind(capture.capture_id)
        .bind(&capture.tenant_id)
        .bind(capture.schema_version.as_str())
        .bind(capture.document_time)
        .bind(record_time)
        .bind(&capture.standard_business_header)
        .bind(&capture.subscription_correlation)
        .bind(serde_json::to_value(&capture.namespaces).map_err(EpcisError::storage)?)
        .bind(capture.events.len() as i32)
        .fetch_one(&mut *tx)
        .await
        .map_err(EpcisError::storage)?;
        capture.id = capture_pk;

        for event in &mut capture.events {
            if cancel.is_cancelled() {
                // Dropping the open transaction rolls everything back.
                return Err(EpcisError::Canceled);
            }
            event.record_time = Some(record_time);

            let event_pk: i64 = sqlx::query_scalar(
                r#"
INSERT INTO events
    (capture_pk, tenant_id, event_type, event_id, event_time, record_time,
     action, business_step, disposition, read_point, business_location,
     transformation_id, certification_info, corrective_declaration_time,
     corrective_reason, corrective_event_ids)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
RETURNING id
                "#,
            )
            .bind(capture_pk)
            .bind(&capture.tenant_id)
            .bind(event.event_type.as_str())
            .bind(&event.event_id)
            .bind(event.event_time)
            .bind(record_time)
            .bind(event.action.map(|a| a.as_str()))
            .bind(&event.business_step)
            .bind(&event.disposition)
            .bind(&event.read_point)
            .bind(&event.business_location)
            .bind(&event.transformation_id)
            .bind(&event.certification_info)
            .bind(event.corrective_declaration_time)
            .bind(&event.corrective_reason)
            .bind(serde_json::to_value(&event.corrective_event_ids).map_err(EpcisError::storage)?)
            .fetch_one(&mut *tx)
            .await
            .map_err(EpcisError::storage)?;
            event.id = event_pk;

            for epc in &event.epcs {
                sqlx::query(
                    "INSERT INTO event_epcs (event_pk, epc_type, epc_id, quantity, uom)
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(event_pk)
                .bind(epc.epc_type.as_str())
                .bind(&epc.id)
                .bind(epc.quantity)
                .bind(&epc.unit_of_measure)
                .execute(&mut *tx)
                .await
                .map_err(EpcisError::storage)?;
            }

            for field in &event.fields {
                sqlx::query(
                    r#"
INSERT INTO event_fields
    (event_pk, kind, idx, parent_idx, entity_idx, namespace, name,
     text_value, numeric_value, date_value)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                    "#,
                )
                .bind(event_pk)
                .bind(field.kind.as_str())
                .bind(field.index)
                .bind(field.parent_index)
                .bind(field.entity_index)
                .bind(&field.namespace)
                .bind(&field.name)
                .bind(&field.text_value)
                .bind(field.numeric_value)
                .bind(field.date_value)
                .execute(&mut *tx)
                .await
                .map_err(EpcisError::storage)?;
            }

            for element in &event.sensor_elements {
                for report in &element.reports {
                    sqlx::query(
                        r#"
INSERT INTO sensor_reports
    (event_pk, sensor_index, report_type, device_id, raw_data,
     data_processing_method, report_time, microorganism, chemical_substance,
     value, string_value, boolean_value, hex_binary_value, uri_value,
     min_value, max_value, mean_value, s_dev, perc_rank, perc_value, uom,
     component)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
        $16, $17, $18, $19, $20, $21, $22)
                        "#,
                    )
                    .bind(event_pk)
                    .bind(report.sensor_index)
                    .bind(&report.report_type)
                    .bind(&report.device_id)
                    .bind(&report.raw_data)
                    .bind(&report.data_processing_method)
                    .bind(report.time)
                    .bind(&report.microorganism)
                    .bind(&report.chemical_substance)
                    .bind(report.value)
                    .bind(&report.string_value)
                    .bind(report.boolean_value)
                    .bind(&report.hex_binary_value)
                    .bind(&report.uri_value)
                    .bind(report.min_value)
                    .bind(report.max_value)
                    .bind(report.mean_value)
                    .bind(report.s_dev)
                    .bind(report.perc_rank)
                    .bind(report.perc_value)
                    .bind(&report.uom)
                    .bind(&report.component)
                    .execute(&mut *tx)
                    .await
                    .map_err(EpcisError::storage)?;
                }
            }

            let payload = serde_json::to_value(&*event).map_err(EpcisError::storage)?;
            sqlx::query("UPDATE events SET payload = $1 WHERE id = $2")
                .bind(payload)
                .bind(event_pk)
                .execute(&mut *tx)
                .await
                .map_err(EpcisError::storage)?;
        }

        for md in &capture.masterdata {
            let mut attributes = serde_json::Map::new();
            for attr in &md.attributes {
                attributes.insert(attr.name.clone(), serde_json::Value::String(attr.value.clone()));
            }
            sqlx::query(
                r#"
INSERT INTO masterdata (capture_pk, tenant_id, vocabulary_type, element_id, attributes, children)
VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(capture_pk)
            .bind(&capture.tenant_id)
            .bind(&md.vocabulary_type)
            .bind(&md.id)
            .bind(serde_json::Value::Object(attributes))
            .bind(serde_json::to_value(&md.children).map_err(EpcisError::storage)?)
            .execute(&mut *tx)
            .await
            .map_err(EpcisError::storage)?;
        }

        if cancel.is_cancelled() {
            return Err(EpcisError::Canceled);
        }
        tx.commit().await.map_err(EpcisError::storage)?;
        Ok(())
    }

    async fn get_capture(
        &self,
        tenant_id: &str,
        capture_id: Uuid,
    ) -> Result<Option<Capture>, EpcisError> {
        let row = sqlx::query(
            "SELECT * FROM captures WHERE tenant_id = $1 AND capture_id = $2",
        )
        .bind(tenant_id)
        .bind(capture_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(EpcisError::storage)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let capture_pk: i64 = row.get("id");
        let mut capture = capture_from_row(&row)?;

        let event_rows = sqlx::query(
            "SELECT payload FROM events WHERE capture_pk = $1 ORDER BY id",
        )
        .bind(capture_pk)
        .fetch_all(&self.pool)
        .await
        .map_err(EpcisError::storage)?;
        capture.events = event_rows
            .iter()
            .map(|r| {
                let payload: serde_json::Value = r.get("payload");
                serde_json::from_value(payload).map_err(EpcisError::storage)
            })
            .collect::<Result<Vec<Event>, _>>()?;

        Ok(Some(capture))
    }

    async fn list_captures(
        &self,
        tenant_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CaptureSummary>, EpcisError> {
        let rows = sqlx::query(
            r#"
SELECT capture_id, tenant_id, schema_version, document_time, record_time, event_count
FROM captures WHERE tenant_id = $1 ORDER BY id LIMIT $2 OFFSET $3
            "#,
        )
        .bind(tenant_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(EpcisError::storage)?;

        rows.iter()
            .map(|row| {
                Ok(CaptureSummary {
                    capture_id: row.get("capture_id"),
                    tenant_id: row.get("tenant_id"),
                    schema_version: parse_version(row.get("schema_version"))?,
                    document_time: row.get("document_time"),
                    record_time: row.get("record_time"),
                    event_count: row.get::<i32, _>("event_count") as usize,
                })
            })
            .collect()
    }

    async fn distinct_values(
        &self,
        tenant_id: &str,
        dimension: Discovery,
        limit: usize,
    ) -> Result<Vec<String>, EpcisError> {
        let sql = match dimension {
            Discovery::EventTypes => {
                "SELECT DISTINCT event_type AS v FROM events WHERE tenant_id = $1 ORDER BY v LIMIT $2"
            }
            Discovery::Epcs => {
                "SELECT DISTINCT x.epc_id AS v FROM event_epcs x JOIN events e ON e.id = x.event_pk
                 WHERE e.tenant_id = $1 ORDER BY v LIMIT $2"
            }
            Discovery::BizSteps => {
                "SELECT DISTINCT business_step AS v FROM events
                 WHERE tenant_id = $1 AND business_step IS NOT NULL ORDER BY v LIMIT $2"
            }
            Discovery::BizLocations => {
                "SELECT DISTINCT business_location AS v FROM events
                 WHERE tenant_id = $1 AND business_location IS NOT NULL ORDER BY v LIMIT $2"
            }
            Discovery::ReadPoints => {
                "SELECT DISTINCT read_point AS v FROM events
                 WHERE tenant_id = $1 AND read_point IS NOT NULL ORDER BY v LIMIT $2"
            }
            Discovery::Dispositions => {
                "SELECT DISTINCT disposition AS v FROM events
                 WHERE tenant_id = $1 AND disposition IS NOT NULL ORDER BY v LIMIT $2"
            }
        };
        let rows = sqlx::query(sql)
            .bind(tenant_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(EpcisError::storage)?;
        Ok(rows.iter().map(|r| r.get::<String, _>("v")).collect())
    }

    async fn insert_named_query(&self, query: &NamedQuery) -> Result<(), EpcisError> {
        let result = sqlx::query(
            "INSERT INTO named_queries (tenant_id, name, parameters, created_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(&query.tenant_id)
        .bind(&query.name)
        .bind(serde_json::to_value(&query.parameters).map_err(EpcisError::storage)?)
        .bind(query.created_at)
        .execute(&self.pool)
        .await;
        map_unique_violation(result, &query.name)
    }

    async fn get_named_query(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> Result<Option<NamedQuery>, EpcisError> {
        let row = sqlx::query(
            "SELECT tenant_id, name, parameters, created_at FROM named_queries
             WHERE tenant_id = $1 AND name = $2",
        )
        .bind(tenant_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(EpcisError::storage)?;
        row.map(|r| named_query_from_row(&r)).transpose()
    }

    async fn list_named_queries(&self, tenant_id: &str) -> Result<Vec<NamedQuery>, EpcisError> {
        let rows = sqlx::query(
            "SELECT tenant_id, name, parameters, created_at FROM named_queries
             WHERE tenant_id = $1 ORDER BY name",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(EpcisError::storage)?;
        rows.iter().map(named_query_from_row).collect()
    }

    async fn delete_named_query(&self, tenant_id: &str, name: &str) -> Result<bool, EpcisError> {
        let result = sqlx::query("DELETE FROM named_queries WHERE tenant_id = $1 AND name = $2")
            .bind(tenant_id)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(EpcisError::storage)?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_subscription(
        &self,
        subscription: &mut Subscription,
    ) -> Result<(), EpcisError> {
        let (trigger_kind, cron_expression) = match &subscription.trigger {
            SubscriptionTrigger::OnCapture => ("capture", None),
            SubscriptionTrigger::OnSchedule(expr) => ("schedule", Some(expr.clone())),
        };
        let result = sqlx::query_scalar::<_, i64>(
            r#"
INSERT INTO subscriptions
    (tenant_id, name, query_name, parameters, destination, report_if_empty,
     initial_record_time, last_executed_time, trigger_kind, cron_expression,
     active, last_error)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
RETURNING id
            "#,
        )
        .bind(&subscription.tenant_id)
        .bind(&subscription.name)
        .bind(&subscription.query_name)
        .bind(serde_json::to_value(&subscription.parameters).map_err(EpcisError::storage)?)
        .bind(&subscription.destination)
        .bind(subscription.report_if_empty)
        .bind(subscription.initial_record_time)
        .bind(subscription.last_executed_time)
        .bind(trigger_kind)
        .bind(cron_expression)
        .bind(subscription.active)
        .bind(&subscription.last_error)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(id) => {
                subscription.id = id;
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => {
                Err(EpcisError::DuplicateName(subscription.name.clone()))
            }
            Err(e) => Err(EpcisError::storage(e)),
        }
    }

    async fn list_subscriptions(&self, tenant_id: &str) -> Result<Vec<Subscription>, EpcisError> {
        let rows = sqlx::query("SELECT * FROM subscriptions WHERE tenant_id = $1 ORDER BY name")
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await
            .map_err(EpcisError::storage)?;
        rows.iter().map(subscription_from_row).collect()
    }

    async fn all_active_subscriptions(&self) -> Result<Vec<Subscription>, EpcisError> {
        let rows = sqlx::query("SELECT * FROM subscriptions WHERE active ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(EpcisError::storage)?;
        rows.iter().map(subscription_from_row).collect()
    }

    async fn delete_subscription(&self, tenant_id: &str, name: &str) -> Result<bool, EpcisError> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE tenant_id = $1 AND name = $2")
            .bind(tenant_id)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(EpcisError::storage)?;
        Ok(result.rows_affected() > 0)
    }

    async fn advance_subscription_cursor(
        &self,
        subscription_id: i64,
        to: DateTime<Utc>,
    ) -> Result<(), EpcisError> {
        sqlx::query(
            r#"
UPDATE subscriptions
SET last_executed_time = GREATEST(COALESCE(last_executed_time, 'epoch'::timestamptz), $2),
    last_error = NULL
WHERE id = $1
            "#,
        )
        .bind(subscription_id)
        .bind(to)
        .execute(&self.pool)
        .await
        .map_err(EpcisError::storage)?;
        Ok(())
    }

    async fn record_subscription_error(
        &self,
        subscription_id: i64,
        error: &str,
    ) -> Result<(), EpcisError> {
        sqlx::query("UPDATE subscriptions SET last_error = $2 WHERE id = $1")
            .bind(subscription_id)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(EpcisError::storage)?;
        Ok(())
    }
}

fn capture_from_row(row: &PgRow) -> Result<Capture, EpcisError> {
    let namespaces: serde_json::Value = row.get("namespaces");
    Ok(Capture {
        id: row.get("id"),
        capture_id: row.get("capture_id"),
        tenant_id: row.get("tenant_id"),
        schema_version: parse_version(row.get("schema_version"))?,
        document_time: row.get("document_time"),
        record_time: row.get("record_time"),
        standard_business_header: row.get("standard_business_header"),
        subscription_correlation: row.get("subscription_correlation"),
        namespaces: serde_json::from_value(namespaces).unwrap_or_default(),
        events: Vec::new(),
        masterdata: Vec::new(),
    })
}

fn named_query_from_row(row: &PgRow) -> Result<NamedQuery, EpcisError> {
    let parameters: serde_json::Value = row.get("parameters");
    Ok(NamedQuery {
        tenant_id: row.get("tenant_id"),
        name: row.get("name"),
        parameters: serde_json::from_value(parameters).map_err(EpcisError::storage)?,
        created_at: row.get("created_at"),
    })
}

fn subscription_from_row(row: &PgRow) -> Result<Subscription, EpcisError> {
    let parameters: serde_json::Value = row.get("parameters");
    let trigger = match row.get::<&str, _>("trigger_kind") {
        "schedule" => SubscriptionTrigger::OnSchedule(
            row.get::<Option<String>, _>("cron_expression").unwrap_or_default(),
        ),
        _ => SubscriptionTrigger::OnCapture,
    };
    Ok(Subscription {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        name: row.get("name"),
        query_name: row.get("query_name"),
        parameters: serde_json::from_value(parameters).map_err(EpcisError::storage)?,
        destination: row.get("destination"),
        report_if_empty: row.get("report_if_empty"),
        initial_record_time: row.get("initial_record_time"),
        last_executed_time: row.get("last_executed_time"),
        trigger,
        active: row.get("active"),
        last_error: row.get("last_error"),
    })
}

fn parse_version(text: &str) -> Result<SchemaVersion, EpcisError> {
    text.parse()
}

fn map_unique_violation(
    result: Result<sqlx::postgres::PgQueryResult, sqlx::Error>,
    name: &str,
) -> Result<(), EpcisError> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(EpcisError::DuplicateName(name.to_owned())),
        Err(e) => Err(EpcisError::storage(e)),
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}
