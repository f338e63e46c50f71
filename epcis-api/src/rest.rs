//! EPCIS 2.0 REST handlers.

use axum::extract::{Path, Query, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use epcis_common::error::EpcisError;
use epcis_common::model::{NamedQuery, Subscription, SubscriptionTrigger};
use epcis_format::{json as json_format, xml as xml_format, DocumentFormat};
use epcis_query::engine::QueryIdentity;
use epcis_store::{Discovery, EventStore};

use crate::auth::authenticate;
use crate::errors::ApiError;
use crate::router::AppState;

/// Whether the Accept header asks for XML; JSON is the default.
fn wants_xml(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("xml"))
        .unwrap_or(false)
}

fn identity<S: EventStore>(
    state: &AppState<S>,
    headers: &HeaderMap,
) -> Result<QueryIdentity, ApiError> {
    Ok(authenticate(headers, &state.0.super_tenants)?)
}

#[instrument(skip_all, fields(content_type, bytes = body.len()))]
pub async fn capture_post<S: EventStore>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let identity = identity(&state, &headers)?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    tracing::Span::current().record("content_type", content_type);
    let format = DocumentFormat::from_content_type(content_type)?;

    let mut capture = epcis_format::decode(&body, format, state.0.capture_size_limit)?;
    capture.tenant_id = identity.tenant_id;

    let stored = state
        .0
        .capture
        .store(capture, &CancellationToken::new())
        .await?;

    let location = format!("/capture/{}", stored.capture_id);
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        Json(json!({ "captureID": stored.capture_id })),
    )
        .into_response())
}

#[derive(Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub page: usize,
    #[serde(rename = "perPage")]
    pub per_page: Option<usize>,
}

pub async fn capture_list<S: EventStore>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Response, ApiError> {
    let identity = identity(&state, &headers)?;
    let per_page = params.per_page.unwrap_or(30).min(1000);
    let summaries = state
        .0
        .store
        .list_captures(&identity.tenant_id, per_page, params.page * per_page)
        .await?;

    let body: Vec<Value> = summaries
        .iter()
        .map(|s| {
            json!({
                "captureID": s.capture_id,
                "schemaVersion": s.schema_version.as_str(),
                "documentTime": s.document_time.map(|t| t.to_rfc3339()),
                "recordTime": s.record_time.map(|t| t.to_rfc3339()),
                "eventCount": s.event_count,
            })
        })
        .collect();
    Ok(Json(body).into_response())
}

pub async fn capture_get<S: EventStore>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    Path(capture_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let identity = identity(&state, &headers)?;
    let capture = state
        .0
        .store
        .get_capture(&identity.tenant_id, capture_id)
        .await?
        .ok_or_else(|| EpcisError::NoSuchCapture(capture_id.to_string()))?;

    if wants_xml(&headers) {
        Ok(xml_response(xml_format::encode::encode_document(&capture)))
    } else {
        Ok(json_response(json_format::encode::encode_document(
            &capture,
        )))
    }
}

#[instrument(skip_all)]
pub async fn events_get<S: EventStore>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    let identity = identity(&state, &headers)?;
    let parameters = parse_query_string(raw.as_deref().unwrap_or(""))?;

    let outcome = state
        .0
        .query
        .execute(&identity, &parameters, &CancellationToken::new())
        .await?;

    respond_with_results(&headers, &outcome.events, "SimpleEventQuery", None, outcome.next_page_token)
}

async fn discovery<S: EventStore>(
    state: AppState<S>,
    headers: HeaderMap,
    dimension: Discovery,
) -> Result<Response, ApiError> {
    let identity = identity(&state, &headers)?;
    let values = state
        .0
        .store
        .distinct_values(&identity.tenant_id, dimension, state.0.discovery_limit)
        .await?;
    Ok(Json(values).into_response())
}

macro_rules! discovery_handler {
    ($name:ident, $dimension:expr) => {
        pub async fn $name<S: EventStore>(
            State(state): State<AppState<S>>,
            headers: HeaderMap,
        ) -> Result<Response, ApiError> {
            discovery(state, headers, $dimension).await
        }
    };
}

discovery_handler!(event_types, Discovery::EventTypes);
discovery_handler!(epcs, Discovery::Epcs);
discovery_handler!(biz_steps, Discovery::BizSteps);
discovery_handler!(biz_locations, Discovery::BizLocations);
discovery_handler!(read_points, Discovery::ReadPoints);
discovery_handler!(dispositions, Discovery::Dispositions);

/// Body of `POST /queries`: a name plus the frozen parameter object.
#[derive(Deserialize)]
pub struct CreateQueryBody {
    pub name: String,
    #[serde(default)]
    pub query: serde_json::Map<String, Value>,
}

pub async fn query_create<S: EventStore>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    Json(body): Json<CreateQueryBody>,
) -> Result<Response, ApiError> {
    let identity = identity(&state, &headers)?;
    let parameters = parameters_from_json(&body.query)?;

    // Reject malformed parameter sets at creation, not first execution.
    epcis_query::params::parse(&parameters)?;

    let named = NamedQuery {
        name: body.name.clone(),
        tenant_id: identity.tenant_id,
        parameters,
        created_at: Utc::now(),
    };
    state.0.store.insert_named_query(&named).await?;

    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, format!("/queries/{}", body.name))],
    )
        .into_response())
}

pub async fn query_list<S: EventStore>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let identity = identity(&state, &headers)?;
    let queries = state.0.store.list_named_queries(&identity.tenant_id).await?;
    let body: Vec<Value> = queries.iter().map(named_query_json).collect();
    Ok(Json(body).into_response())
}

pub async fn query_get<S: EventStore>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let identity = identity(&state, &headers)?;
    let query = state
        .0
        .store
        .get_named_query(&identity.tenant_id, &name)
        .await?
        .ok_or(EpcisError::NoSuchQuery(name))?;
    Ok(Json(named_query_json(&query)).into_response())
}

pub async fn query_delete<S: EventStore>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let identity = identity(&state, &headers)?;
    if state
        .0
        .store
        .delete_named_query(&identity.tenant_id, &name)
        .await?
    {
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Err(EpcisError::NoSuchQuery(name).into())
    }
}

pub async fn query_events<S: EventStore>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    Path(name): Path<String>,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    let identity = identity(&state, &headers)?;
    let query = state
        .0
        .store
        .get_named_query(&identity.tenant_id, &name)
        .await?
        .ok_or_else(|| EpcisError::NoSuchQuery(name.clone()))?;

    // Frozen parameters first; pagination controls come from the request.
    let mut parameters = query.parameters.clone();
    parameters.extend(parse_query_string(raw.as_deref().unwrap_or(""))?);

    let outcome = state
        .0
        .query
        .execute(&identity, &parameters, &CancellationToken::new())
        .await?;

    respond_with_results(&headers, &outcome.events, &name, None, outcome.next_page_token)
}

/// Body of `POST /queries/{name}/subscriptions`.
#[derive(Deserialize)]
pub struct CreateSubscriptionBody {
    #[serde(default)]
    pub name: Option<String>,
    pub destination: String,
    /// Cron expression; absent means trigger-on-capture.
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default, rename = "reportIfEmpty")]
    pub report_if_empty: bool,
    #[serde(default, rename = "initialRecordTime")]
    pub initial_record_time: Option<DateTime<Utc>>,
}

pub async fn subscription_create<S: EventStore>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    Path(query_name): Path<String>,
    Json(body): Json<CreateSubscriptionBody>,
) -> Result<Response, ApiError> {
    let identity = identity(&state, &headers)?;
    let query = state
        .0
        .store
        .get_named_query(&identity.tenant_id, &query_name)
        .await?
        .ok_or_else(|| EpcisError::NoSuchQuery(query_name.clone()))?;

    let name = body
        .name
        .unwrap_or_else(|| Uuid::now_v7().to_string());
    let subscription = Subscription {
        id: 0,
        name: name.clone(),
        query_name,
        parameters: query.parameters,
        destination: body.destination,
        tenant_id: identity.tenant_id,
        report_if_empty: body.report_if_empty,
        initial_record_time: body.initial_record_time,
        last_executed_time: None,
        trigger: match body.schedule {
            Some(expression) => SubscriptionTrigger::OnSchedule(expression),
            None => SubscriptionTrigger::OnCapture,
        },
        active: true,
        last_error: None,
    };

    let stored = state.0.subscriptions.register(subscription).await?;
    Ok((
        StatusCode::CREATED,
        [(
            header::LOCATION,
            format!("/queries/{}/subscriptions/{}", stored.query_name, stored.name),
        )],
        Json(json!({ "subscriptionID": stored.name })),
    )
        .into_response())
}

pub async fn subscription_list<S: EventStore>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    Path(query_name): Path<String>,
) -> Result<Response, ApiError> {
    let identity = identity(&state, &headers)?;
    let subscriptions = state
        .0
        .store
        .list_subscriptions(&identity.tenant_id)
        .await?;
    let body: Vec<Value> = subscriptions
        .iter()
        .filter(|s| s.query_name == query_name)
        .map(|s| {
            json!({
                "subscriptionID": s.name,
                "destination": s.destination,
                "reportIfEmpty": s.report_if_empty,
                "lastExecutedTime": s.last_executed_time.map(|t| t.to_rfc3339()),
                "schedule": match &s.trigger {
                    SubscriptionTrigger::OnSchedule(expr) => Some(expr.clone()),
                    SubscriptionTrigger::OnCapture => None,
                },
                "active": s.active,
                "lastError": s.last_error,
            })
        })
        .collect();
    Ok(Json(body).into_response())
}

pub async fn subscription_delete<S: EventStore>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    Path((_query_name, subscription_name)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let identity = identity(&state, &headers)?;
    if state
        .0
        .subscriptions
        .unregister(&identity.tenant_id, &subscription_name)
        .await?
    {
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Err(EpcisError::NoSuchSubscription(subscription_name).into())
    }
}

/// Decode `?name=value&...` preserving repeats and order.
pub fn parse_query_string(raw: &str) -> Result<Vec<(String, String)>, EpcisError> {
    serde_urlencoded::from_str::<Vec<(String, String)>>(raw).map_err(|e| {
        EpcisError::InvalidParameterValue {
            name: "query".to_owned(),
            reason: e.to_string(),
        }
    })
}

/// Flatten a JSON parameter object to the grammar's `(name, value)` pairs.
/// Arrays become `|`-separated lists, scalars their string form.
pub fn parameters_from_json(
    object: &serde_json::Map<String, Value>,
) -> Result<Vec<(String, String)>, EpcisError> {
    let mut parameters = Vec::new();
    for (name, value) in object {
        let rendered = match value {
            Value::Array(items) => items
                .iter()
                .map(scalar_string)
                .collect::<Result<Vec<_>, _>>()?
                .join("|"),
            other => scalar_string(other)?,
        };
        parameters.push((name.clone(), rendered));
    }
    Ok(parameters)
}

fn scalar_string(value: &Value) -> Result<String, EpcisError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(EpcisError::InvalidParameterValue {
            name: "query".to_owned(),
            reason: format!("unsupported parameter value {other}"),
        }),
    }
}

fn named_query_json(query: &NamedQuery) -> Value {
    let object: serde_json::Map<String, Value> = query
        .parameters
        .iter()
        .map(|(name, value)| (name.clone(), Value::String(value.clone())))
        .collect();
    json!({
        "name": query.name,
        "query": object,
        "createdAt": query.created_at.to_rfc3339(),
    })
}

fn respond_with_results(
    headers: &HeaderMap,
    events: &[epcis_common::model::Event],
    query_name: &str,
    subscription_id: Option<&str>,
    next_page_token: Option<String>,
) -> Result<Response, ApiError> {
    let mut response = if wants_xml(headers) {
        xml_response(xml_format::encode::encode_query_results(
            events,
            epcis_common::model::SchemaVersion::V2_0,
            query_name,
            subscription_id,
        ))
    } else {
        json_response(json_format::encode::encode_query_results(
            events,
            query_name,
            subscription_id,
        ))
    };

    if let Some(token) = next_page_token {
        if let Ok(value) = format!("<?nextPageToken={token}>; rel=\"next\"").parse() {
            response.headers_mut().insert(header::LINK, value);
        }
    }
    Ok(response)
}

fn xml_response(body: String) -> Response {
    (
        [(header::CONTENT_TYPE, "application/xml")],
        body,
    )
        .into_response()
}

fn json_response(body: String) -> Response {
    (
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_string_preserves_repeats_and_order() {
        let parsed = parse_query_string(
            "EQ_type=Temperature&GE_value=5&LT_value=10&perPage=50",
        )
        .unwrap();
        assert_eq!(
            parsed,
            vec![
                ("EQ_type".to_owned(), "Temperature".to_owned()),
                ("GE_value".to_owned(), "5".to_owned()),
                ("LT_value".to_owned(), "10".to_owned()),
                ("perPage".to_owned(), "50".to_owned()),
            ]
        );
    }

    #[test]
    fn query_string_decodes_percent_escapes() {
        let parsed =
            parse_query_string("MATCH_anyEPC=urn%3Aepc%3Aid%3Asgtin%3A8901213.105919.%2A")
                .unwrap();
        assert_eq!(parsed[0].1, "urn:epc:id:sgtin:8901213.105919.*");
    }

    #[test]
    fn json_parameters_flatten_to_pairs() {
        let object = serde_json::from_str::<serde_json::Map<String, Value>>(
            r#"{
                "eventType": ["ObjectEvent", "AggregationEvent"],
                "GE_value": 5,
                "EQ_bizStep": "urn:epcglobal:cbv:bizstep:receiving"
            }"#,
        )
        .unwrap();
        let parameters = parameters_from_json(&object).unwrap();
        assert!(parameters.contains(&(
            "eventType".to_owned(),
            "ObjectEvent|AggregationEvent".to_owned()
        )));
        assert!(parameters.contains(&("GE_value".to_owned(), "5".to_owned())));
    }

    #[test]
    fn nested_json_parameter_values_are_rejected() {
        let object = serde_json::from_str::<serde_json::Map<String, Value>>(
            r#"{"EQ_bizStep": {"nested": true}}"#,
        )
        .unwrap();
        assert!(parameters_from_json(&object).is_err());
    }
}
