//! The EPCIS 1.2 SOAP query surface, bound to `POST /Query.svc`.

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use epcis_common::error::EpcisError;
use epcis_common::model::{SchemaVersion, Subscription, SubscriptionTrigger};
use epcis_format::soap::{
    self, fault, fault_type, simple_response, string_list_response, SoapRequest,
};
use epcis_format::xml::encode::encode_query_results;
use epcis_query::engine::QueryIdentity;
use epcis_store::EventStore;

use crate::auth::authenticate;
use crate::router::AppState;

pub const VENDOR_VERSION: &str = "epcis-repository-0.1";
pub const STANDARD_VERSION: &str = "1.2";
pub const QUERY_NAME: &str = "SimpleEventQuery";

#[instrument(skip_all)]
pub async fn query_service<S: EventStore>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let identity = match authenticate(&headers, &state.0.super_tenants) {
        Ok(identity) => identity,
        Err(err) => return soap_error(&err),
    };

    let request = match soap::parse_envelope(&body) {
        Ok(request) => request,
        Err(err) => return soap_error(&err),
    };

    match handle(&state, &identity, request).await {
        Ok(body) => soap_ok(body),
        Err(err) => soap_error(&err),
    }
}

async fn handle<S: EventStore>(
    state: &AppState<S>,
    identity: &QueryIdentity,
    request: SoapRequest,
) -> Result<String, EpcisError> {
    match request {
        SoapRequest::GetVendorVersion => {
            Ok(simple_response("GetVendorVersionResult", VENDOR_VERSION))
        }
        SoapRequest::GetStandardVersion => {
            Ok(simple_response("GetStandardVersionResult", STANDARD_VERSION))
        }
        SoapRequest::GetQueryNames => Ok(string_list_response(
            "GetQueryNamesResult",
            &[QUERY_NAME.to_owned()],
        )),
        SoapRequest::GetSubscriptionIds { query_name } => {
            let names: Vec<String> = state
                .0
                .store
                .list_subscriptions(&identity.tenant_id)
                .await?
                .into_iter()
                .filter(|s| query_name.is_empty() || s.query_name == query_name)
                .map(|s| s.name)
                .collect();
            Ok(string_list_response("GetSubscriptionIDsResult", &names))
        }
        SoapRequest::Poll {
            query_name,
            parameters,
        } => {
            if query_name != QUERY_NAME {
                return Err(EpcisError::NoSuchQuery(query_name));
            }
            let outcome = state
                .0
                .query
                .execute(identity, &parameters, &CancellationToken::new())
                .await?;
            let results = encode_query_results(
                &outcome.events,
                SchemaVersion::V1_2,
                &query_name,
                None,
            );
            Ok(soap::envelope(strip_prolog(&results)))
        }
        SoapRequest::Subscribe {
            query_name,
            parameters,
            destination,
            subscription_id,
            schedule,
            report_if_empty,
            initial_record_time,
        } => {
            if query_name != QUERY_NAME {
                return Err(EpcisError::NoSuchQuery(query_name));
            }
            let subscription = Subscription {
                id: 0,
                name: subscription_id,
                query_name,
                parameters,
                destination,
                tenant_id: identity.tenant_id.clone(),
                report_if_empty,
                initial_record_time,
                last_executed_time: None,
                trigger: match schedule {
                    Some(expression) => SubscriptionTrigger::OnSchedule(expression),
                    None => SubscriptionTrigger::OnCapture,
                },
                active: true,
                last_error: None,
            };
            state.0.subscriptions.register(subscription).await?;
            Ok(simple_response("SubscribeResult", ""))
        }
        SoapRequest::Unsubscribe { subscription_id } => {
            if state
                .0
                .subscriptions
                .unregister(&identity.tenant_id, &subscription_id)
                .await?
            {
                Ok(simple_response("UnsubscribeResult", ""))
            } else {
                Err(EpcisError::NoSuchSubscription(subscription_id))
            }
        }
    }
}

/// A query-results document embedded in an envelope must not carry its own
/// XML prolog.
fn strip_prolog(document: &str) -> &str {
    match document.find("?>") {
        Some(end) if document.starts_with("<?xml") => document[end + 2..].trim_start(),
        _ => document,
    }
}

fn soap_ok(body: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/xml; charset=utf-8")],
        body,
    )
        .into_response()
}

fn soap_error(err: &EpcisError) -> Response {
    let status = match err {
        EpcisError::Unauthenticated => StatusCode::UNAUTHORIZED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        [(header::CONTENT_TYPE, "text/xml; charset=utf-8")],
        fault(fault_type(err), &err.to_string()),
    )
        .into_response()
}
