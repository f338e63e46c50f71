//! EPCIS 1.2 SOAP query surface: envelope parsing, response envelopes, and
//! `EPCISException` faults.

use chrono::{DateTime, Utc};
use quick_xml::events::BytesStart;

use epcis_common::error::EpcisError;

use crate::xml::dom::{self, XmlNode};
use crate::xml::emit::XmlEmitter;
use crate::xml::NS_EPCIS_QUERY_1;

pub const SOAP_ENVELOPE_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";

/// A parsed SOAP operation against the 1.2 query interface.
#[derive(Debug, Clone, PartialEq)]
pub enum SoapRequest {
    GetVendorVersion,
    GetStandardVersion,
    GetQueryNames,
    GetSubscriptionIds {
        query_name: String,
    },
    Poll {
        query_name: String,
        parameters: Vec<(String, String)>,
    },
    Subscribe {
        query_name: String,
        parameters: Vec<(String, String)>,
        destination: String,
        subscription_id: String,
        /// Six-field cron expression derived from the QuerySchedule, when
        /// scheduled rather than trigger-driven.
        schedule: Option<String>,
        report_if_empty: bool,
        initial_record_time: Option<DateTime<Utc>>,
    },
    Unsubscribe {
        subscription_id: String,
    },
}

/// Parse a SOAP envelope into a query operation.
pub fn parse_envelope(bytes: &[u8]) -> Result<SoapRequest, EpcisError> {
    let doc = dom::parse(bytes)?;
    if doc.root.name != "Envelope" {
        return Err(EpcisError::MalformedDocument(
            "not a SOAP envelope".to_owned(),
        ));
    }
    let body = doc
        .root
        .child("Body")
        .ok_or_else(|| EpcisError::MalformedDocument("envelope without a Body".to_owned()))?;
    let operation = body
        .children
        .first()
        .ok_or_else(|| EpcisError::MalformedDocument("empty SOAP body".to_owned()))?;

    match operation.name.as_str() {
        "GetVendorVersion" => Ok(SoapRequest::GetVendorVersion),
        "GetStandardVersion" => Ok(SoapRequest::GetStandardVersion),
        "GetQueryNames" => Ok(SoapRequest::GetQueryNames),
        "GetSubscriptionIDs" => Ok(SoapRequest::GetSubscriptionIds {
            query_name: operation
                .child_text("queryName")
                .unwrap_or_default()
                .to_owned(),
        }),
        "Poll" => Ok(SoapRequest::Poll {
            query_name: operation
                .child_text("queryName")
                .unwrap_or_default()
                .to_owned(),
            parameters: parse_params(operation),
        }),
        "Unsubscribe" => Ok(SoapRequest::Unsubscribe {
            subscription_id: operation
                .child_text("subscriptionID")
                .unwrap_or_default()
                .to_owned(),
        }),
        "Subscribe" => {
            let controls = operation.child("controls");
            let schedule = controls
                .and_then(|c| c.child("schedule"))
                .map(schedule_to_cron);
            let report_if_empty = controls
                .and_then(|c| c.child_text("reportIfEmpty"))
                .map(|v| v == "true")
                .unwrap_or(false);
            let initial_record_time = controls
                .and_then(|c| c.child_text("initialRecordTime"))
                .and_then(|t| DateTime::parse_from_rfc3339(t.trim()).ok())
                .map(|dt| dt.with_timezone(&Utc));
            Ok(SoapRequest::Subscribe {
                query_name: operation
                    .child_text("queryName")
                    .unwrap_or_default()
                    .to_owned(),
                parameters: parse_params(operation),
                destination: operation.child_text("dest").unwrap_or_default().to_owned(),
                subscription_id: operation
                    .child_text("subscriptionID")
                    .unwrap_or_default()
                    .to_owned(),
                schedule,
                report_if_empty,
                initial_record_time,
            })
        }
        other => Err(EpcisError::MalformedDocument(format!(
            "unknown SOAP operation {other}"
        ))),
    }
}

/// `params>param>(name, value)` pairs. Multi-valued `<string>` entries
/// collapse to one `|`-separated value, matching the query grammar.
fn parse_params(operation: &XmlNode) -> Vec<(String, String)> {
    let mut out = Vec::new();
    if let Some(params) = operation.child("params") {
        for param in params.children_named("param") {
            let Some(name) = param.child_text("name") else {
                continue;
            };
            let Some(value) = param.child("value") else {
                continue;
            };
            let strings: Vec<&str> = value
                .children_named("string")
                .map(|s| s.text.as_str())
                .collect();
            let rendered = if strings.is_empty() {
                value.text.clone()
            } else {
                strings.join("|")
            };
            out.push((name.to_owned(), rendered));
        }
    }
    out
}

/// Map a 1.2 QuerySchedule to a six-field cron expression.
fn schedule_to_cron(schedule: &XmlNode) -> String {
    let field = |name: &str| {
        schedule
            .child_text(name)
            .filter(|v| !v.is_empty())
            .unwrap_or("*")
            .to_owned()
    };
    format!(
        "{} {} {} {} {} {}",
        field("second"),
        field("minute"),
        field("hour"),
        field("dayOfMonth"),
        field("month"),
        field("dayOfWeek"),
    )
}

/// Wrap response markup, already emitted by this crate, in a SOAP envelope.
pub fn envelope(inner: &str) -> String {
    let mut out = XmlEmitter::document();
    let mut root = BytesStart::new("soapenv:Envelope");
    root.push_attribute(("xmlns:soapenv", SOAP_ENVELOPE_NS));
    out.open(root);
    out.open_tag("soapenv:Body");
    out.raw(inner);
    out.close("soapenv:Body");
    out.close("soapenv:Envelope");
    out.finish()
}

fn query_ns_element(operation: &str) -> (String, BytesStart<'static>) {
    let name = format!("epcisq:{operation}");
    let mut start = BytesStart::new(name.clone());
    start.push_attribute(("xmlns:epcisq", NS_EPCIS_QUERY_1));
    (name, start)
}

/// A response element in the query namespace with simple text content.
pub fn simple_response(operation: &str, text: &str) -> String {
    let mut out = XmlEmitter::fragment();
    let (name, start) = query_ns_element(operation);
    out.open(start);
    out.text(text);
    out.close(&name);
    envelope(&out.finish())
}

/// A response carrying a list of `<string>` entries.
pub fn string_list_response(operation: &str, values: &[String]) -> String {
    let mut out = XmlEmitter::fragment();
    let (name, start) = query_ns_element(operation);
    out.open(start);
    for value in values {
        out.elem("string", value);
    }
    out.close(&name);
    envelope(&out.finish())
}

/// An EPCISException SOAP fault of the given subtype.
pub fn fault(exception: &str, reason: &str) -> String {
    let mut out = XmlEmitter::fragment();
    out.open_tag("soapenv:Fault");
    out.elem("faultcode", "soapenv:Server");
    out.elem("faultstring", exception);
    out.open_tag("detail");
    let (name, start) = query_ns_element(exception);
    out.open(start);
    out.elem("reason", reason);
    out.close(&name);
    out.close("detail");
    out.close("soapenv:Fault");
    envelope(&out.finish())
}

/// The EPCISException subtype for a boundary error.
pub fn fault_type(err: &EpcisError) -> &'static str {
    match err {
        EpcisError::QueryTooLarge => "QueryTooLargeException",
        EpcisError::UnsupportedParameter(_) | EpcisError::InvalidParameterValue { .. } => {
            "QueryParameterException"
        }
        EpcisError::NoSuchQuery(_) | EpcisError::NoSuchSubscription(_) => "NoSuchNameException",
        EpcisError::DuplicateName(_) => "DuplicateNameException",
        EpcisError::Unauthenticated => "SecurityException",
        EpcisError::ValidationFailed(_) | EpcisError::SchemaInvalid(_) => "ValidationException",
        _ => "ImplementationException",
    }
}
