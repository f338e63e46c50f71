//! Canonical-form SHA-256 event identifiers.
//!
//! When a submitter does not provide an `eventID`, the repository derives one
//! from a deterministic canonical serialization, so the same logical event
//! hashes identically no matter which wire format delivered it.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

use epcis_common::model::{Epc, Event, Field, SensorReport};

/// Derive the stable `ni:` URI for an event.
pub fn hash_event(event: &Event) -> String {
    let mut lines = canonical_lines(event);
    lines.sort();
    let payload = lines.join("\n");

    let digest = Sha256::digest(payload.as_bytes());
    format!(
        "ni:///sha-256;{}?ver=CBV2.0",
        URL_SAFE_NO_PAD.encode(digest)
    )
}

/// One `key=value` line per canonical datum. List entries that are
/// semantically sets (EPCs, transactions, sources, destinations, fields,
/// sensor reports) each produce their own line; the final lexicographic sort
/// makes their order immaterial.
fn canonical_lines(event: &Event) -> Vec<String> {
    let mut lines = Vec::new();
    let mut push = |key: &str, value: String| lines.push(format!("{key}={value}"));

    push("eventType", event.event_type.as_str().to_owned());
    push("eventTime", canonical_time(&event.event_time));
    push("eventTimeZoneOffset", event.event_time_zone_offset.clone());
    if let Some(action) = event.action {
        push("action", action.as_str().to_owned());
    }
    if let Some(v) = &event.business_step {
        push("bizStep", v.clone());
    }
    if let Some(v) = &event.disposition {
        push("disposition", v.clone());
    }
    if let Some(v) = &event.read_point {
        push("readPoint", v.clone());
    }
    if let Some(v) = &event.business_location {
        push("bizLocation", v.clone());
    }
    if let Some(v) = &event.transformation_id {
        push("transformationID", v.clone());
    }
    if let Some(v) = &event.certification_info {
        push("certificationInfo", v.clone());
    }
    if let Some(t) = &event.corrective_declaration_time {
        push("errorDeclaration.declarationTime", canonical_time(t));
    }
    if let Some(v) = &event.corrective_reason {
        push("errorDeclaration.reason", v.clone());
    }
    for id in &event.corrective_event_ids {
        push("errorDeclaration.correctiveEventID", id.clone());
    }

    for epc in &event.epcs {
        push("epc", canonical_epc(epc));
    }
    for bt in &event.business_transactions {
        let kind = bt.kind.as_deref().unwrap_or("");
        push("bizTransaction", format!("{kind}|{}", bt.id));
    }
    for s in &event.sources {
        push("source", format!("{}|{}", s.kind, s.id));
    }
    for d in &event.destinations {
        push("destination", format!("{}|{}", d.kind, d.id));
    }
    for pd in &event.persistent_dispositions {
        for v in &pd.set {
            push("persistentDisposition.set", v.clone());
        }
        for v in &pd.unset {
            push("persistentDisposition.unset", v.clone());
        }
    }
    for element in &event.sensor_elements {
        for report in &element.reports {
            push("sensorReport", canonical_sensor_report(report));
        }
    }
    for line in field_lines(event) {
        lines.push(line);
    }

    lines
}

fn canonical_epc(epc: &Epc) -> String {
    let mut s = format!("{}|{}", epc.epc_type.as_str(), epc.id);
    if let Some(q) = epc.quantity {
        s.push('|');
        s.push_str(&canonical_number(q));
    }
    if let Some(uom) = &epc.unit_of_measure {
        s.push('|');
        s.push_str(uom);
    }
    s
}

fn canonical_sensor_report(report: &SensorReport) -> String {
    let mut parts = Vec::new();
    let mut part = |key: &str, value: String| parts.push(format!("{key}:{value}"));

    if let Some(v) = &report.report_type {
        part("type", v.clone());
    }
    if let Some(v) = &report.device_id {
        part("deviceID", v.clone());
    }
    if let Some(v) = &report.raw_data {
        part("rawData", v.clone());
    }
    if let Some(v) = &report.data_processing_method {
        part("dataProcessingMethod", v.clone());
    }
    if let Some(t) = &report.time {
        part("time", canonical_time(t));
    }
    if let Some(v) = &report.microorganism {
        part("microorganism", v.clone());
    }
    if let Some(v) = &report.chemical_substance {
        part("chemicalSubstance", v.clone());
    }
    if let Some(v) = report.value {
        part("value", canonical_number(v));
    }
    if let Some(v) = &report.string_value {
        part("stringValue", v.clone());
    }
    if let Some(v) = report.boolean_value {
        part("booleanValue", v.to_string());
    }
    if let Some(v) = &report.hex_binary_value {
        part("hexBinaryValue", v.clone());
    }
    if let Some(v) = &report.uri_value {
        part("uriValue", v.clone());
    }
    if let Some(v) = report.min_value {
        part("minValue", canonical_number(v));
    }
    if let Some(v) = report.max_value {
        part("maxValue", canonical_number(v));
    }
    if let Some(v) = report.mean_value {
        part("meanValue", canonical_number(v));
    }
    if let Some(v) = report.s_dev {
        part("sDev", canonical_number(v));
    }
    if let Some(v) = report.perc_rank {
        part("percRank", canonical_number(v));
    }
    if let Some(v) = report.perc_value {
        part("percValue", canonical_number(v));
    }
    if let Some(v) = &report.uom {
        part("uom", v.clone());
    }
    parts.join(",")
}

/// Field lines are keyed by kind plus the root-to-node name path, so layout
/// (indexes) does not leak into the hash while structure still does.
fn field_lines(event: &Event) -> Vec<String> {
    let mut lines = Vec::new();
    for field in &event.fields {
        let path = field_path(field, &event.fields);
        let value = field.text_value.clone().unwrap_or_default();
        let marker = if field.kind.is_attribute() { "@" } else { "" };
        lines.push(format!(
            "field.{}.{path}{marker}={value}",
            field.kind.element().as_str()
        ));
    }
    lines
}

fn field_path(field: &Field, all: &[Field]) -> String {
    let mut segments = vec![format!("{}#{}", field.namespace, field.name)];
    let mut parent = field.parent_index;
    while let Some(parent_index) = parent {
        match all
            .iter()
            .find(|f| f.index == parent_index && f.entity_index == field.entity_index)
        {
            Some(p) => {
                segments.push(format!("{}#{}", p.namespace, p.name));
                parent = p.parent_index;
            }
            None => break,
        }
    }
    segments.reverse();
    segments.join("/")
}

/// UTC, millisecond precision, `Z` suffix.
pub fn canonical_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// No exponent, no trailing fractional zeros, mandatory leading zero.
pub fn canonical_number(value: f64) -> String {
    if value == value.trunc() && value.abs() < 1e15 {
        return format!("{}", value.trunc() as i64);
    }
    let mut s = format!("{value:.12}");
    while s.ends_with('0') {
        s.pop();
    }
    if s.ends_with('.') {
        s.pop();
    }
    if let Some(stripped) = s.strip_prefix('.') {
        s = format!("0.{stripped}");
    } else if let Some(stripped) = s.strip_prefix("-.") {
        s = format!("-0.{stripped}");
    }
    s
}
