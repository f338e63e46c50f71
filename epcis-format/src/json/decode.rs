//! EPCIS 2.0 JSON-LD decoding.
//!
//! Custom properties arrive as `prefix:name` keys; the document's `@context`
//! supplies the prefix -> namespace table used to rewrite them before fields
//! are formed. `@`-prefixed keys inside custom objects are attribute nodes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use epcis_common::error::{EpcisError, Violation};
use epcis_common::model::{
    BusinessTransaction, Capture, Epc, EpcType, Event, EventType, FieldKind,
    PersistentDisposition, SchemaVersion, SensorElement, SensorReport, SourceDest,
};

use crate::fields::{flatten, ExtensionNode, FieldAllocator};

/// Decode an EPCIS 2.0 JSON-LD document into a capture.
pub fn decode_document(bytes: &[u8]) -> Result<Capture, EpcisError> {
    let doc: Value = serde_json::from_slice(bytes)
        .map_err(|e| EpcisError::MalformedDocument(e.to_string()))?;
    let obj = doc
        .as_object()
        .ok_or_else(|| EpcisError::MalformedDocument("document is not an object".to_owned()))?;

    let doc_type = obj.get("type").and_then(Value::as_str).unwrap_or_default();
    if doc_type != "EPCISDocument" {
        return Err(EpcisError::SchemaInvalid(vec![Violation::new(
            "DocumentRoot",
            format!("expected EPCISDocument, found {doc_type}"),
        )]));
    }

    let version: SchemaVersion = obj
        .get("schemaVersion")
        .and_then(Value::as_str)
        .ok_or_else(|| EpcisError::UnsupportedVersion("missing schemaVersion".to_owned()))?
        .parse()?;

    let prefixes = context_prefixes(obj.get("@context"));

    let mut capture = Capture::new(version);
    capture.document_time = obj
        .get("creationDate")
        .and_then(Value::as_str)
        .and_then(parse_time);
    capture.namespaces = prefixes
        .iter()
        .map(|(prefix, uri)| (uri.clone(), prefix.clone()))
        .collect();

    if let Some(header) = obj.get("epcisHeader") {
        capture.standard_business_header = Some(header.to_string());
    }

    let events = obj
        .get("epcisBody")
        .and_then(|b| b.get("eventList"))
        .and_then(Value::as_array)
        .ok_or_else(|| {
            EpcisError::SchemaInvalid(vec![Violation::new(
                "DocumentBody",
                "missing epcisBody.eventList",
            )])
        })?;

    for value in events {
        capture.events.push(decode_event(value, &prefixes)?);
    }

    Ok(capture)
}

/// prefix -> namespace URI mappings from an `@context` value. String entries
/// (the standard context URL) contribute nothing.
fn context_prefixes(context: Option<&Value>) -> HashMap<String, String> {
    let mut prefixes = HashMap::new();
    let mut absorb = |value: &Value| {
        if let Some(map) = value.as_object() {
            for (key, uri) in map {
                if let Some(uri) = uri.as_str() {
                    if !key.starts_with('@') {
                        prefixes.insert(key.clone(), uri.to_owned());
                    }
                }
            }
        }
    };
    match context {
        Some(Value::Array(entries)) => entries.iter().for_each(absorb),
        Some(value) => absorb(value),
        None => {}
    }
    prefixes
}

fn decode_event(value: &Value, prefixes: &HashMap<String, String>) -> Result<Event, EpcisError> {
    let obj = value
        .as_object()
        .ok_or_else(|| EpcisError::MalformedDocument("event is not an object".to_owned()))?;

    let event_type: EventType = obj
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .parse()?;

    let event_time = obj
        .get("eventTime")
        .and_then(Value::as_str)
        .and_then(parse_time)
        .ok_or_else(|| {
            EpcisError::SchemaInvalid(vec![Violation::new(
                "EventTime",
                format!("{event_type} without a parseable eventTime"),
            )])
        })?;
    let offset = obj
        .get("eventTimeZoneOffset")
        .and_then(Value::as_str)
        .unwrap_or_default();

    let mut event = Event::new(event_type, event_time, offset);
    let mut alloc = FieldAllocator::new();
    let mut report_ordinal = 0;

    for (key, val) in obj {
        match key.as_str() {
            "type" | "eventTime" | "eventTimeZoneOffset" | "recordTime" | "@context" => {}
            "eventID" => event.event_id = val.as_str().unwrap_or_default().to_owned(),
            "action" => {
                event.action = Some(val.as_str().unwrap_or_default().parse()?);
            }
            "bizStep" => event.business_step = string_of(val),
            "disposition" => event.disposition = string_of(val),
            "transformationID" => event.transformation_id = string_of(val),
            "certificationInfo" => event.certification_info = string_of(val),
            "readPoint" => event.read_point = id_of(val),
            "bizLocation" => event.business_location = id_of(val),
            "parentID" => {
                if let Some(id) = val.as_str() {
                    event.epcs.push(Epc::new(EpcType::ParentId, id));
                }
            }
            "epcList" => decode_epc_array(val, EpcType::List, &mut event),
            "childEPCs" => decode_epc_array(val, EpcType::ChildEpc, &mut event),
            "inputEPCList" => decode_epc_array(val, EpcType::InputEpc, &mut event),
            "outputEPCList" => decode_epc_array(val, EpcType::OutputEpc, &mut event),
            "quantityList" => decode_quantity_array(val, EpcType::Quantity, &mut event),
            "inputQuantityList" => decode_quantity_array(val, EpcType::InputEpc, &mut event),
            "outputQuantityList" => decode_quantity_array(val, EpcType::OutputEpc, &mut event),
            "bizTransactionList" => {
                for bt in val.as_array().into_iter().flatten() {
                    event.business_transactions.push(BusinessTransaction {
                        kind: bt.get("type").and_then(Value::as_str).map(str::to_owned),
                        id: bt
                            .get("bizTransaction")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_owned(),
                    });
                }
            }
            "sourceList" => {
                for s in val.as_array().into_iter().flatten() {
                    event.sources.push(SourceDest {
                        kind: s.get("type").and_then(Value::as_str).unwrap_or_default().to_owned(),
                        id: s
                            .get("source")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_owned(),
                    });
                }
            }
            "destinationList" => {
                for d in val.as_array().into_iter().flatten() {
                    event.destinations.push(SourceDest {
                        kind: d.get("type").and_then(Value::as_str).unwrap_or_default().to_owned(),
                        id: d
                            .get("destination")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_owned(),
                    });
                }
            }
            "persistentDisposition" => {
                event.persistent_dispositions.push(PersistentDisposition {
                    set: string_array(val.get("set")),
                    unset: string_array(val.get("unset")),
                });
            }
            "errorDeclaration" => {
                event.corrective_declaration_time = val
                    .get("declarationTime")
                    .and_then(Value::as_str)
                    .and_then(parse_time);
                event.corrective_reason =
                    val.get("reason").and_then(Value::as_str).map(str::to_owned);
                event.corrective_event_ids = string_array(val.get("correctiveEventIDs"));
            }
            "ilmd" => {
                decode_custom_object(
                    val,
                    FieldKind::Ilmd,
                    None,
                    prefixes,
                    &mut alloc,
                    &mut event,
                );
            }
            "sensorElementList" => {
                for (index, element_value) in
                    val.as_array().into_iter().flatten().enumerate()
                {
                    let element = decode_sensor_element(
                        element_value,
                        index as i32,
                        &mut report_ordinal,
                        prefixes,
                        &mut alloc,
                        &mut event,
                    );
                    event.sensor_elements.push(element);
                }
            }
            custom => {
                if let Some((namespace, name)) = resolve_custom(custom, prefixes) {
                    let node = to_extension_node(&namespace, &name, val, prefixes);
                    flatten(
                        &node,
                        FieldKind::Extension,
                        None,
                        None,
                        &mut alloc,
                        &mut event.fields,
                    );
                }
            }
        }
    }

    Ok(event)
}

fn decode_epc_array(val: &Value, epc_type: EpcType, event: &mut Event) {
    for epc in val.as_array().into_iter().flatten() {
        if let Some(id) = epc.as_str() {
            event.epcs.push(Epc::new(epc_type, id));
        }
    }
}

fn decode_quantity_array(val: &Value, epc_type: EpcType, event: &mut Event) {
    for element in val.as_array().into_iter().flatten() {
        let Some(class) = element.get("epcClass").and_then(Value::as_str) else {
            continue;
        };
        let mut epc = Epc::new(epc_type, class);
        epc.quantity = element.get("quantity").and_then(Value::as_f64);
        epc.unit_of_measure = element.get("uom").and_then(Value::as_str).map(str::to_owned);
        event.epcs.push(epc);
    }
}

fn decode_sensor_element(
    value: &Value,
    index: i32,
    report_ordinal: &mut i32,
    prefixes: &HashMap<String, String>,
    alloc: &mut FieldAllocator,
    event: &mut Event,
) -> SensorElement {
    let mut element = SensorElement::new(index);

    if let Some(meta) = value.get("sensorMetadata").and_then(Value::as_object) {
        for (key, val) in meta {
            match key.as_str() {
                "time" => element.time = val.as_str().and_then(parse_time),
                "deviceID" => element.device_id = string_of(val),
                "deviceMetadata" => element.device_metadata = string_of(val),
                "rawData" => element.raw_data = string_of(val),
                "dataProcessingMethod" => element.data_processing_method = string_of(val),
                "bizRules" => element.biz_rules = string_of(val),
                custom => {
                    if let Some((namespace, name)) = resolve_custom(custom, prefixes) {
                        let node = to_extension_node(&namespace, &name, val, prefixes);
                        flatten(
                            &node,
                            FieldKind::SensorElementExtension,
                            None,
                            Some(index),
                            alloc,
                            &mut event.fields,
                        );
                    }
                }
            }
        }
    }

    for report_value in value
        .get("sensorReport")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let mut report = SensorReport {
            sensor_index: index,
            ..Default::default()
        };
        if let Some(obj) = report_value.as_object() {
            for (key, val) in obj {
                match key.as_str() {
                    "type" => report.report_type = string_of(val),
                    "deviceID" => report.device_id = string_of(val),
                    "rawData" => report.raw_data = string_of(val),
                    "dataProcessingMethod" => report.data_processing_method = string_of(val),
                    "time" => report.time = val.as_str().and_then(parse_time),
                    "microorganism" => report.microorganism = string_of(val),
                    "chemicalSubstance" => report.chemical_substance = string_of(val),
                    "value" => report.value = val.as_f64(),
                    "stringValue" => report.string_value = string_of(val),
                    "booleanValue" => report.boolean_value = val.as_bool(),
                    "hexBinaryValue" => report.hex_binary_value = string_of(val),
                    "uriValue" => report.uri_value = string_of(val),
                    "minValue" => report.min_value = val.as_f64(),
                    "maxValue" => report.max_value = val.as_f64(),
                    "meanValue" => report.mean_value = val.as_f64(),
                    "sDev" => report.s_dev = val.as_f64(),
                    "percRank" => report.perc_rank = val.as_f64(),
                    "percValue" => report.perc_value = val.as_f64(),
                    "uom" => report.uom = string_of(val),
                    "component" => report.component = string_of(val),
                    "exception" => report.exception = string_of(val),
                    custom => {
                        if let Some((namespace, name)) = resolve_custom(custom, prefixes) {
                            let node = to_extension_node(&namespace, &name, val, prefixes);
                            flatten(
                                &node,
                                FieldKind::SensorReportExtension,
                                None,
                                Some(*report_ordinal),
                                alloc,
                                &mut event.fields,
                            );
                        }
                    }
                }
            }
        }
        element.reports.push(report);
        *report_ordinal += 1;
    }

    element
}

fn decode_custom_object(
    value: &Value,
    kind: FieldKind,
    entity_index: Option<i32>,
    prefixes: &HashMap<String, String>,
    alloc: &mut FieldAllocator,
    event: &mut Event,
) {
    if let Some(obj) = value.as_object() {
        for (key, val) in obj {
            if let Some((namespace, name)) = resolve_custom(key, prefixes) {
                let node = to_extension_node(&namespace, &name, val, prefixes);
                flatten(&node, kind, None, entity_index, alloc, &mut event.fields);
            }
        }
    }
}

/// `prefix:name` -> (namespace, localName), when the prefix is declared.
fn resolve_custom(key: &str, prefixes: &HashMap<String, String>) -> Option<(String, String)> {
    let (prefix, name) = key.split_once(':')?;
    let namespace = prefixes.get(prefix)?;
    Some((namespace.clone(), name.to_owned()))
}

/// Convert a custom JSON value to the flattener's input shape. Objects nest;
/// `@`-keys become attributes; scalars are leaf text.
fn to_extension_node(
    namespace: &str,
    name: &str,
    value: &Value,
    prefixes: &HashMap<String, String>,
) -> ExtensionNode {
    let mut node = ExtensionNode {
        namespace: namespace.to_owned(),
        name: name.to_owned(),
        ..Default::default()
    };
    match value {
        Value::Object(map) => {
            for (key, val) in map {
                if let Some(attr_name) = key.strip_prefix('@') {
                    node.attributes
                        .push((attr_name.to_owned(), scalar_text(val)));
                } else if let Some((child_ns, child_name)) = resolve_custom(key, prefixes) {
                    node.children
                        .push(to_extension_node(&child_ns, &child_name, val, prefixes));
                } else {
                    // Unprefixed children inherit the parent namespace.
                    node.children
                        .push(to_extension_node(namespace, key, val, prefixes));
                }
            }
        }
        Value::Array(items) => {
            // A repeated element: the caller gets one node per item, stitched
            // as siblings under the same name.
            for item in items {
                node.children
                    .push(to_extension_node(namespace, name, item, prefixes));
            }
        }
        scalar => node.text = Some(scalar_text(scalar)),
    }
    node
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn string_of(value: &Value) -> Option<String> {
    value.as_str().map(str::to_owned)
}

fn id_of(value: &Value) -> Option<String> {
    value.get("id").and_then(Value::as_str).map(str::to_owned)
}

fn string_array(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(str::to_owned)
        .collect()
}

fn parse_time(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
