//! Canonical aggregate -> EPCIS 2.0 JSON-LD.

use std::collections::HashMap;

use chrono::SecondsFormat;
use serde_json::{json, Map, Value};

use epcis_common::model::{Capture, EpcType, Event, EventType, FieldKind, SensorElement};

use crate::fields::ExtensionNode;
use crate::json::EPCIS_CONTEXT;
use crate::xml::encode::prefix_table;

/// Encode a capture as an EPCIS 2.0 JSON-LD document.
pub fn encode_document(capture: &Capture) -> String {
    let prefixes = prefix_table(&capture.namespaces, &capture.events);
    let mut doc = Map::new();
    doc.insert("@context".to_owned(), context_value(&prefixes));
    doc.insert("type".to_owned(), json!("EPCISDocument"));
    doc.insert("schemaVersion".to_owned(), json!("2.0"));
    if let Some(t) = &capture.document_time {
        doc.insert(
            "creationDate".to_owned(),
            json!(t.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
    }
    let events: Vec<Value> = capture
        .events
        .iter()
        .map(|e| encode_event(e, &prefixes))
        .collect();
    doc.insert(
        "epcisBody".to_owned(),
        json!({ "eventList": Value::Array(events) }),
    );
    Value::Object(doc).to_string()
}

/// Encode a query result set as an EPCIS 2.0 QueryResults body.
pub fn encode_query_results(
    events: &[Event],
    query_name: &str,
    subscription_id: Option<&str>,
) -> String {
    let prefixes = prefix_table(&HashMap::new(), events);
    let event_values: Vec<Value> = events.iter().map(|e| encode_event(e, &prefixes)).collect();

    let mut results = Map::new();
    results.insert("queryName".to_owned(), json!(query_name));
    if let Some(id) = subscription_id {
        results.insert("subscriptionID".to_owned(), json!(id));
    }
    results.insert(
        "resultsBody".to_owned(),
        json!({ "eventList": Value::Array(event_values) }),
    );

    let doc = json!({
        "@context": context_value(&prefixes),
        "type": "EPCISQueryDocument",
        "schemaVersion": "2.0",
        "epcisBody": { "queryResults": Value::Object(results) },
    });
    doc.to_string()
}

/// The `@context` array: the standard context first, then one object per
/// extension namespace, each prefix declared exactly once.
fn context_value(prefixes: &HashMap<String, String>) -> Value {
    let mut entries = vec![json!(EPCIS_CONTEXT)];
    let mut sorted: Vec<_> = prefixes.iter().collect();
    sorted.sort();
    for (uri, prefix) in sorted {
        entries.push(json!({ prefix: uri }));
    }
    Value::Array(entries)
}

fn encode_event(event: &Event, prefixes: &HashMap<String, String>) -> Value {
    let mut obj = Map::new();
    obj.insert("type".to_owned(), json!(event.event_type.as_str()));
    if !event.event_id.is_empty() {
        obj.insert("eventID".to_owned(), json!(event.event_id));
    }
    obj.insert(
        "eventTime".to_owned(),
        json!(event.event_time.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    obj.insert(
        "eventTimeZoneOffset".to_owned(),
        json!(event.event_time_zone_offset),
    );
    if let Some(t) = &event.record_time {
        obj.insert(
            "recordTime".to_owned(),
            json!(t.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
    }
    if let Some(action) = event.action {
        obj.insert("action".to_owned(), json!(action.as_str()));
    }
    if let Some(v) = &event.business_step {
        obj.insert("bizStep".to_owned(), json!(v));
    }
    if let Some(v) = &event.disposition {
        obj.insert("disposition".to_owned(), json!(v));
    }
    if let Some(v) = &event.read_point {
        obj.insert("readPoint".to_owned(), json!({ "id": v }));
    }
    if let Some(v) = &event.business_location {
        obj.insert("bizLocation".to_owned(), json!({ "id": v }));
    }
    if let Some(v) = &event.transformation_id {
        obj.insert("transformationID".to_owned(), json!(v));
    }
    if let Some(v) = &event.certification_info {
        obj.insert("certificationInfo".to_owned(), json!(v));
    }

    if let Some(parent) = event.parent_id() {
        obj.insert("parentID".to_owned(), json!(parent.id));
    }
    match event.event_type {
        EventType::Aggregation => {
            insert_epc_array(&mut obj, "childEPCs", event, EpcType::ChildEpc);
        }
        EventType::Transformation => {
            insert_epc_array(&mut obj, "inputEPCList", event, EpcType::InputEpc);
            insert_quantity_array(&mut obj, "inputQuantityList", event, EpcType::InputEpc);
            insert_epc_array(&mut obj, "outputEPCList", event, EpcType::OutputEpc);
            insert_quantity_array(&mut obj, "outputQuantityList", event, EpcType::OutputEpc);
        }
        _ => {
            insert_epc_array(&mut obj, "epcList", event, EpcType::List);
        }
    }
    insert_quantity_array(&mut obj, "quantityList", event, EpcType::Quantity);

    if !event.business_transactions.is_empty() {
        let list: Vec<Value> = event
            .business_transactions
            .iter()
            .map(|bt| {
                let mut entry = Map::new();
                if let Some(kind) = &bt.kind {
                    entry.insert("type".to_owned(), json!(kind));
                }
                entry.insert("bizTransaction".to_owned(), json!(bt.id));
                Value::Object(entry)
            })
            .collect();
        obj.insert("bizTransactionList".to_owned(), Value::Array(list));
    }
    if !event.sources.is_empty() {
        let list: Vec<Value> = event
            .sources
            .iter()
            .map(|s| json!({ "type": s.kind, "source": s.id }))
            .collect();
        obj.insert("sourceList".to_owned(), Value::Array(list));
    }
    if !event.destinations.is_empty() {
        let list: Vec<Value> = event
            .destinations
            .iter()
            .map(|d| json!({ "type": d.kind, "destination": d.id }))
            .collect();
        obj.insert("destinationList".to_owned(), Value::Array(list));
    }
    if let Some(pd) = event.persistent_dispositions.first() {
        let mut entry = Map::new();
        if !pd.set.is_empty() {
            entry.insert("set".to_owned(), json!(pd.set));
        }
        if !pd.unset.is_empty() {
            entry.insert("unset".to_owned(), json!(pd.unset));
        }
        obj.insert("persistentDisposition".to_owned(), Value::Object(entry));
    }

    if event.corrective_declaration_time.is_some()
        || event.corrective_reason.is_some()
        || !event.corrective_event_ids.is_empty()
    {
        let mut decl = Map::new();
        if let Some(t) = &event.corrective_declaration_time {
            decl.insert(
                "declarationTime".to_owned(),
                json!(t.to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
        }
        if let Some(reason) = &event.corrective_reason {
            decl.insert("reason".to_owned(), json!(reason));
        }
        if !event.corrective_event_ids.is_empty() {
            decl.insert(
                "correctiveEventIDs".to_owned(),
                json!(event.corrective_event_ids),
            );
        }
        obj.insert("errorDeclaration".to_owned(), Value::Object(decl));
    }

    let ilmd = custom_object(event, FieldKind::Ilmd, None, prefixes);
    if !ilmd.is_empty() {
        obj.insert("ilmd".to_owned(), Value::Object(ilmd));
    }

    if !event.sensor_elements.is_empty() {
        let mut report_ordinal = 0;
        let list: Vec<Value> = event
            .sensor_elements
            .iter()
            .map(|element| encode_sensor_element(element, event, &mut report_ordinal, prefixes))
            .collect();
        obj.insert("sensorElementList".to_owned(), Value::Array(list));
    }

    for (key, value) in custom_object(event, FieldKind::Extension, None, prefixes) {
        obj.insert(key, value);
    }

    Value::Object(obj)
}

fn insert_epc_array(obj: &mut Map<String, Value>, key: &str, event: &Event, epc_type: EpcType) {
    let epcs: Vec<Value> = event
        .epcs_of_type(epc_type)
        .filter(|e| e.quantity.is_none())
        .map(|e| json!(e.id))
        .collect();
    if !epcs.is_empty() {
        obj.insert(key.to_owned(), Value::Array(epcs));
    }
}

fn insert_quantity_array(
    obj: &mut Map<String, Value>,
    key: &str,
    event: &Event,
    epc_type: EpcType,
) {
    let epcs: Vec<Value> = event
        .epcs_of_type(epc_type)
        .filter(|e| e.quantity.is_some() || epc_type == EpcType::Quantity)
        .map(|e| {
            let mut entry = Map::new();
            entry.insert("epcClass".to_owned(), json!(e.id));
            if let Some(q) = e.quantity {
                entry.insert("quantity".to_owned(), json!(q));
            }
            if let Some(uom) = &e.unit_of_measure {
                entry.insert("uom".to_owned(), json!(uom));
            }
            Value::Object(entry)
        })
        .collect();
    if !epcs.is_empty() {
        obj.insert(key.to_owned(), Value::Array(epcs));
    }
}

fn encode_sensor_element(
    element: &SensorElement,
    event: &Event,
    report_ordinal: &mut i32,
    prefixes: &HashMap<String, String>,
) -> Value {
    let mut obj = Map::new();

    let mut meta = Map::new();
    if let Some(t) = &element.time {
        meta.insert(
            "time".to_owned(),
            json!(t.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
    }
    insert_opt(&mut meta, "deviceID", element.device_id.as_deref());
    insert_opt(&mut meta, "deviceMetadata", element.device_metadata.as_deref());
    insert_opt(&mut meta, "rawData", element.raw_data.as_deref());
    insert_opt(
        &mut meta,
        "dataProcessingMethod",
        element.data_processing_method.as_deref(),
    );
    insert_opt(&mut meta, "bizRules", element.biz_rules.as_deref());
    for (key, value) in custom_object(event, FieldKind::SensorElementExtension, Some(element.index), prefixes)
    {
        meta.insert(key, value);
    }
    if !meta.is_empty() {
        obj.insert("sensorMetadata".to_owned(), Value::Object(meta));
    }

    let reports: Vec<Value> = element
        .reports
        .iter()
        .map(|report| {
            let mut entry = Map::new();
            insert_opt(&mut entry, "type", report.report_type.as_deref());
            insert_opt(&mut entry, "deviceID", report.device_id.as_deref());
            insert_opt(&mut entry, "rawData", report.raw_data.as_deref());
            insert_opt(
                &mut entry,
                "dataProcessingMethod",
                report.data_processing_method.as_deref(),
            );
            if let Some(t) = &report.time {
                entry.insert(
                    "time".to_owned(),
                    json!(t.to_rfc3339_opts(SecondsFormat::Millis, true)),
                );
            }
            insert_opt(&mut entry, "microorganism", report.microorganism.as_deref());
            insert_opt(
                &mut entry,
                "chemicalSubstance",
                report.chemical_substance.as_deref(),
            );
            insert_num(&mut entry, "value", report.value);
            insert_opt(&mut entry, "stringValue", report.string_value.as_deref());
            if let Some(b) = report.boolean_value {
                entry.insert("booleanValue".to_owned(), json!(b));
            }
            insert_opt(&mut entry, "hexBinaryValue", report.hex_binary_value.as_deref());
            insert_opt(&mut entry, "uriValue", report.uri_value.as_deref());
            insert_num(&mut entry, "minValue", report.min_value);
            insert_num(&mut entry, "maxValue", report.max_value);
            insert_num(&mut entry, "meanValue", report.mean_value);
            insert_num(&mut entry, "sDev", report.s_dev);
            insert_num(&mut entry, "percRank", report.perc_rank);
            insert_num(&mut entry, "percValue", report.perc_value);
            insert_opt(&mut entry, "uom", report.uom.as_deref());
            insert_opt(&mut entry, "component", report.component.as_deref());
            insert_opt(&mut entry, "exception", report.exception.as_deref());
            for (key, value) in
                custom_object(event, FieldKind::SensorReportExtension, Some(*report_ordinal), prefixes)
            {
                entry.insert(key, value);
            }
            *report_ordinal += 1;
            Value::Object(entry)
        })
        .collect();
    if !reports.is_empty() {
        obj.insert("sensorReport".to_owned(), Value::Array(reports));
    }

    Value::Object(obj)
}

/// Rebuild one field partition as prefixed JSON properties.
fn custom_object(
    event: &Event,
    kind: FieldKind,
    entity_index: Option<i32>,
    prefixes: &HashMap<String, String>,
) -> Map<String, Value> {
    let partition: Vec<&epcis_common::model::Field> = event
        .fields
        .iter()
        .filter(|f| f.kind.element() == kind.element() && f.entity_index == entity_index)
        .collect();
    let mut obj = Map::new();
    for node in crate::fields::rebuild(&partition) {
        let (key, value) = extension_property(&node, prefixes);
        obj.insert(key, value);
    }
    obj
}

fn extension_property(node: &ExtensionNode, prefixes: &HashMap<String, String>) -> (String, Value) {
    let key = match prefixes.get(&node.namespace) {
        Some(prefix) => format!("{prefix}:{}", node.name),
        None => node.name.clone(),
    };
    if node.attributes.is_empty() && node.children.is_empty() {
        return (key, json!(node.text.clone().unwrap_or_default()));
    }
    let mut obj = Map::new();
    for (attr_name, attr_value) in &node.attributes {
        obj.insert(format!("@{attr_name}"), json!(attr_value));
    }
    for child in &node.children {
        let (child_key, child_value) = extension_property(child, prefixes);
        obj.insert(child_key, child_value);
    }
    if let Some(text) = &node.text {
        obj.insert("@value".to_owned(), json!(text));
    }
    (key, Value::Object(obj))
}

fn insert_opt(obj: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    if let Some(v) = value {
        obj.insert(key.to_owned(), json!(v));
    }
}

fn insert_num(obj: &mut Map<String, Value>, key: &str, value: Option<f64>) {
    if let Some(v) = value {
        obj.insert(key.to_owned(), json!(v));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_event;
    use crate::json::decode::decode_document as decode_json;
    use crate::xml::decode::decode_document as decode_xml;

    const EVENT_JSON: &str = r#"{
      "@context": [
        "https://ref.gs1.org/standards/epcis/2.0.0/epcis-context.jsonld",
        {"acme": "https://ns.acme.example/epcis"}
      ],
      "type": "EPCISDocument",
      "schemaVersion": "2.0",
      "epcisBody": {"eventList": [{
        "type": "ObjectEvent",
        "eventTime": "2025-01-15T10:30:00Z",
        "eventTimeZoneOffset": "+00:00",
        "epcList": ["urn:epc:id:sgtin:8901213.105919.000000"],
        "action": "OBSERVE",
        "bizStep": "urn:epcglobal:cbv:bizstep:receiving",
        "ilmd": {"acme:lot": "ABC123"}
      }]}
    }"#;

    #[test]
    fn encode_decode_round_trips() {
        let original = decode_json(EVENT_JSON.as_bytes()).unwrap();
        let encoded = encode_document(&original);
        let reparsed = decode_json(encoded.as_bytes()).unwrap();

        let a = &original.events[0];
        let b = &reparsed.events[0];
        assert_eq!(b.event_type, a.event_type);
        assert_eq!(b.event_time, a.event_time);
        assert_eq!(b.action, a.action);
        assert_eq!(b.epcs, a.epcs);
        assert_eq!(b.fields, a.fields);
    }

    #[test]
    fn context_declares_each_namespace_once() {
        let original = decode_json(EVENT_JSON.as_bytes()).unwrap();
        let encoded = encode_document(&original);
        let value: Value = serde_json::from_str(&encoded).unwrap();
        let context = value.get("@context").unwrap().as_array().unwrap();
        assert_eq!(context[0], json!(EPCIS_CONTEXT));
        let declared: Vec<&Value> = context[1..].iter().collect();
        assert_eq!(declared.len(), 1);
        assert_eq!(
            declared[0],
            &json!({"acme": "https://ns.acme.example/epcis"})
        );
    }

    #[test]
    fn hash_is_stable_across_xml_and_json() {
        let xml = r#"<EPCISDocument schemaVersion="2.0"
            xmlns:acme="https://ns.acme.example/epcis">
          <EPCISBody><EventList><ObjectEvent>
            <eventTime>2025-01-15T10:30:00Z</eventTime>
            <eventTimeZoneOffset>+00:00</eventTimeZoneOffset>
            <epcList><epc>urn:epc:id:sgtin:8901213.105919.000000</epc></epcList>
            <action>OBSERVE</action>
            <bizStep>urn:epcglobal:cbv:bizstep:receiving</bizStep>
            <ilmd><acme:lot>ABC123</acme:lot></ilmd>
          </ObjectEvent></EventList></EPCISBody>
        </EPCISDocument>"#;

        let from_xml = decode_xml(xml.as_bytes()).unwrap();
        let from_json = decode_json(EVENT_JSON.as_bytes()).unwrap();

        let h1 = hash_event(&from_xml.events[0]);
        let h2 = hash_event(&from_json.events[0]);
        assert_eq!(h1, h2);
    }

    #[test]
    fn hash_survives_a_json_round_trip() {
        let original = decode_json(EVENT_JSON.as_bytes()).unwrap();
        let encoded = encode_document(&original);
        let reparsed = decode_json(encoded.as_bytes()).unwrap();
        assert_eq!(
            hash_event(&original.events[0]),
            hash_event(&reparsed.events[0])
        );
    }

    #[test]
    fn query_results_body_shape() {
        let capture = decode_json(EVENT_JSON.as_bytes()).unwrap();
        let body = encode_query_results(&capture.events, "SimpleEventQuery", None);
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["type"], json!("EPCISQueryDocument"));
        assert_eq!(
            value["epcisBody"]["queryResults"]["queryName"],
            json!("SimpleEventQuery")
        );
        assert_eq!(
            value["epcisBody"]["queryResults"]["resultsBody"]["eventList"]
                .as_array()
                .unwrap()
                .len(),
            1
        );
    }
}
