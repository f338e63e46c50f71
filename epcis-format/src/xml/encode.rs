//! Canonical aggregate -> EPCIS XML (either generation), emitted as a
//! [`quick_xml::Writer`] event stream.
//!
//! Extension trees are re-materialized from the flat field list by bucketing
//! on `parent_index` (see [`crate::fields::rebuild`]); 1.x output restores
//! the legacy `extension`/`baseExtension` wrappers the decoder hoisted.

use std::collections::HashMap;

use chrono::SecondsFormat;
use quick_xml::events::BytesStart;

use epcis_common::model::{
    Capture, Epc, EpcType, Event, EventType, Field, FieldKind, SchemaVersion, SensorElement,
};

use crate::fields::{rebuild, ExtensionNode};
use crate::hash::canonical_number;
use crate::xml::emit::XmlEmitter;
use crate::xml::{NS_EPCIS_1, NS_EPCIS_2, NS_EPCIS_QUERY_1};

/// Namespace prefix table for one document: known prefixes from capture
/// time plus generated `ext1..extN` for namespaces seen only in fields.
pub fn prefix_table(known: &HashMap<String, String>, events: &[Event]) -> HashMap<String, String> {
    let mut table = known.clone();
    let mut counter = 1;
    for event in events {
        for field in &event.fields {
            if field.namespace.is_empty() || table.contains_key(&field.namespace) {
                continue;
            }
            loop {
                let candidate = format!("ext{counter}");
                counter += 1;
                if !table.values().any(|p| p == &candidate) {
                    table.insert(field.namespace.clone(), candidate);
                    break;
                }
            }
        }
    }
    table
}

/// Encode a full capture back to an EPCIS document in its own version.
pub fn encode_document(capture: &Capture) -> String {
    let prefixes = prefix_table(&capture.namespaces, &capture.events);
    let v2 = capture.schema_version.is_v2();
    let core_ns = if v2 { NS_EPCIS_2 } else { NS_EPCIS_1 };

    let mut out = XmlEmitter::document();
    let mut root = BytesStart::new("epcis:EPCISDocument");
    root.push_attribute(("xmlns:epcis", core_ns));
    for (uri, prefix) in sorted(&prefixes) {
        root.push_attribute((format!("xmlns:{prefix}").as_str(), uri.as_str()));
    }
    root.push_attribute(("schemaVersion", capture.schema_version.as_str()));
    if let Some(t) = &capture.document_time {
        root.push_attribute((
            "creationDate",
            t.to_rfc3339_opts(SecondsFormat::Millis, true).as_str(),
        ));
    }
    out.open(root);

    if capture.standard_business_header.is_some() || !capture.masterdata.is_empty() {
        out.open_tag("EPCISHeader");
        if let Some(raw) = &capture.standard_business_header {
            out.raw(raw);
        }
        if !capture.masterdata.is_empty() {
            encode_masterdata(capture, v2, &mut out);
        }
        out.close("EPCISHeader");
    }

    out.open_tag("EPCISBody");
    out.open_tag("EventList");
    for event in &capture.events {
        encode_event(event, capture.schema_version, &prefixes, &mut out);
    }
    out.close("EventList");
    out.close("EPCISBody");
    out.close("epcis:EPCISDocument");
    out.finish()
}

/// Encode a query result set as an EPCISQueryDocument.
pub fn encode_query_results(
    events: &[Event],
    version: SchemaVersion,
    query_name: &str,
    subscription_id: Option<&str>,
) -> String {
    let prefixes = prefix_table(&HashMap::new(), events);
    let v2 = version.is_v2();
    // 1.2 results live in the dedicated query namespace.
    let query_ns = if v2 { NS_EPCIS_2 } else { NS_EPCIS_QUERY_1 };

    let mut out = XmlEmitter::document();
    let mut root = BytesStart::new("epcisq:EPCISQueryDocument");
    root.push_attribute(("xmlns:epcisq", query_ns));
    for (uri, prefix) in sorted(&prefixes) {
        root.push_attribute((format!("xmlns:{prefix}").as_str(), uri.as_str()));
    }
    root.push_attribute(("schemaVersion", version.as_str()));
    out.open(root);

    out.open_tag("EPCISBody");
    out.open_tag("epcisq:QueryResults");
    out.elem("queryName", query_name);
    if let Some(id) = subscription_id {
        out.elem("subscriptionID", id);
    }
    out.open_tag("resultsBody");
    out.open_tag("EventList");
    for event in events {
        encode_event(event, version, &prefixes, &mut out);
    }
    out.close("EventList");
    out.close("resultsBody");
    out.close("epcisq:QueryResults");
    out.close("EPCISBody");
    out.close("epcisq:EPCISQueryDocument");
    out.finish()
}

fn encode_masterdata(capture: &Capture, v2: bool, out: &mut XmlEmitter) {
    if !v2 {
        out.open_tag("extension");
        out.open_tag("EPCISMasterDataDocument");
        out.open_tag("EPCISBody");
    }
    out.open_tag("VocabularyList");

    // Group entries by vocabulary type, preserving first-seen order.
    let mut order: Vec<&str> = Vec::new();
    for md in &capture.masterdata {
        if !order.contains(&md.vocabulary_type.as_str()) {
            order.push(&md.vocabulary_type);
        }
    }
    for vocabulary_type in order {
        let mut vocabulary = BytesStart::new("Vocabulary");
        vocabulary.push_attribute(("type", vocabulary_type));
        out.open(vocabulary);
        out.open_tag("VocabularyElementList");
        for md in capture
            .masterdata
            .iter()
            .filter(|m| m.vocabulary_type == vocabulary_type)
        {
            let mut element = BytesStart::new("VocabularyElement");
            element.push_attribute(("id", md.id.as_str()));
            out.open(element);
            for attr in &md.attributes {
                let mut attribute = BytesStart::new("attribute");
                attribute.push_attribute(("id", attr.name.as_str()));
                out.open(attribute);
                out.text(&attr.value);
                out.close("attribute");
            }
            if !md.children.is_empty() {
                out.open_tag("children");
                for child in &md.children {
                    out.elem("id", child);
                }
                out.close("children");
            }
            out.close("VocabularyElement");
        }
        out.close("VocabularyElementList");
        out.close("Vocabulary");
    }

    out.close("VocabularyList");
    if !v2 {
        out.close("EPCISBody");
        out.close("EPCISMasterDataDocument");
        out.close("extension");
    }
}

fn encode_event(
    event: &Event,
    version: SchemaVersion,
    prefixes: &HashMap<String, String>,
    out: &mut XmlEmitter,
) {
    let v2 = version.is_v2();
    let wrap_in_extension = !v2 && event.event_type == EventType::Transformation;
    if wrap_in_extension {
        out.open_tag("extension");
    }
    let tag = event.event_type.as_str();
    out.open_tag(tag);

    out.elem(
        "eventTime",
        &event
            .event_time
            .to_rfc3339_opts(SecondsFormat::Millis, true),
    );
    if let Some(t) = &event.record_time {
        out.elem("recordTime", &t.to_rfc3339_opts(SecondsFormat::Millis, true));
    }
    out.elem("eventTimeZoneOffset", &event.event_time_zone_offset);

    if !event.event_id.is_empty() {
        if v2 {
            out.elem("eventID", &event.event_id);
        } else {
            out.open_tag("baseExtension");
            out.elem("eventID", &event.event_id);
            out.close("baseExtension");
        }
    }

    encode_error_declaration(event, v2, out);

    match event.event_type {
        EventType::Object | EventType::Transaction | EventType::Quantity => {
            encode_epc_list(event, EpcType::List, "epcList", out);
        }
        EventType::Aggregation => {
            if let Some(parent) = event.parent_id() {
                out.elem("parentID", &parent.id);
            }
            encode_epc_list(event, EpcType::ChildEpc, "childEPCs", out);
        }
        EventType::Transformation => {}
    }

    if let Some(action) = event.action {
        out.elem("action", action.as_str());
    }
    if let Some(v) = &event.business_step {
        out.elem("bizStep", v);
    }
    if let Some(v) = &event.disposition {
        out.elem("disposition", v);
    }
    if let Some(v) = &event.read_point {
        out.open_tag("readPoint");
        out.elem("id", v);
        out.close("readPoint");
    }
    if let Some(v) = &event.business_location {
        out.open_tag("bizLocation");
        out.elem("id", v);
        out.close("bizLocation");
    }

    if !event.business_transactions.is_empty() {
        out.open_tag("bizTransactionList");
        for bt in &event.business_transactions {
            match &bt.kind {
                Some(kind) => {
                    let mut start = BytesStart::new("bizTransaction");
                    start.push_attribute(("type", kind.as_str()));
                    out.open(start);
                    out.text(&bt.id);
                    out.close("bizTransaction");
                }
                None => out.elem("bizTransaction", &bt.id),
            }
        }
        out.close("bizTransactionList");
    }

    match event.event_type {
        EventType::Transformation => {
            encode_epc_list(event, EpcType::InputEpc, "inputEPCList", out);
            encode_quantity_list(event, EpcType::InputEpc, "inputQuantityList", out);
            encode_epc_list(event, EpcType::OutputEpc, "outputEPCList", out);
            encode_quantity_list(event, EpcType::OutputEpc, "outputQuantityList", out);
            if let Some(v) = &event.transformation_id {
                out.elem("transformationID", v);
            }
        }
        EventType::Quantity => {
            // Legacy QuantityEvent carries a single bare epcClass/quantity pair.
            if let Some(epc) = event.epcs_of_type(EpcType::Quantity).next() {
                out.elem("epcClass", &epc.id);
                if let Some(q) = epc.quantity {
                    out.elem("quantity", &canonical_number(q));
                }
            }
        }
        _ => {
            // 1.x reaches quantityList through the extension wrapper.
            if event.epcs_of_type(EpcType::Quantity).next().is_some() {
                if v2 {
                    encode_quantity_list(event, EpcType::Quantity, "quantityList", out);
                } else {
                    out.open_tag("extension");
                    encode_quantity_list(event, EpcType::Quantity, "quantityList", out);
                    out.close("extension");
                }
            }
        }
    }

    encode_source_dest(event, out);
    encode_ilmd(event, v2, prefixes, out);
    encode_sensor_elements(event, v2, prefixes, out);
    encode_persistent_disposition(event, v2, out);
    if let Some(v) = &event.certification_info {
        out.elem("certificationInfo", v);
    }

    // Event-level user extensions close out the element.
    for node in rebuild_fields(event, FieldKind::Extension, None) {
        encode_extension_node(&node, prefixes, out);
    }

    out.close(tag);
    if wrap_in_extension {
        out.close("extension");
    }
}

fn encode_error_declaration(event: &Event, v2: bool, out: &mut XmlEmitter) {
    if event.corrective_declaration_time.is_none()
        && event.corrective_reason.is_none()
        && event.corrective_event_ids.is_empty()
    {
        return;
    }
    if !v2 {
        out.open_tag("baseExtension");
    }
    out.open_tag("errorDeclaration");
    if let Some(t) = &event.corrective_declaration_time {
        out.elem(
            "declarationTime",
            &t.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
    }
    if let Some(reason) = &event.corrective_reason {
        out.elem("reason", reason);
    }
    if !event.corrective_event_ids.is_empty() {
        out.open_tag("correctiveEventIDs");
        for id in &event.corrective_event_ids {
            out.elem("correctiveEventID", id);
        }
        out.close("correctiveEventIDs");
    }
    out.close("errorDeclaration");
    if !v2 {
        out.close("baseExtension");
    }
}

fn encode_epc_list(event: &Event, epc_type: EpcType, tag: &str, out: &mut XmlEmitter) {
    let epcs: Vec<&Epc> = event
        .epcs_of_type(epc_type)
        .filter(|e| e.quantity.is_none())
        .collect();
    if epcs.is_empty() {
        return;
    }
    out.open_tag(tag);
    for epc in epcs {
        out.elem("epc", &epc.id);
    }
    out.close(tag);
}

fn encode_quantity_list(event: &Event, epc_type: EpcType, tag: &str, out: &mut XmlEmitter) {
    let epcs: Vec<&Epc> = event
        .epcs_of_type(epc_type)
        .filter(|e| e.quantity.is_some() || epc_type == EpcType::Quantity)
        .collect();
    if epcs.is_empty() {
        return;
    }
    out.open_tag(tag);
    for epc in epcs {
        out.open_tag("quantityElement");
        out.elem("epcClass", &epc.id);
        if let Some(q) = epc.quantity {
            out.elem("quantity", &canonical_number(q));
        }
        if let Some(uom) = &epc.unit_of_measure {
            out.elem("uom", uom);
        }
        out.close("quantityElement");
    }
    out.close(tag);
}

fn encode_source_dest(event: &Event, out: &mut XmlEmitter) {
    if !event.sources.is_empty() {
        out.open_tag("sourceList");
        for s in &event.sources {
            let mut start = BytesStart::new("source");
            start.push_attribute(("type", s.kind.as_str()));
            out.open(start);
            out.text(&s.id);
            out.close("source");
        }
        out.close("sourceList");
    }
    if !event.destinations.is_empty() {
        out.open_tag("destinationList");
        for d in &event.destinations {
            let mut start = BytesStart::new("destination");
            start.push_attribute(("type", d.kind.as_str()));
            out.open(start);
            out.text(&d.id);
            out.close("destination");
        }
        out.close("destinationList");
    }
}

fn encode_ilmd(event: &Event, v2: bool, prefixes: &HashMap<String, String>, out: &mut XmlEmitter) {
    let nodes = rebuild_fields(event, FieldKind::Ilmd, None);
    if nodes.is_empty() {
        return;
    }
    if !v2 {
        out.open_tag("extension");
    }
    out.open_tag("ilmd");
    for node in nodes {
        encode_extension_node(&node, prefixes, out);
    }
    out.close("ilmd");
    if !v2 {
        out.close("extension");
    }
}

fn encode_sensor_elements(
    event: &Event,
    v2: bool,
    prefixes: &HashMap<String, String>,
    out: &mut XmlEmitter,
) {
    if event.sensor_elements.is_empty() {
        return;
    }
    if !v2 {
        out.open_tag("extension");
    }
    out.open_tag("sensorElementList");
    let mut report_ordinal = 0;
    for element in &event.sensor_elements {
        encode_sensor_element(element, event, &mut report_ordinal, prefixes, out);
    }
    out.close("sensorElementList");
    if !v2 {
        out.close("extension");
    }
}

fn encode_sensor_element(
    element: &SensorElement,
    event: &Event,
    report_ordinal: &mut i32,
    prefixes: &HashMap<String, String>,
    out: &mut XmlEmitter,
) {
    out.open_tag("sensorElement");

    let has_metadata = element.time.is_some()
        || element.device_id.is_some()
        || element.device_metadata.is_some()
        || element.raw_data.is_some()
        || element.data_processing_method.is_some()
        || element.biz_rules.is_some();
    if has_metadata {
        let mut meta = BytesStart::new("sensorMetadata");
        if let Some(t) = &element.time {
            meta.push_attribute((
                "time",
                t.to_rfc3339_opts(SecondsFormat::Millis, true).as_str(),
            ));
        }
        push_attr(&mut meta, "deviceID", element.device_id.as_deref());
        push_attr(&mut meta, "deviceMetadata", element.device_metadata.as_deref());
        push_attr(&mut meta, "rawData", element.raw_data.as_deref());
        push_attr(
            &mut meta,
            "dataProcessingMethod",
            element.data_processing_method.as_deref(),
        );
        push_attr(&mut meta, "bizRules", element.biz_rules.as_deref());
        out.empty(meta);
    }

    for report in &element.reports {
        let mut start = BytesStart::new("sensorReport");
        push_attr(&mut start, "type", report.report_type.as_deref());
        push_attr(&mut start, "deviceID", report.device_id.as_deref());
        push_attr(&mut start, "rawData", report.raw_data.as_deref());
        push_attr(
            &mut start,
            "dataProcessingMethod",
            report.data_processing_method.as_deref(),
        );
        if let Some(t) = &report.time {
            start.push_attribute((
                "time",
                t.to_rfc3339_opts(SecondsFormat::Millis, true).as_str(),
            ));
        }
        push_attr(&mut start, "microorganism", report.microorganism.as_deref());
        push_attr(
            &mut start,
            "chemicalSubstance",
            report.chemical_substance.as_deref(),
        );
        push_num_attr(&mut start, "value", report.value);
        push_attr(&mut start, "stringValue", report.string_value.as_deref());
        if let Some(b) = report.boolean_value {
            start.push_attribute(("booleanValue", b.to_string().as_str()));
        }
        push_attr(&mut start, "hexBinaryValue", report.hex_binary_value.as_deref());
        push_attr(&mut start, "uriValue", report.uri_value.as_deref());
        push_num_attr(&mut start, "minValue", report.min_value);
        push_num_attr(&mut start, "maxValue", report.max_value);
        push_num_attr(&mut start, "meanValue", report.mean_value);
        push_num_attr(&mut start, "sDev", report.s_dev);
        push_num_attr(&mut start, "percRank", report.perc_rank);
        push_num_attr(&mut start, "percValue", report.perc_value);
        push_attr(&mut start, "uom", report.uom.as_deref());
        push_attr(&mut start, "component", report.component.as_deref());
        push_attr(&mut start, "exception", report.exception.as_deref());

        // Report-extension attributes bound to this report's ordinal.
        for node in rebuild_fields(event, FieldKind::SensorReportExtension, Some(*report_ordinal)) {
            if let Some(prefix) = prefixes.get(&node.namespace) {
                start.push_attribute((
                    format!("{prefix}:{}", node.name).as_str(),
                    node.text.as_deref().unwrap_or_default(),
                ));
            }
        }
        *report_ordinal += 1;
        out.empty(start);
    }

    for node in rebuild_fields(event, FieldKind::SensorElementExtension, Some(element.index)) {
        encode_extension_node(&node, prefixes, out);
    }

    out.close("sensorElement");
}

fn encode_persistent_disposition(event: &Event, v2: bool, out: &mut XmlEmitter) {
    if event.persistent_dispositions.is_empty() {
        return;
    }
    // persistentDisposition is a 2.0 construct; under 1.2 it still travels,
    // tucked behind the extension wrapper like other post-1.2 additions.
    if !v2 {
        out.open_tag("extension");
    }
    for pd in &event.persistent_dispositions {
        out.open_tag("persistentDisposition");
        for v in &pd.set {
            out.elem("set", v);
        }
        for v in &pd.unset {
            out.elem("unset", v);
        }
        out.close("persistentDisposition");
    }
    if !v2 {
        out.close("extension");
    }
}

fn rebuild_fields(event: &Event, kind: FieldKind, entity_index: Option<i32>) -> Vec<ExtensionNode> {
    let partition: Vec<&Field> = event
        .fields
        .iter()
        .filter(|f| f.kind.element() == kind.element() && f.entity_index == entity_index)
        .collect();
    rebuild(&partition)
}

fn encode_extension_node(
    node: &ExtensionNode,
    prefixes: &HashMap<String, String>,
    out: &mut XmlEmitter,
) {
    let name = match prefixes.get(&node.namespace) {
        Some(prefix) => format!("{prefix}:{}", node.name),
        None => node.name.clone(),
    };
    let mut start = BytesStart::new(name.as_str());
    for (attr_name, attr_value) in &node.attributes {
        start.push_attribute((attr_name.as_str(), attr_value.as_str()));
    }
    if node.children.is_empty() && node.text.is_none() {
        out.empty(start);
        return;
    }
    out.open(start);
    if let Some(text) = &node.text {
        out.text(text);
    }
    for child in &node.children {
        encode_extension_node(child, prefixes, out);
    }
    out.close(&name);
}

fn push_attr(start: &mut BytesStart<'_>, name: &str, value: Option<&str>) {
    if let Some(v) = value {
        start.push_attribute((name, v));
    }
}

fn push_num_attr(start: &mut BytesStart<'_>, name: &str, value: Option<f64>) {
    if let Some(v) = value {
        start.push_attribute((name, canonical_number(v).as_str()));
    }
}

fn sorted(prefixes: &HashMap<String, String>) -> Vec<(&String, &String)> {
    let mut entries: Vec<_> = prefixes.iter().collect();
    entries.sort();
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::decode::decode_document;

    const ROUND_TRIP_V2: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<epcis:EPCISDocument xmlns:epcis="urn:epcglobal:epcis:xsd:2"
    xmlns:acme="https://ns.acme.example/epcis" schemaVersion="2.0"
    creationDate="2025-01-15T11:00:00Z">
  <EPCISBody>
    <EventList>
      <ObjectEvent>
        <eventTime>2025-01-15T10:30:00Z</eventTime>
        <eventTimeZoneOffset>+00:00</eventTimeZoneOffset>
        <eventID>ni:///sha-256;abc?ver=CBV2.0</eventID>
        <epcList><epc>urn:epc:id:sgtin:8901213.105919.000000</epc></epcList>
        <action>OBSERVE</action>
        <bizStep>urn:epcglobal:cbv:bizstep:receiving</bizStep>
        <readPoint><id>urn:epc:id:sgln:0037000.00729.0</id></readPoint>
        <ilmd><acme:lot>ABC123</acme:lot></ilmd>
        <acme:shipment priority="high">
          <acme:carrier>ACME Freight</acme:carrier>
        </acme:shipment>
      </ObjectEvent>
    </EventList>
  </EPCISBody>
</epcis:EPCISDocument>"#;

    #[test]
    fn encode_decode_round_trips_v2() {
        let original = decode_document(ROUND_TRIP_V2.as_bytes()).unwrap();
        let encoded = encode_document(&original);
        let reparsed = decode_document(encoded.as_bytes()).unwrap();

        assert_eq!(reparsed.schema_version, original.schema_version);
        assert_eq!(reparsed.events.len(), 1);

        let a = &original.events[0];
        let b = &reparsed.events[0];
        assert_eq!(b.event_id, a.event_id);
        assert_eq!(b.event_time, a.event_time);
        assert_eq!(b.action, a.action);
        assert_eq!(b.business_step, a.business_step);
        assert_eq!(b.read_point, a.read_point);
        assert_eq!(b.epcs, a.epcs);
        assert_eq!(b.fields, a.fields);
    }

    const ROUND_TRIP_V1: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<epcis:EPCISDocument xmlns:epcis="urn:epcglobal:epcis:xsd:1" schemaVersion="1.2">
  <EPCISBody>
    <EventList>
      <AggregationEvent>
        <eventTime>2025-02-01T07:45:00Z</eventTime>
        <eventTimeZoneOffset>+01:00</eventTimeZoneOffset>
        <parentID>urn:epc:id:sscc:0614141.1234567890</parentID>
        <childEPCs><epc>urn:epc:id:sgtin:0614141.107346.2017</epc></childEPCs>
        <action>ADD</action>
      </AggregationEvent>
      <extension>
        <TransformationEvent>
          <eventTime>2025-02-01T09:00:00Z</eventTime>
          <eventTimeZoneOffset>+00:00</eventTimeZoneOffset>
          <inputEPCList><epc>urn:epc:id:sgtin:4012345.011122.25</epc></inputEPCList>
          <outputEPCList><epc>urn:epc:id:sgtin:4012345.077889.25</epc></outputEPCList>
        </TransformationEvent>
      </extension>
    </EventList>
  </EPCISBody>
</epcis:EPCISDocument>"#;

    #[test]
    fn v1_transformation_events_are_rewrapped() {
        let original = decode_document(ROUND_TRIP_V1.as_bytes()).unwrap();
        let encoded = encode_document(&original);

        assert!(encoded.contains("<extension><TransformationEvent>"));

        let reparsed = decode_document(encoded.as_bytes()).unwrap();
        assert_eq!(reparsed.events.len(), 2);
        assert_eq!(reparsed.events[0].epcs, original.events[0].epcs);
        assert_eq!(reparsed.events[1].epcs, original.events[1].epcs);
    }

    #[test]
    fn query_results_envelope_is_emitted() {
        let capture = decode_document(ROUND_TRIP_V2.as_bytes()).unwrap();
        let body = encode_query_results(
            &capture.events,
            SchemaVersion::V2_0,
            "SimpleEventQuery",
            Some("sub-1"),
        );
        assert!(body.contains("<epcisq:QueryResults>"));
        assert!(body.contains("<queryName>SimpleEventQuery</queryName>"));
        assert!(body.contains("<subscriptionID>sub-1</subscriptionID>"));
        assert!(body.contains("<ObjectEvent>"));
    }

    #[test]
    fn generated_prefixes_cover_unknown_namespaces() {
        let mut capture = decode_document(ROUND_TRIP_V2.as_bytes()).unwrap();
        capture.namespaces.clear();
        let encoded = encode_document(&capture);
        assert!(encoded.contains(r#"xmlns:ext1="https://ns.acme.example/epcis""#));

        let reparsed = decode_document(encoded.as_bytes()).unwrap();
        assert_eq!(reparsed.events[0].fields, capture.events[0].fields);
    }

    #[test]
    fn sensor_reports_round_trip() {
        let doc = r#"<EPCISDocument schemaVersion="2.0"><EPCISBody><EventList>
          <ObjectEvent>
            <eventTime>2025-03-10T12:00:00Z</eventTime>
            <eventTimeZoneOffset>+00:00</eventTimeZoneOffset>
            <epcList><epc>urn:epc:id:sgtin:1.1.1</epc></epcList>
            <action>OBSERVE</action>
            <sensorElementList>
              <sensorElement>
                <sensorMetadata deviceID="urn:epc:id:giai:4000001.111"/>
                <sensorReport type="gs1:MT-Temperature" value="6" uom="CEL"/>
              </sensorElement>
            </sensorElementList>
          </ObjectEvent>
        </EventList></EPCISBody></EPCISDocument>"#;
        let original = decode_document(doc.as_bytes()).unwrap();
        let encoded = encode_document(&original);
        let reparsed = decode_document(encoded.as_bytes()).unwrap();
        assert_eq!(
            reparsed.events[0].sensor_elements,
            original.events[0].sensor_elements
        );
    }

    #[test]
    fn reserved_characters_survive_a_round_trip() {
        let mut capture = decode_document(ROUND_TRIP_V2.as_bytes()).unwrap();
        capture.events[0].business_step = Some("urn:example:a&b<c>".to_owned());
        let encoded = encode_document(&capture);
        assert!(encoded.contains("urn:example:a&amp;b&lt;c&gt;"));

        let reparsed = decode_document(encoded.as_bytes()).unwrap();
        assert_eq!(
            reparsed.events[0].business_step,
            capture.events[0].business_step
        );
    }
}
