//! EPCIS 1.x / 2.0 XML decoding into the canonical capture aggregate.
//!
//! One walker serves both schema generations: the version is sniffed from
//! the document's `schemaVersion` attribute, and 1.x `extension` /
//! `baseExtension` wrappers are hoisted transparently before any child
//! dispatch.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use epcis_common::error::{EpcisError, Violation};
use epcis_common::model::{
    BusinessTransaction, Capture, Epc, EpcType, Event, EventType, FieldKind, MasterData,
    MasterDataAttribute, PersistentDisposition, SchemaVersion, SensorElement, SensorReport,
    SourceDest,
};

use crate::fields::{flatten, ExtensionNode, FieldAllocator};
use crate::xml::dom::{self, XmlNode};
use crate::xml::is_standard_ns;

/// Decode an EPCIS XML document (either generation) into a capture.
pub fn decode_document(bytes: &[u8]) -> Result<Capture, EpcisError> {
    let doc = dom::parse(bytes)?;
    let root = &doc.root;

    if root.name != "EPCISDocument" {
        return Err(EpcisError::SchemaInvalid(vec![Violation::new(
            "DocumentRoot",
            format!("expected EPCISDocument, found {}", root.name),
        )]));
    }

    let version: SchemaVersion = root
        .attr("schemaVersion")
        .ok_or_else(|| EpcisError::UnsupportedVersion("missing schemaVersion".to_owned()))?
        .parse()?;

    let mut capture = Capture::new(version);
    capture.document_time = root.attr("creationDate").and_then(parse_time);
    capture.namespaces = doc
        .namespaces
        .iter()
        .filter(|(uri, _)| !is_standard_ns(Some(uri)))
        .map(|(uri, prefix)| (uri.clone(), prefix.clone()))
        .collect();

    if let Some(header) = root.child("EPCISHeader") {
        decode_header(header, &mut capture);
    }

    let body = root.child("EPCISBody").ok_or_else(|| {
        EpcisError::SchemaInvalid(vec![Violation::new("DocumentBody", "missing EPCISBody")])
    })?;

    if let Some(event_list) = body.child("EventList") {
        let v2 = version.is_v2();
        for node in effective_children(event_list, v2) {
            if let Ok(event_type) = node.name.parse::<EventType>() {
                capture.events.push(decode_event(node, event_type, v2)?);
            }
        }
    }

    Ok(capture)
}

fn decode_header(header: &XmlNode, capture: &mut Capture) {
    if let Some(sbdh) = header.child("StandardBusinessDocumentHeader") {
        // Stored unprefixed; the fragment only travels back out inside our
        // own EPCISHeader.
        capture.standard_business_header = Some(dom::render(sbdh, &HashMap::new()));
    }

    // Masterdata may sit under extension>EPCISMasterDataDocument (1.x) or
    // directly under the header (2.0); find VocabularyList at any depth.
    collect_vocabularies(header, &mut capture.masterdata);
}

fn collect_vocabularies(node: &XmlNode, out: &mut Vec<MasterData>) {
    if node.name == "Vocabulary" {
        let vocabulary_type = node.attr("type").unwrap_or_default().to_owned();
        if let Some(list) = node.child("VocabularyElementList") {
            for element in list.children_named("VocabularyElement") {
                let Some(id) = element.attr("id") else {
                    continue;
                };
                let attributes = element
                    .children_named("attribute")
                    .filter_map(|a| {
                        a.attr("id").map(|name| MasterDataAttribute {
                            name: name.to_owned(),
                            value: a.text.clone(),
                        })
                    })
                    .collect();
                let children = element
                    .child("children")
                    .map(|c| {
                        c.children_named("id")
                            .map(|id_node| id_node.text.clone())
                            .collect()
                    })
                    .unwrap_or_default();
                out.push(MasterData {
                    vocabulary_type: vocabulary_type.clone(),
                    id: id.to_owned(),
                    attributes,
                    children,
                });
            }
        }
        return;
    }
    for child in &node.children {
        collect_vocabularies(child, out);
    }
}

/// Children with 1.x `extension`/`baseExtension` wrappers hoisted one level.
fn effective_children(node: &XmlNode, v2: bool) -> Vec<&XmlNode> {
    let mut out = Vec::new();
    for child in &node.children {
        if !v2
            && (child.name == "extension" || child.name == "baseExtension")
            && is_standard_ns(child.namespace.as_deref())
        {
            out.extend(effective_children(child, v2));
        } else {
            out.push(child);
        }
    }
    out
}

fn decode_event(node: &XmlNode, event_type: EventType, v2: bool) -> Result<Event, EpcisError> {
    let children = effective_children(node, v2);

    let event_time = children
        .iter()
        .find(|c| c.name == "eventTime")
        .and_then(|c| parse_time(&c.text))
        .ok_or_else(|| {
            EpcisError::SchemaInvalid(vec![Violation::new(
                "EventTime",
                format!("{event_type} without a parseable eventTime"),
            )])
        })?;
    let offset = children
        .iter()
        .find(|c| c.name == "eventTimeZoneOffset")
        .map(|c| c.text.clone())
        .unwrap_or_default();

    let mut event = Event::new(event_type, event_time, &offset);
    let mut alloc = FieldAllocator::new();
    let mut sensor_index = 0;
    let mut report_ordinal = 0;

    for child in children {
        match child.name.as_str() {
            "eventTime" | "eventTimeZoneOffset" | "recordTime" => {}
            "eventID" => event.event_id = child.text.clone(),
            "action" => event.action = Some(child.text.parse()?),
            "bizStep" => event.business_step = some_text(child),
            "disposition" => event.disposition = some_text(child),
            "transformationID" => event.transformation_id = some_text(child),
            "certificationInfo" => event.certification_info = some_text(child),
            "readPoint" => event.read_point = child.child_text("id").map(str::to_owned),
            "bizLocation" => event.business_location = child.child_text("id").map(str::to_owned),
            "parentID" => event.epcs.push(Epc::new(EpcType::ParentId, child.text.clone())),
            "epcList" => decode_epc_list(child, EpcType::List, &mut event),
            "childEPCs" => decode_epc_list(child, EpcType::ChildEpc, &mut event),
            "inputEPCList" => decode_epc_list(child, EpcType::InputEpc, &mut event),
            "outputEPCList" => decode_epc_list(child, EpcType::OutputEpc, &mut event),
            "quantityList" => decode_quantity_list(child, EpcType::Quantity, &mut event),
            "inputQuantityList" => decode_quantity_list(child, EpcType::InputEpc, &mut event),
            "outputQuantityList" => decode_quantity_list(child, EpcType::OutputEpc, &mut event),
            // 1.x QuantityEvent has a bare epcClass/quantity pair.
            "epcClass" => event
                .epcs
                .push(Epc::new(EpcType::Quantity, child.text.clone())),
            "quantity" => {
                if let Some(epc) = event.epcs.last_mut() {
                    epc.quantity = child.text.parse().ok();
                }
            }
            "bizTransactionList" => {
                for bt in child.children_named("bizTransaction") {
                    event.business_transactions.push(BusinessTransaction {
                        kind: bt.attr("type").map(str::to_owned),
                        id: bt.text.clone(),
                    });
                }
            }
            "sourceList" => {
                for s in child.children_named("source") {
                    event.sources.push(SourceDest {
                        kind: s.attr("type").unwrap_or_default().to_owned(),
                        id: s.text.clone(),
                    });
                }
            }
            "destinationList" => {
                for d in child.children_named("destination") {
                    event.destinations.push(SourceDest {
                        kind: d.attr("type").unwrap_or_default().to_owned(),
                        id: d.text.clone(),
                    });
                }
            }
            "persistentDisposition" => {
                event.persistent_dispositions.push(PersistentDisposition {
                    set: child.children_named("set").map(|n| n.text.clone()).collect(),
                    unset: child
                        .children_named("unset")
                        .map(|n| n.text.clone())
                        .collect(),
                });
            }
            "errorDeclaration" => {
                let decl_children = effective_children(child, v2);
                for dc in decl_children {
                    match dc.name.as_str() {
                        "declarationTime" => {
                            event.corrective_declaration_time = parse_time(&dc.text)
                        }
                        "reason" => event.corrective_reason = some_text(dc),
                        "correctiveEventIDs" => {
                            event.corrective_event_ids = dc
                                .children_named("correctiveEventID")
                                .map(|n| n.text.clone())
                                .collect();
                        }
                        _ => {}
                    }
                }
            }
            "ilmd" => {
                for custom in &child.children {
                    if !is_standard_ns(custom.namespace.as_deref()) {
                        let ext = to_extension_node(custom);
                        flatten(&ext, FieldKind::Ilmd, None, None, &mut alloc, &mut event.fields);
                    }
                }
            }
            "sensorElementList" => {
                for element_node in child.children_named("sensorElement") {
                    let element = decode_sensor_element(
                        element_node,
                        sensor_index,
                        &mut report_ordinal,
                        &mut alloc,
                        &mut event,
                    );
                    event.sensor_elements.push(element);
                    sensor_index += 1;
                }
            }
            _ => {
                // Anything in a foreign namespace is a user extension.
                if !is_standard_ns(child.namespace.as_deref()) {
                    let ext = to_extension_node(child);
                    flatten(
                        &ext,
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

fn decode_epc_list(list: &XmlNode, epc_type: EpcType, event: &mut Event) {
    for epc in list.children_named("epc") {
        event.epcs.push(Epc::new(epc_type, epc.text.clone()));
    }
}

fn decode_quantity_list(list: &XmlNode, epc_type: EpcType, event: &mut Event) {
    for element in list.children_named("quantityElement") {
        let Some(class) = element.child_text("epcClass") else {
            continue;
        };
        let mut epc = Epc::new(epc_type, class);
        epc.quantity = element.child_text("quantity").and_then(|q| q.parse().ok());
        epc.unit_of_measure = element.child_text("uom").map(str::to_owned);
        event.epcs.push(epc);
    }
}

fn decode_sensor_element(
    node: &XmlNode,
    index: i32,
    report_ordinal: &mut i32,
    alloc: &mut FieldAllocator,
    event: &mut Event,
) -> SensorElement {
    let mut element = SensorElement::new(index);

    if let Some(meta) = node.child("sensorMetadata") {
        element.time = meta.attr("time").and_then(parse_time);
        element.device_id = meta.attr("deviceID").map(str::to_owned);
        element.device_metadata = meta.attr("deviceMetadata").map(str::to_owned);
        element.raw_data = meta.attr("rawData").map(str::to_owned);
        element.data_processing_method = meta.attr("dataProcessingMethod").map(str::to_owned);
        element.biz_rules = meta.attr("bizRules").map(str::to_owned);

        for attr in &meta.attributes {
            if !is_standard_ns(attr.namespace.as_deref()) && attr.namespace.is_some() {
                let ext = ExtensionNode::leaf(
                    attr.namespace.clone().unwrap_or_default(),
                    attr.name.clone(),
                    &attr.value,
                );
                flatten(
                    &ext,
                    FieldKind::SensorElementExtension,
                    None,
                    Some(index),
                    alloc,
                    &mut event.fields,
                );
            }
        }
    }

    for report_node in node.children_named("sensorReport") {
        element
            .reports
            .push(decode_sensor_report(report_node, index));

        for attr in &report_node.attributes {
            if !is_standard_ns(attr.namespace.as_deref()) && attr.namespace.is_some() {
                let ext = ExtensionNode::leaf(
                    attr.namespace.clone().unwrap_or_default(),
                    attr.name.clone(),
                    &attr.value,
                );
                // Report-kind fields bind to the report's ordinal within the
                // event, counted across all sensor elements.
                flatten(
                    &ext,
                    FieldKind::SensorReportExtension,
                    None,
                    Some(*report_ordinal),
                    alloc,
                    &mut event.fields,
                );
            }
        }
        *report_ordinal += 1;
    }

    // Foreign child elements of the sensorElement are element extensions.
    for child in &node.children {
        if !is_standard_ns(child.namespace.as_deref()) {
            let ext = to_extension_node(child);
            flatten(
                &ext,
                FieldKind::SensorElementExtension,
                None,
                Some(index),
                alloc,
                &mut event.fields,
            );
        }
    }

    element
}

fn decode_sensor_report(node: &XmlNode, sensor_index: i32) -> SensorReport {
    let num = |name: &str| node.attr(name).and_then(|v| v.parse::<f64>().ok());
    SensorReport {
        sensor_index,
        report_type: node.attr("type").map(str::to_owned),
        device_id: node.attr("deviceID").map(str::to_owned),
        raw_data: node.attr("rawData").map(str::to_owned),
        data_processing_method: node.attr("dataProcessingMethod").map(str::to_owned),
        time: node.attr("time").and_then(parse_time),
        microorganism: node.attr("microorganism").map(str::to_owned),
        chemical_substance: node.attr("chemicalSubstance").map(str::to_owned),
        value: num("value"),
        string_value: node.attr("stringValue").map(str::to_owned),
        boolean_value: node.attr("booleanValue").and_then(|v| v.parse().ok()),
        hex_binary_value: node.attr("hexBinaryValue").map(str::to_owned),
        uri_value: node.attr("uriValue").map(str::to_owned),
        min_value: num("minValue"),
        max_value: num("maxValue"),
        mean_value: num("meanValue"),
        s_dev: num("sDev"),
        perc_rank: num("percRank"),
        perc_value: num("percValue"),
        uom: node.attr("uom").map(str::to_owned),
        component: node.attr("component").map(str::to_owned),
        exception: node.attr("exception").map(str::to_owned),
    }
}

/// Convert a foreign-namespace subtree to the flattener's input shape.
fn to_extension_node(node: &XmlNode) -> ExtensionNode {
    ExtensionNode {
        namespace: node.namespace.clone().unwrap_or_default(),
        name: node.name.clone(),
        attributes: node
            .attributes
            .iter()
            .map(|a| (a.name.clone(), a.value.clone()))
            .collect(),
        text: if node.children.is_empty() && !node.text.is_empty() {
            Some(node.text.clone())
        } else {
            None
        },
        children: node.children.iter().map(to_extension_node).collect(),
    }
}

fn some_text(node: &XmlNode) -> Option<String> {
    if node.text.is_empty() {
        None
    } else {
        Some(node.text.clone())
    }
}

fn parse_time(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
