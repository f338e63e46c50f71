//! Semantic validation of decoded captures, applied before persistence.
//!
//! These are the EPCIS rules schema checks cannot express: per-variant
//! action requirements, the aggregation parent rule, sensor index
//! referential integrity, and in-capture event-id uniqueness.

use std::collections::HashSet;

use epcis_common::error::Violation;
use epcis_common::model::{Capture, EpcType, Event, EventAction, EventType};

/// `±HH:MM`, the only offset shape EPCIS permits.
fn offset_is_valid(offset: &str) -> bool {
    let bytes = offset.as_bytes();
    bytes.len() == 6
        && (bytes[0] == b'+' || bytes[0] == b'-')
        && bytes[1].is_ascii_digit()
        && bytes[2].is_ascii_digit()
        && bytes[3] == b':'
        && bytes[4].is_ascii_digit()
        && bytes[5].is_ascii_digit()
}

/// Validate a whole capture. Empty result means the capture may persist.
pub fn validate_capture(capture: &Capture) -> Vec<Violation> {
    let mut violations = Vec::new();

    let mut seen_event_ids: HashSet<&str> = HashSet::new();
    for (position, event) in capture.events.iter().enumerate() {
        validate_event(event, position, &mut violations);

        if !event.event_id.is_empty() && !seen_event_ids.insert(&event.event_id) {
            violations.push(Violation::new(
                "DuplicateEventId",
                format!("event {position}: eventID {} occurs twice in this capture", event.event_id),
            ));
        }
    }

    violations
}

fn validate_event(event: &Event, position: usize, violations: &mut Vec<Violation>) {
    if !offset_is_valid(&event.event_time_zone_offset) {
        violations.push(Violation::new(
            "EventTimeZoneOffset",
            format!(
                "event {position}: eventTimeZoneOffset {:?} is not ±HH:MM",
                event.event_time_zone_offset
            ),
        ));
    }

    match event.event_type {
        EventType::Object | EventType::Aggregation | EventType::Transaction
        | EventType::Quantity => {
            if event.action.is_none() {
                violations.push(Violation::new(
                    "ActionRequired",
                    format!("event {position}: {} requires an action", event.event_type),
                ));
            }
        }
        EventType::Transformation => {
            if event.action.is_some() {
                violations.push(Violation::new(
                    "TransformationHasNoAction",
                    format!("event {position}: TransformationEvent must not carry an action"),
                ));
            }
            let has_input = event.epcs_of_type(EpcType::InputEpc).next().is_some();
            let has_output = event.epcs_of_type(EpcType::OutputEpc).next().is_some();
            if !has_input && !has_output {
                violations.push(Violation::new(
                    "TransformationRequiresEpcs",
                    format!(
                        "event {position}: TransformationEvent needs at least one input or output EPC"
                    ),
                ));
            }
        }
    }

    if event.event_type == EventType::Aggregation {
        if let Some(action) = event.action {
            if matches!(action, EventAction::Add | EventAction::Delete) {
                let parents = event.epcs_of_type(EpcType::ParentId).count();
                if parents != 1 {
                    violations.push(Violation::new(
                        "AggregationAddRequiresParent",
                        format!(
                            "event {position}: AggregationEvent with {action} needs exactly one parentID, found {parents}"
                        ),
                    ));
                }
            }
        }
    }

    let element_indexes: HashSet<i32> =
        event.sensor_elements.iter().map(|s| s.index).collect();
    for element in &event.sensor_elements {
        for report in &element.reports {
            if !element_indexes.contains(&report.sensor_index) {
                violations.push(Violation::new(
                    "SensorReportIndex",
                    format!(
                        "event {position}: sensorReport references sensor element {} which does not exist",
                        report.sensor_index
                    ),
                ));
            }
        }
    }

    for field in &event.fields {
        if let Some(parent) = field.parent_index {
            let parent_ok = parent < field.index
                && event.fields.iter().any(|f| {
                    f.index == parent && f.entity_index == field.entity_index
                });
            if !parent_ok {
                violations.push(Violation::new(
                    "FieldParentIndex",
                    format!(
                        "event {position}: field {} has parentIndex {parent} that does not reference an earlier field",
                        field.index
                    ),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use epcis_common::model::{Epc, Field, FieldKind, SchemaVersion, SensorElement, SensorReport};

    fn event(event_type: EventType) -> Event {
        let time = Utc.with_ymd_and_hms(2025, 1, 15, 10, 30, 0).unwrap();
        Event::new(event_type, time, "+00:00")
    }

    fn capture_of(events: Vec<Event>) -> Capture {
        let mut capture = Capture::new(SchemaVersion::V2_0);
        capture.events = events;
        capture
    }

    fn rules(capture: &Capture) -> Vec<String> {
        validate_capture(capture)
            .into_iter()
            .map(|v| v.rule)
            .collect()
    }

    #[test]
    fn valid_object_event_passes() {
        let mut e = event(EventType::Object);
        e.action = Some(EventAction::Observe);
        assert!(rules(&capture_of(vec![e])).is_empty());
    }

    #[test]
    fn object_event_without_action_fails() {
        let e = event(EventType::Object);
        assert_eq!(rules(&capture_of(vec![e])), vec!["ActionRequired"]);
    }

    #[test]
    fn aggregation_add_without_parent_fails() {
        let mut e = event(EventType::Aggregation);
        e.action = Some(EventAction::Add);
        e.epcs.push(Epc::new(EpcType::ChildEpc, "urn:epc:id:sgtin:1.1.0001"));
        e.epcs.push(Epc::new(EpcType::ChildEpc, "urn:epc:id:sgtin:1.1.0002"));
        assert_eq!(
            rules(&capture_of(vec![e])),
            vec!["AggregationAddRequiresParent"]
        );
    }

    #[test]
    fn aggregation_observe_without_parent_is_fine() {
        let mut e = event(EventType::Aggregation);
        e.action = Some(EventAction::Observe);
        e.epcs.push(Epc::new(EpcType::ChildEpc, "urn:epc:id:sgtin:1.1.0001"));
        assert!(rules(&capture_of(vec![e])).is_empty());
    }

    #[test]
    fn aggregation_delete_with_parent_passes() {
        let mut e = event(EventType::Aggregation);
        e.action = Some(EventAction::Delete);
        e.epcs.push(Epc::new(EpcType::ParentId, "urn:epc:id:sscc:1.1"));
        assert!(rules(&capture_of(vec![e])).is_empty());
    }

    #[test]
    fn transformation_needs_input_or_output() {
        let e = event(EventType::Transformation);
        assert_eq!(
            rules(&capture_of(vec![e])),
            vec!["TransformationRequiresEpcs"]
        );

        let mut e = event(EventType::Transformation);
        e.epcs.push(Epc::new(EpcType::InputEpc, "urn:epc:id:sgtin:1.1.1"));
        assert!(rules(&capture_of(vec![e])).is_empty());
    }

    #[test]
    fn transformation_with_action_fails() {
        let mut e = event(EventType::Transformation);
        e.action = Some(EventAction::Add);
        e.epcs.push(Epc::new(EpcType::InputEpc, "urn:epc:id:sgtin:1.1.1"));
        assert_eq!(
            rules(&capture_of(vec![e])),
            vec!["TransformationHasNoAction"]
        );
    }

    #[test]
    fn bad_timezone_offset_fails() {
        let mut e = event(EventType::Object);
        e.action = Some(EventAction::Observe);
        e.event_time_zone_offset = "+1:00".to_owned();
        assert_eq!(rules(&capture_of(vec![e])), vec!["EventTimeZoneOffset"]);
    }

    #[test]
    fn duplicate_event_ids_in_one_capture_fail() {
        let mut a = event(EventType::Object);
        a.action = Some(EventAction::Observe);
        a.event_id = "urn:uuid:1".to_owned();
        let mut b = event(EventType::Object);
        b.action = Some(EventAction::Observe);
        b.event_id = "urn:uuid:1".to_owned();
        assert_eq!(rules(&capture_of(vec![a, b])), vec!["DuplicateEventId"]);
    }

    #[test]
    fn sensor_report_must_reference_existing_element() {
        let mut e = event(EventType::Object);
        e.action = Some(EventAction::Observe);
        let mut element = SensorElement::new(0);
        element.reports.push(SensorReport {
            sensor_index: 3,
            ..Default::default()
        });
        e.sensor_elements.push(element);
        assert_eq!(rules(&capture_of(vec![e])), vec!["SensorReportIndex"]);
    }

    #[test]
    fn field_parent_must_be_an_earlier_field() {
        let mut e = event(EventType::Object);
        e.action = Some(EventAction::Observe);
        e.fields
            .push(Field::element(FieldKind::Ilmd, 0, Some(5), "ns", "orphan"));
        assert_eq!(rules(&capture_of(vec![e])), vec!["FieldParentIndex"]);
    }

    #[test]
    fn offsets_are_strict() {
        assert!(offset_is_valid("+00:00"));
        assert!(offset_is_valid("-05:30"));
        assert!(!offset_is_valid("00:00"));
        assert!(!offset_is_valid("+0000"));
        assert!(!offset_is_valid("+00:0"));
    }
}
