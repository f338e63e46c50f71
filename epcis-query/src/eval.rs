//! Direct predicate evaluation over in-memory events.
//!
//! This is the reference semantics for the filter chain: the memory store
//! runs queries through it, and the SQL translation is held to the same
//! behavior by the shared test corpus.

use chrono::{DateTime, Utc};

use epcis_common::model::{Event, Field, SensorReport};

use crate::predicate::{
    epc_pattern_matches, CmpValue, Comparator, LocationField, OrderDirection, OrderKey, Predicate,
    ScalarField, SensorCondition, SensorField,
};

/// Masterdata joins needed by `WD_`/`HASATTR_`/`EQATTR_` predicates.
pub trait MasterdataLookup {
    /// Whether `candidate` equals `root` or is declared a descendant of it.
    fn is_descendant_or_self(&self, root: &str, candidate: &str) -> bool;
    fn attribute(&self, id: &str, attribute: &str) -> Option<String>;
}

/// Lookup for stores with no masterdata loaded.
pub struct NoMasterdata;

impl MasterdataLookup for NoMasterdata {
    fn is_descendant_or_self(&self, root: &str, candidate: &str) -> bool {
        root == candidate
    }

    fn attribute(&self, _id: &str, _attribute: &str) -> Option<String> {
        None
    }
}

/// Evaluate the whole chain (logical AND) against one event.
/// `tenant_id` is the tenant of the event's owning capture.
pub fn event_matches(
    predicates: &[Predicate],
    event: &Event,
    tenant_id: &str,
    masterdata: &dyn MasterdataLookup,
) -> bool {
    predicates
        .iter()
        .all(|p| predicate_matches(p, event, tenant_id, masterdata))
}

fn predicate_matches(
    predicate: &Predicate,
    event: &Event,
    tenant_id: &str,
    masterdata: &dyn MasterdataLookup,
) -> bool {
    match predicate {
        Predicate::TenantIs(tenant) => tenant == tenant_id,
        Predicate::EventTypeIn(types) => types.contains(&event.event_type),
        Predicate::Scalar { field, cmp, value } => scalar_matches(event, *field, *cmp, value),
        Predicate::ScalarExists(field) => scalar_exists(event, *field),
        Predicate::MatchEpc { types, patterns } => event
            .epcs
            .iter()
            .filter(|e| types.contains(&e.epc_type))
            .any(|e| patterns.iter().any(|p| epc_pattern_matches(p, &e.id))),
        Predicate::WithDescendants { field, roots } => {
            match location_value(event, *field) {
                Some(id) => roots
                    .iter()
                    .any(|root| masterdata.is_descendant_or_self(root, id)),
                None => false,
            }
        }
        Predicate::FieldCmp {
            kind,
            nested,
            namespace,
            name,
            cmp,
            value,
        } => event
            .fields
            .iter()
            .filter(|f| field_addressed(f, *kind, *nested, namespace, name))
            .any(|f| field_value_matches(f, *cmp, value)),
        Predicate::FieldExists {
            kind,
            nested,
            namespace,
            name,
        } => event
            .fields
            .iter()
            .any(|f| field_addressed(f, *kind, *nested, namespace, name)),
        Predicate::SensorReportWhere(conditions) => event
            .sensor_elements
            .iter()
            .flat_map(|element| element.reports.iter())
            .any(|report| conditions.iter().all(|c| sensor_condition_matches(report, c))),
        Predicate::HasMasterdataAttr { field, attributes } => {
            match location_value(event, *field) {
                Some(id) => attributes
                    .iter()
                    .any(|attr| masterdata.attribute(id, attr).is_some()),
                None => false,
            }
        }
        Predicate::MasterdataAttrEq {
            field,
            attribute,
            values,
        } => match location_value(event, *field) {
            Some(id) => masterdata
                .attribute(id, attribute)
                .map(|v| values.contains(&v))
                .unwrap_or(false),
            None => false,
        },
        Predicate::PageBoundary {
            key,
            time,
            id,
            direction,
        } => {
            let event_value = order_value(event, *key);
            match direction {
                OrderDirection::Asc => (event_value, event.id) > (*time, *id),
                OrderDirection::Desc => (event_value, event.id) < (*time, *id),
            }
        }
    }
}

fn scalar_matches(event: &Event, field: ScalarField, cmp: Comparator, value: &CmpValue) -> bool {
    match (field, value) {
        (ScalarField::EventTime, CmpValue::Time(t)) => cmp.holds(&event.event_time, t),
        (ScalarField::RecordTime, CmpValue::Time(t)) => match &event.record_time {
            Some(rt) => cmp.holds(rt, t),
            None => false,
        },
        (ScalarField::ErrorDeclarationTime, CmpValue::Time(t)) => {
            match &event.corrective_declaration_time {
                Some(dt) => cmp.holds(dt, t),
                None => false,
            }
        }
        (ScalarField::Action, CmpValue::Actions(actions)) => match event.action {
            Some(action) => actions.contains(&action),
            None => false,
        },
        (ScalarField::CorrectiveEventId, CmpValue::Text(values)) => event
            .corrective_event_ids
            .iter()
            .any(|id| values.contains(id)),
        (_, CmpValue::Text(values)) => match text_value(event, field) {
            Some(v) => values.iter().any(|candidate| candidate == v),
            None => false,
        },
        _ => false,
    }
}

fn scalar_exists(event: &Event, field: ScalarField) -> bool {
    match field {
        ScalarField::EventTime => true,
        ScalarField::RecordTime => event.record_time.is_some(),
        ScalarField::Action => event.action.is_some(),
        ScalarField::ErrorDeclarationTime => {
            event.corrective_declaration_time.is_some()
                || event.corrective_reason.is_some()
                || !event.corrective_event_ids.is_empty()
        }
        ScalarField::ErrorReason => event.corrective_reason.is_some(),
        ScalarField::CorrectiveEventId => !event.corrective_event_ids.is_empty(),
        ScalarField::EventId => !event.event_id.is_empty(),
        _ => text_value(event, field).is_some(),
    }
}

fn text_value(event: &Event, field: ScalarField) -> Option<&str> {
    match field {
        ScalarField::BizStep => event.business_step.as_deref(),
        ScalarField::Disposition => event.disposition.as_deref(),
        ScalarField::ReadPoint => event.read_point.as_deref(),
        ScalarField::BizLocation => event.business_location.as_deref(),
        ScalarField::TransformationId => event.transformation_id.as_deref(),
        ScalarField::CertificationInfo => event.certification_info.as_deref(),
        ScalarField::ErrorReason => event.corrective_reason.as_deref(),
        ScalarField::EventId => {
            if event.event_id.is_empty() {
                None
            } else {
                Some(&event.event_id)
            }
        }
        _ => None,
    }
}

fn location_value(event: &Event, field: LocationField) -> Option<&str> {
    match field {
        LocationField::ReadPoint => event.read_point.as_deref(),
        LocationField::BizLocation => event.business_location.as_deref(),
    }
}

fn field_addressed(
    field: &Field,
    kind: epcis_common::model::FieldKind,
    nested: bool,
    namespace: &str,
    name: &str,
) -> bool {
    field.kind.element() == kind.element()
        && !field.kind.is_attribute()
        && field.parent_index.is_some() == nested
        && field.namespace == namespace
        && field.name == name
}

/// The comparator selects the value slot: equality uses the text slot,
/// ordering uses the numeric or date slot per the literal's type.
fn field_value_matches(field: &Field, cmp: Comparator, value: &CmpValue) -> bool {
    match value {
        CmpValue::Text(values) => match &field.text_value {
            Some(text) => values.iter().any(|v| v == text),
            None => false,
        },
        CmpValue::Number(n) => match field.numeric_value {
            Some(fv) => cmp.holds(&fv, n),
            None => false,
        },
        CmpValue::Time(t) => match &field.date_value {
            Some(fv) => cmp.holds(fv, t),
            None => false,
        },
        CmpValue::Actions(_) => false,
    }
}

fn sensor_condition_matches(report: &SensorReport, condition: &SensorCondition) -> bool {
    match &condition.value {
        CmpValue::Number(n) => match sensor_numeric(report, condition.field) {
            Some(v) => condition.cmp.holds(&v, n),
            None => false,
        },
        CmpValue::Time(t) => match &report.time {
            Some(v) => condition.cmp.holds(v, t),
            None => false,
        },
        CmpValue::Text(values) => match sensor_text(report, condition.field) {
            Some(v) => values.iter().any(|candidate| candidate == &v),
            None => false,
        },
        CmpValue::Actions(_) => false,
    }
}

fn sensor_numeric(report: &SensorReport, field: SensorField) -> Option<f64> {
    match field {
        SensorField::Value => report.value,
        SensorField::MinValue => report.min_value,
        SensorField::MaxValue => report.max_value,
        SensorField::MeanValue => report.mean_value,
        SensorField::SDev => report.s_dev,
        SensorField::PercRank => report.perc_rank,
        SensorField::PercValue => report.perc_value,
        _ => None,
    }
}

fn sensor_text(report: &SensorReport, field: SensorField) -> Option<String> {
    match field {
        SensorField::Type => report.report_type.clone(),
        SensorField::DeviceId => report.device_id.clone(),
        SensorField::RawData => report.raw_data.clone(),
        SensorField::DataProcessingMethod => report.data_processing_method.clone(),
        SensorField::Microorganism => report.microorganism.clone(),
        SensorField::ChemicalSubstance => report.chemical_substance.clone(),
        SensorField::StringValue => report.string_value.clone(),
        SensorField::BooleanValue => report.boolean_value.map(|b| b.to_string()),
        SensorField::HexBinaryValue => report.hex_binary_value.clone(),
        SensorField::UriValue => report.uri_value.clone(),
        SensorField::Uom => report.uom.clone(),
        SensorField::Component => report.component.clone(),
        _ => None,
    }
}

/// The event's value under an ordering key. Events missing a record time
/// sort at the epoch rather than disappearing.
pub fn order_value(event: &Event, key: OrderKey) -> DateTime<Utc> {
    match key {
        OrderKey::EventTime => event.event_time,
        OrderKey::RecordTime => event.record_time.unwrap_or(DateTime::UNIX_EPOCH),
    }
}

/// Comparison function for the deterministic result order: order key, then
/// persisted id as the tiebreaker.
pub fn compare_events(a: &Event, b: &Event, key: OrderKey, direction: OrderDirection) -> std::cmp::Ordering {
    let ordering = order_value(a, key)
        .cmp(&order_value(b, key))
        .then(a.id.cmp(&b.id));
    match direction {
        OrderDirection::Asc => ordering,
        OrderDirection::Desc => ordering.reverse(),
    }
}
