//! The typed filter AST the parameter grammar compiles to.
//!
//! Storage backends translate these predicates into their own terms (SQL for
//! Postgres, direct evaluation for the memory store); the AST itself is
//! engine-neutral.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use epcis_common::model::{EpcType, EventAction, EventType, FieldKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Comparator {
    pub fn holds<T: PartialOrd>(&self, left: &T, right: &T) -> bool {
        match self {
            Comparator::Eq => left == right,
            Comparator::Gt => left > right,
            Comparator::Ge => left >= right,
            Comparator::Lt => left < right,
            Comparator::Le => left <= right,
        }
    }
}

/// Scalar event columns addressable by `EQ_`/`GE_`/... parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarField {
    EventTime,
    RecordTime,
    Action,
    BizStep,
    Disposition,
    ReadPoint,
    BizLocation,
    TransformationId,
    EventId,
    CertificationInfo,
    ErrorDeclarationTime,
    ErrorReason,
    /// Matches against the corrective-event reference list.
    CorrectiveEventId,
}

/// The right-hand side of a scalar comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CmpValue {
    /// Set membership for equality comparisons.
    Text(Vec<String>),
    Time(DateTime<Utc>),
    Number(f64),
    Actions(Vec<EventAction>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocationField {
    ReadPoint,
    BizLocation,
}

/// SensorReport attributes addressable by sensor parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorField {
    Type,
    DeviceId,
    RawData,
    DataProcessingMethod,
    Time,
    Microorganism,
    ChemicalSubstance,
    Value,
    StringValue,
    BooleanValue,
    HexBinaryValue,
    UriValue,
    MinValue,
    MaxValue,
    MeanValue,
    SDev,
    PercRank,
    PercValue,
    Uom,
    Component,
}

/// One condition against a single sensor report. All conditions of a query
/// bind to the same report (EXISTS semantics), never across reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorCondition {
    pub field: SensorField,
    pub cmp: Comparator,
    pub value: CmpValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// Implicit tenant isolation, always first and never user-removable.
    TenantIs(String),
    EventTypeIn(Vec<EventType>),
    Scalar {
        field: ScalarField,
        cmp: Comparator,
        value: CmpValue,
    },
    /// The field is present (non-null).
    ScalarExists(ScalarField),
    /// Pattern match over the event's EPC rows of the given types.
    /// Patterns ending in `*` are prefix matches.
    MatchEpc {
        types: Vec<EpcType>,
        patterns: Vec<String>,
    },
    /// Location equals one of the ids, or any masterdata descendant of one.
    WithDescendants {
        field: LocationField,
        roots: Vec<String>,
    },
    /// Comparison against a flattened extension field. `nested` selects
    /// inner nodes (parent present) versus roots.
    FieldCmp {
        kind: FieldKind,
        nested: bool,
        namespace: String,
        name: String,
        cmp: Comparator,
        value: CmpValue,
    },
    FieldExists {
        kind: FieldKind,
        nested: bool,
        namespace: String,
        name: String,
    },
    /// At least one sensor report satisfies every condition.
    SensorReportWhere(Vec<SensorCondition>),
    /// The event's location resolves to a vocabulary entry carrying one of
    /// the named attributes.
    HasMasterdataAttr {
        field: LocationField,
        attributes: Vec<String>,
    },
    /// The entry's attribute equals one of the values.
    MasterdataAttrEq {
        field: LocationField,
        attribute: String,
        values: Vec<String>,
    },
    /// Pagination boundary: rows strictly after (asc) or before (desc) the
    /// cursor position in (order value, id) order.
    PageBoundary {
        key: OrderKey,
        time: DateTime<Utc>,
        id: i64,
        direction: OrderDirection,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKey {
    EventTime,
    RecordTime,
}

impl OrderKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKey::EventTime => "eventTime",
            OrderKey::RecordTime => "recordTime",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderDirection {
    Asc,
    Desc,
}

/// A fully-parsed query: the AND-composed filter chain plus ordering,
/// caps, and the pagination position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub predicates: Vec<Predicate>,
    pub order_key: OrderKey,
    pub direction: OrderDirection,
    pub event_count_limit: Option<usize>,
    pub max_event_count: Option<usize>,
    pub per_page: Option<usize>,
}

impl Default for QueryPlan {
    fn default() -> Self {
        QueryPlan {
            predicates: Vec::new(),
            order_key: OrderKey::EventTime,
            direction: OrderDirection::Asc,
            event_count_limit: None,
            max_event_count: None,
            per_page: None,
        }
    }
}

impl QueryPlan {
    /// Prepend the tenant predicate; it must sit ahead of anything
    /// user-supplied and cannot be displaced by parameters.
    pub fn enforce_tenant(&mut self, tenant_id: &str) {
        self.predicates
            .insert(0, Predicate::TenantIs(tenant_id.to_owned()));
    }
}

/// Epc pattern semantics: a trailing `*` makes the pattern a prefix match;
/// anything else is exact.
pub fn epc_pattern_matches(pattern: &str, id: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => id.starts_with(prefix),
        None => pattern == id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparators_hold() {
        assert!(Comparator::Eq.holds(&5, &5));
        assert!(Comparator::Ge.holds(&5, &5));
        assert!(Comparator::Gt.holds(&6, &5));
        assert!(!Comparator::Lt.holds(&6, &5));
        assert!(Comparator::Le.holds(&5, &6));
    }

    #[test]
    fn epc_patterns() {
        assert!(epc_pattern_matches(
            "urn:epc:id:sgtin:8901213.105919.*",
            "urn:epc:id:sgtin:8901213.105919.000000"
        ));
        assert!(epc_pattern_matches(
            "urn:epc:id:sgtin:8901213.105919.000000",
            "urn:epc:id:sgtin:8901213.105919.000000"
        ));
        assert!(!epc_pattern_matches(
            "urn:epc:id:sgtin:8901213.105919.*",
            "urn:epc:id:sgtin:9999999.105919.000000"
        ));
        assert!(!epc_pattern_matches(
            "urn:epc:id:sgtin:8901213.105919.000000",
            "urn:epc:id:sgtin:8901213.105919.000001"
        ));
    }

    #[test]
    fn tenant_predicate_is_prepended() {
        let mut plan = QueryPlan::default();
        plan.predicates.push(Predicate::EventTypeIn(vec![EventType::Object]));
        plan.enforce_tenant("tenant-a");
        assert_eq!(plan.predicates[0], Predicate::TenantIs("tenant-a".to_owned()));
        assert_eq!(plan.predicates.len(), 2);
    }
}
