use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EpcisError;

/// Opaque isolation key attached to every capture. Assigned by the identity
/// layer, never derived from document content.
pub type TenantId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchemaVersion {
    V1_0,
    V1_1,
    V1_2,
    V2_0,
}

impl SchemaVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaVersion::V1_0 => "1.0",
            SchemaVersion::V1_1 => "1.1",
            SchemaVersion::V1_2 => "1.2",
            SchemaVersion::V2_0 => "2.0",
        }
    }

    pub fn is_v2(&self) -> bool {
        matches!(self, SchemaVersion::V2_0)
    }
}

impl FromStr for SchemaVersion {
    type Err = EpcisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1.0" => Ok(SchemaVersion::V1_0),
            "1.1" => Ok(SchemaVersion::V1_1),
            "1.2" => Ok(SchemaVersion::V1_2),
            "2.0" => Ok(SchemaVersion::V2_0),
            other => Err(EpcisError::UnsupportedVersion(other.to_owned())),
        }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for SchemaVersion {
    fn default() -> Self {
        SchemaVersion::V2_0
    }
}

/// One EPCIS document submission. The transactional unit of ingestion: the
/// capture and everything it owns persist atomically and are immutable
/// afterwards, except the one-time assignment of `record_time`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capture {
    /// Storage primary key, 0 until persisted.
    pub id: i64,
    /// External identity, server-assigned at construction.
    pub capture_id: Uuid,
    pub tenant_id: TenantId,
    pub schema_version: SchemaVersion,
    /// Client-supplied creation date of the document.
    pub document_time: Option<DateTime<Utc>>,
    /// Server-assigned, set atomically with persistence.
    pub record_time: Option<DateTime<Utc>>,
    /// Raw StandardBusinessHeader fragment, kept verbatim.
    pub standard_business_header: Option<String>,
    /// Correlates a capture produced by a subscription delivery.
    pub subscription_correlation: Option<String>,
    /// Custom namespace declarations seen in the document, uri -> prefix.
    pub namespaces: HashMap<String, String>,
    pub events: Vec<Event>,
    pub masterdata: Vec<MasterData>,
}

impl Capture {
    pub fn new(schema_version: SchemaVersion) -> Self {
        Capture {
            capture_id: Uuid::now_v7(),
            schema_version,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Object,
    Aggregation,
    Transaction,
    Transformation,
    /// EPCIS 1.x only; folded into quantity EPCs on the 2.0 surface.
    Quantity,
}

impl EventType {
    /// The element/type name on the wire, identical for 1.2 and 2.0.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Object => "ObjectEvent",
            EventType::Aggregation => "AggregationEvent",
            EventType::Transaction => "TransactionEvent",
            EventType::Transformation => "TransformationEvent",
            EventType::Quantity => "QuantityEvent",
        }
    }
}

impl FromStr for EventType {
    type Err = EpcisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ObjectEvent" => Ok(EventType::Object),
            "AggregationEvent" => Ok(EventType::Aggregation),
            "TransactionEvent" => Ok(EventType::Transaction),
            "TransformationEvent" => Ok(EventType::Transformation),
            "QuantityEvent" => Ok(EventType::Quantity),
            other => Err(EpcisError::MalformedDocument(format!(
                "unknown event type {other}"
            ))),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventAction {
    Add,
    Observe,
    Delete,
}

impl EventAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventAction::Add => "ADD",
            EventAction::Observe => "OBSERVE",
            EventAction::Delete => "DELETE",
        }
    }
}

impl FromStr for EventAction {
    type Err = EpcisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADD" => Ok(EventAction::Add),
            "OBSERVE" => Ok(EventAction::Observe),
            "DELETE" => Ok(EventAction::Delete),
            other => Err(EpcisError::MalformedDocument(format!(
                "unknown action {other}"
            ))),
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An EPCIS event. The four 2.0 variants (plus the 1.x QuantityEvent) share
/// this record shape; variant-specific requirements live in the validators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Storage primary key, 0 until persisted.
    pub id: i64,
    pub event_type: EventType,
    /// Stable content hash or client-supplied URI. Empty until hashed.
    pub event_id: String,
    pub event_time: DateTime<Utc>,
    /// Original local offset of `event_time`, `±HH:MM`.
    pub event_time_zone_offset: String,
    /// Mirror of the owning capture's record time, set at persistence.
    pub record_time: Option<DateTime<Utc>>,
    /// Absent for TransformationEvent.
    pub action: Option<EventAction>,
    pub business_step: Option<String>,
    pub disposition: Option<String>,
    pub read_point: Option<String>,
    pub business_location: Option<String>,
    /// TransformationEvent only.
    pub transformation_id: Option<String>,
    pub certification_info: Option<String>,
    pub corrective_declaration_time: Option<DateTime<Utc>>,
    pub corrective_reason: Option<String>,
    pub corrective_event_ids: Vec<String>,
    pub epcs: Vec<Epc>,
    pub business_transactions: Vec<BusinessTransaction>,
    pub sources: Vec<SourceDest>,
    pub destinations: Vec<SourceDest>,
    pub sensor_elements: Vec<SensorElement>,
    pub persistent_dispositions: Vec<PersistentDisposition>,
    pub fields: Vec<Field>,
}

impl Event {
    pub fn new(event_type: EventType, event_time: DateTime<Utc>, offset: &str) -> Self {
        Event {
            id: 0,
            event_type,
            event_id: String::new(),
            event_time,
            event_time_zone_offset: offset.to_owned(),
            record_time: None,
            action: None,
            business_step: None,
            disposition: None,
            read_point: None,
            business_location: None,
            transformation_id: None,
            certification_info: None,
            corrective_declaration_time: None,
            corrective_reason: None,
            corrective_event_ids: Vec::new(),
            epcs: Vec::new(),
            business_transactions: Vec::new(),
            sources: Vec::new(),
            destinations: Vec::new(),
            sensor_elements: Vec::new(),
            persistent_dispositions: Vec::new(),
            fields: Vec::new(),
        }
    }

    pub fn epcs_of_type(&self, epc_type: EpcType) -> impl Iterator<Item = &Epc> {
        self.epcs.iter().filter(move |e| e.epc_type == epc_type)
    }

    pub fn parent_id(&self) -> Option<&Epc> {
        self.epcs_of_type(EpcType::ParentId).next()
    }

    /// Next free field index within this event, across all entity partitions.
    pub fn next_field_index(&self) -> i32 {
        self.fields.iter().map(|f| f.index + 1).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EpcType {
    /// `epcList` of Object/Transaction events.
    List,
    /// `childEPCs` of an AggregationEvent.
    ChildEpc,
    /// `parentID` of an Aggregation/Transaction event.
    ParentId,
    /// `inputEPCList` of a TransformationEvent.
    InputEpc,
    /// `outputEPCList` of a TransformationEvent.
    OutputEpc,
    /// Any quantity-bearing element (class-level identifier).
    Quantity,
}

impl EpcType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpcType::List => "List",
            EpcType::ChildEpc => "ChildEpc",
            EpcType::ParentId => "ParentId",
            EpcType::InputEpc => "InputEpc",
            EpcType::OutputEpc => "OutputEpc",
            EpcType::Quantity => "Quantity",
        }
    }
}

impl FromStr for EpcType {
    type Err = EpcisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "List" => Ok(EpcType::List),
            "ChildEpc" => Ok(EpcType::ChildEpc),
            "ParentId" => Ok(EpcType::ParentId),
            "InputEpc" => Ok(EpcType::InputEpc),
            "OutputEpc" => Ok(EpcType::OutputEpc),
            "Quantity" => Ok(EpcType::Quantity),
            other => Err(EpcisError::MalformedDocument(format!(
                "unknown epc type {other}"
            ))),
        }
    }
}

/// A typed identifier reference owned by one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Epc {
    pub epc_type: EpcType,
    pub id: String,
    pub quantity: Option<f64>,
    pub unit_of_measure: Option<String>,
}

impl Epc {
    pub fn new(epc_type: EpcType, id: impl Into<String>) -> Self {
        Epc {
            epc_type,
            id: id.into(),
            quantity: None,
            unit_of_measure: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessTransaction {
    /// The bizTransaction `type` attribute, a CBV URI.
    pub kind: Option<String>,
    pub id: String,
}

/// A source or destination entry, `type` attribute plus identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDest {
    pub kind: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentDisposition {
    pub set: Vec<String>,
    pub unset: Vec<String>,
}

/// A sensorElement. Its extension payload lives in the owning event's flat
/// field list, bound back here via `Field::entity_index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorElement {
    /// Position of this element within the event, referenced by
    /// `Field::entity_index` and `SensorReport::sensor_index`.
    pub index: i32,
    pub time: Option<DateTime<Utc>>,
    pub device_id: Option<String>,
    pub device_metadata: Option<String>,
    pub raw_data: Option<String>,
    pub data_processing_method: Option<String>,
    pub biz_rules: Option<String>,
    pub reports: Vec<SensorReport>,
}

impl SensorElement {
    pub fn new(index: i32) -> Self {
        SensorElement {
            index,
            time: None,
            device_id: None,
            device_metadata: None,
            raw_data: None,
            data_processing_method: None,
            biz_rules: None,
            reports: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SensorReport {
    /// Index of the owning SensorElement within the event.
    pub sensor_index: i32,
    /// Measurement type URI, e.g. `gs1:MT-Temperature`.
    pub report_type: Option<String>,
    pub device_id: Option<String>,
    pub raw_data: Option<String>,
    pub data_processing_method: Option<String>,
    pub time: Option<DateTime<Utc>>,
    pub microorganism: Option<String>,
    pub chemical_substance: Option<String>,
    pub value: Option<f64>,
    pub string_value: Option<String>,
    pub boolean_value: Option<bool>,
    pub hex_binary_value: Option<String>,
    pub uri_value: Option<String>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub mean_value: Option<f64>,
    pub s_dev: Option<f64>,
    pub perc_rank: Option<f64>,
    pub perc_value: Option<f64>,
    pub uom: Option<String>,
    pub component: Option<String>,
    pub exception: Option<String>,
}

/// Where a flattened field came from. Attribute variants mark XML attributes
/// (or `@`-keys in JSON-LD) that share their parent element's index as
/// `parent_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    Ilmd,
    IlmdAttribute,
    Extension,
    ExtensionAttribute,
    SensorElementExtension,
    SensorElementExtensionAttribute,
    SensorReportExtension,
    SensorReportExtensionAttribute,
}

impl FieldKind {
    pub fn is_attribute(&self) -> bool {
        matches!(
            self,
            FieldKind::IlmdAttribute
                | FieldKind::ExtensionAttribute
                | FieldKind::SensorElementExtensionAttribute
                | FieldKind::SensorReportExtensionAttribute
        )
    }

    /// The attribute-marker variant for this kind.
    pub fn attribute(&self) -> FieldKind {
        match self {
            FieldKind::Ilmd | FieldKind::IlmdAttribute => FieldKind::IlmdAttribute,
            FieldKind::Extension | FieldKind::ExtensionAttribute => FieldKind::ExtensionAttribute,
            FieldKind::SensorElementExtension | FieldKind::SensorElementExtensionAttribute => {
                FieldKind::SensorElementExtensionAttribute
            }
            FieldKind::SensorReportExtension | FieldKind::SensorReportExtensionAttribute => {
                FieldKind::SensorReportExtensionAttribute
            }
        }
    }

    /// The element variant matching this kind (inverse of `attribute`).
    pub fn element(&self) -> FieldKind {
        match self {
            FieldKind::Ilmd | FieldKind::IlmdAttribute => FieldKind::Ilmd,
            FieldKind::Extension | FieldKind::ExtensionAttribute => FieldKind::Extension,
            FieldKind::SensorElementExtension | FieldKind::SensorElementExtensionAttribute => {
                FieldKind::SensorElementExtension
            }
            FieldKind::SensorReportExtension | FieldKind::SensorReportExtensionAttribute => {
                FieldKind::SensorReportExtension
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Ilmd => "Ilmd",
            FieldKind::IlmdAttribute => "IlmdAttribute",
            FieldKind::Extension => "Extension",
            FieldKind::ExtensionAttribute => "ExtensionAttribute",
            FieldKind::SensorElementExtension => "SensorElementExtension",
            FieldKind::SensorElementExtensionAttribute => "SensorElementExtensionAttribute",
            FieldKind::SensorReportExtension => "SensorReportExtension",
            FieldKind::SensorReportExtensionAttribute => "SensorReportExtensionAttribute",
        }
    }
}

impl FromStr for FieldKind {
    type Err = EpcisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Ilmd" => Ok(FieldKind::Ilmd),
            "IlmdAttribute" => Ok(FieldKind::IlmdAttribute),
            "Extension" => Ok(FieldKind::Extension),
            "ExtensionAttribute" => Ok(FieldKind::ExtensionAttribute),
            "SensorElementExtension" => Ok(FieldKind::SensorElementExtension),
            "SensorElementExtensionAttribute" => Ok(FieldKind::SensorElementExtensionAttribute),
            "SensorReportExtension" => Ok(FieldKind::SensorReportExtension),
            "SensorReportExtensionAttribute" => Ok(FieldKind::SensorReportExtensionAttribute),
            other => Err(EpcisError::MalformedDocument(format!(
                "unknown field kind {other}"
            ))),
        }
    }
}

/// One node of a hierarchical custom-namespace subtree, flattened.
///
/// `index` is the DFS position within the owning event; `parent_index`
/// references the parent node's index (None for roots); `entity_index`
/// partitions fields belonging to a specific owned entity (a sensor
/// element/report) from event-level fields. Leaf text is stored three ways so
/// any comparator can match without re-parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub kind: FieldKind,
    pub index: i32,
    pub parent_index: Option<i32>,
    pub entity_index: Option<i32>,
    pub namespace: String,
    pub name: String,
    pub text_value: Option<String>,
    pub numeric_value: Option<f64>,
    pub date_value: Option<DateTime<Utc>>,
}

impl Field {
    pub fn element(
        kind: FieldKind,
        index: i32,
        parent_index: Option<i32>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Field {
            kind,
            index,
            parent_index,
            entity_index: None,
            namespace: namespace.into(),
            name: name.into(),
            text_value: None,
            numeric_value: None,
            date_value: None,
        }
    }

    /// Fill the three value slots speculatively from source text.
    pub fn with_text(mut self, text: &str) -> Self {
        self.text_value = Some(text.to_owned());
        self.numeric_value = text.trim().parse::<f64>().ok().filter(|v| v.is_finite());
        self.date_value = DateTime::parse_from_rfc3339(text.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc));
        self
    }
}

/// A typed vocabulary entry with attributes and hierarchy references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterData {
    /// Vocabulary type URI, e.g. `urn:epcglobal:epcis:vtype:BusinessLocation`.
    pub vocabulary_type: String,
    /// The vocabulary element id (URI).
    pub id: String,
    pub attributes: Vec<MasterDataAttribute>,
    /// Ids of child vocabulary elements, for hierarchical vocabularies.
    pub children: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterDataAttribute {
    pub name: String,
    pub value: String,
}

/// A standing named query registered by a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedQuery {
    pub name: String,
    pub tenant_id: TenantId,
    /// Frozen parameter set, applied on every execution.
    pub parameters: Vec<(String, String)>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionTrigger {
    /// Fire when a matching tenant's capture commits (debounced).
    OnCapture,
    /// Fire on a cron schedule.
    OnSchedule(String),
}

/// A standing query delivering results to a destination on a trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// Storage primary key, 0 until persisted.
    pub id: i64,
    /// Unique per tenant.
    pub name: String,
    /// The named query this subscription executes.
    pub query_name: String,
    pub parameters: Vec<(String, String)>,
    /// HTTP(S) webhook URL or `topic://` stream topic.
    pub destination: String,
    pub tenant_id: TenantId,
    pub report_if_empty: bool,
    /// Watermark floor for the first execution.
    pub initial_record_time: Option<DateTime<Utc>>,
    /// Cursor: max `record_time` delivered so far. Monotonically
    /// non-decreasing.
    pub last_executed_time: Option<DateTime<Utc>>,
    pub trigger: SubscriptionTrigger,
    pub active: bool,
    pub last_error: Option<String>,
}

impl Subscription {
    /// The effective cursor for the next execution.
    pub fn cursor(&self) -> Option<DateTime<Utc>> {
        self.last_executed_time.or(self.initial_record_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn schema_version_round_trips() {
        for v in ["1.0", "1.1", "1.2", "2.0"] {
            assert_eq!(v.parse::<SchemaVersion>().unwrap().as_str(), v);
        }
        assert!("3.0".parse::<SchemaVersion>().is_err());
    }

    #[test]
    fn field_with_text_parses_numeric() {
        let f = Field::element(FieldKind::Ilmd, 0, None, "https://ns.example.com", "lot")
            .with_text("42.50");
        assert_eq!(f.text_value.as_deref(), Some("42.50"));
        assert_eq!(f.numeric_value, Some(42.5));
        assert!(f.date_value.is_none());
    }

    #[test]
    fn field_with_text_parses_date() {
        let f = Field::element(FieldKind::Ilmd, 0, None, "https://ns.example.com", "best")
            .with_text("2025-01-15T10:30:00Z");
        let expected = Utc.with_ymd_and_hms(2025, 1, 15, 10, 30, 0).unwrap();
        assert_eq!(f.date_value, Some(expected));
        assert!(f.numeric_value.is_none());
    }

    #[test]
    fn field_with_free_text_leaves_slots_empty() {
        let f = Field::element(FieldKind::Extension, 0, None, "https://ns.example.com", "note")
            .with_text("ambient storage");
        assert!(f.numeric_value.is_none());
        assert!(f.date_value.is_none());
    }

    #[test]
    fn infinite_numeric_text_is_not_numeric() {
        let f = Field::element(FieldKind::Ilmd, 0, None, "ns", "x").with_text("inf");
        assert!(f.numeric_value.is_none());
    }

    #[test]
    fn subscription_cursor_prefers_last_executed() {
        let initial = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let executed = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        let mut sub = Subscription {
            id: 0,
            name: "s".into(),
            query_name: "q".into(),
            parameters: vec![],
            destination: "https://example.com/hook".into(),
            tenant_id: "t".into(),
            report_if_empty: false,
            initial_record_time: Some(initial),
            last_executed_time: None,
            trigger: SubscriptionTrigger::OnCapture,
            active: true,
            last_error: None,
        };
        assert_eq!(sub.cursor(), Some(initial));
        sub.last_executed_time = Some(executed);
        assert_eq!(sub.cursor(), Some(executed));
    }

    #[test]
    fn field_kind_attribute_pairs() {
        assert_eq!(FieldKind::Ilmd.attribute(), FieldKind::IlmdAttribute);
        assert_eq!(FieldKind::IlmdAttribute.element(), FieldKind::Ilmd);
        assert!(FieldKind::ExtensionAttribute.is_attribute());
        assert!(!FieldKind::SensorReportExtension.is_attribute());
    }
}
