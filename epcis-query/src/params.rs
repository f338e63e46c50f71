//! The closed EPCIS query parameter grammar.
//!
//! Each `(name, value)` pair compiles to one predicate; unknown names are
//! `UnsupportedParameter`, bad values for known names are
//! `InvalidParameterValue`. List-valued parameters separate entries with `|`.

use chrono::{DateTime, Utc};

use epcis_common::error::EpcisError;
use epcis_common::model::{EpcType, EventAction, EventType, FieldKind};

use crate::predicate::{
    CmpValue, Comparator, LocationField, OrderDirection, OrderKey, Predicate, QueryPlan,
    ScalarField, SensorCondition, SensorField,
};

/// Parse a raw parameter list. Returns the plan plus the opaque
/// `nextPageToken`, which the engine validates against its secret.
pub fn parse(params: &[(String, String)]) -> Result<(QueryPlan, Option<String>), EpcisError> {
    let mut plan = QueryPlan::default();
    let mut sensor_conditions = Vec::new();
    let mut page_token = None;

    for (name, value) in params {
        match name.as_str() {
            "eventType" => {
                let types = split_list(value)
                    .map(|v| {
                        v.parse::<EventType>().map_err(|_| invalid(name, "unknown event type"))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                plan.predicates.push(Predicate::EventTypeIn(types));
            }
            "orderBy" => {
                plan.order_key = match value.as_str() {
                    "eventTime" => OrderKey::EventTime,
                    "recordTime" => OrderKey::RecordTime,
                    _ => return Err(invalid(name, "orderBy must be eventTime or recordTime")),
                };
            }
            "orderDirection" => {
                plan.direction = match value.to_ascii_uppercase().as_str() {
                    "ASC" => OrderDirection::Asc,
                    "DESC" => OrderDirection::Desc,
                    _ => return Err(invalid(name, "orderDirection must be ASC or DESC")),
                };
            }
            "eventCountLimit" => plan.event_count_limit = Some(parse_count(name, value)?),
            "maxEventCount" => plan.max_event_count = Some(parse_count(name, value)?),
            "perPage" => plan.per_page = Some(parse_count(name, value)?),
            "nextPageToken" => page_token = Some(value.clone()),
            _ => {
                if let Some(predicate) =
                    parse_prefixed(name, value, &mut sensor_conditions)?
                {
                    plan.predicates.push(predicate);
                }
            }
        }
    }

    if !sensor_conditions.is_empty() {
        plan.predicates
            .push(Predicate::SensorReportWhere(sensor_conditions));
    }

    Ok((plan, page_token))
}

fn parse_prefixed(
    name: &str,
    value: &str,
    sensor_conditions: &mut Vec<SensorCondition>,
) -> Result<Option<Predicate>, EpcisError> {
    if let Some(suffix) = name.strip_prefix("MATCH_") {
        let types = match suffix {
            "epc" => vec![EpcType::List, EpcType::ChildEpc],
            "parentID" => vec![EpcType::ParentId],
            "inputEPC" => vec![EpcType::InputEpc],
            "outputEPC" => vec![EpcType::OutputEpc],
            "anyEPC" => vec![
                EpcType::List,
                EpcType::ChildEpc,
                EpcType::ParentId,
                EpcType::InputEpc,
                EpcType::OutputEpc,
            ],
            "epcClass" | "anyEPCClass" => vec![EpcType::Quantity],
            _ => return Err(EpcisError::UnsupportedParameter(name.to_owned())),
        };
        return Ok(Some(Predicate::MatchEpc {
            types,
            patterns: split_list(value).map(str::to_owned).collect(),
        }));
    }

    if let Some(suffix) = name.strip_prefix("WD_") {
        let field = location_field(suffix).ok_or_else(|| {
            EpcisError::UnsupportedParameter(name.to_owned())
        })?;
        return Ok(Some(Predicate::WithDescendants {
            field,
            roots: split_list(value).map(str::to_owned).collect(),
        }));
    }

    if let Some(suffix) = name.strip_prefix("HASATTR_") {
        let field = location_field(suffix)
            .ok_or_else(|| EpcisError::UnsupportedParameter(name.to_owned()))?;
        return Ok(Some(Predicate::HasMasterdataAttr {
            field,
            attributes: split_list(value).map(str::to_owned).collect(),
        }));
    }

    if let Some(suffix) = name.strip_prefix("EQATTR_") {
        let (vocab, attribute) = suffix
            .split_once('_')
            .ok_or_else(|| EpcisError::UnsupportedParameter(name.to_owned()))?;
        let field = location_field(vocab)
            .ok_or_else(|| EpcisError::UnsupportedParameter(name.to_owned()))?;
        return Ok(Some(Predicate::MasterdataAttrEq {
            field,
            attribute: attribute.to_owned(),
            values: split_list(value).map(str::to_owned).collect(),
        }));
    }

    if let Some(suffix) = name.strip_prefix("EXISTS_") {
        return parse_exists(name, suffix).map(Some);
    }

    let (cmp, suffix) = match name.split_once('_') {
        Some(("EQ", rest)) => (Comparator::Eq, rest),
        Some(("GT", rest)) => (Comparator::Gt, rest),
        Some(("GE", rest)) => (Comparator::Ge, rest),
        Some(("LT", rest)) => (Comparator::Lt, rest),
        Some(("LE", rest)) => (Comparator::Le, rest),
        _ => return Err(EpcisError::UnsupportedParameter(name.to_owned())),
    };

    // Extension-field targets first: ILMD_, INNER_ILMD_, INNER_.
    if let Some(rest) = suffix.strip_prefix("INNER_ILMD_") {
        return field_cmp(name, FieldKind::Ilmd, true, rest, cmp, value).map(Some);
    }
    if let Some(rest) = suffix.strip_prefix("ILMD_") {
        return field_cmp(name, FieldKind::Ilmd, false, rest, cmp, value).map(Some);
    }
    if let Some(rest) = suffix.strip_prefix("INNER_") {
        return field_cmp(name, FieldKind::Extension, true, rest, cmp, value).map(Some);
    }

    if let Some(field) = scalar_field(suffix) {
        return scalar_cmp(name, field, cmp, value).map(Some);
    }

    if let Some(field) = sensor_field(suffix) {
        sensor_conditions.push(sensor_cmp(name, field, cmp, value)?);
        return Ok(None);
    }

    // Remaining two-part names are top-level event extension fields.
    if suffix.contains('_') {
        return field_cmp(name, FieldKind::Extension, false, suffix, cmp, value).map(Some);
    }

    Err(EpcisError::UnsupportedParameter(name.to_owned()))
}

fn parse_exists(name: &str, suffix: &str) -> Result<Predicate, EpcisError> {
    if let Some(rest) = suffix.strip_prefix("INNER_ILMD_") {
        let (namespace, field_name) = split_ns_name(name, rest)?;
        return Ok(Predicate::FieldExists {
            kind: FieldKind::Ilmd,
            nested: true,
            namespace,
            name: field_name,
        });
    }
    if let Some(rest) = suffix.strip_prefix("ILMD_") {
        let (namespace, field_name) = split_ns_name(name, rest)?;
        return Ok(Predicate::FieldExists {
            kind: FieldKind::Ilmd,
            nested: false,
            namespace,
            name: field_name,
        });
    }
    if let Some(rest) = suffix.strip_prefix("INNER_") {
        let (namespace, field_name) = split_ns_name(name, rest)?;
        return Ok(Predicate::FieldExists {
            kind: FieldKind::Extension,
            nested: true,
            namespace,
            name: field_name,
        });
    }
    if let Some(field) = scalar_field(suffix) {
        return Ok(Predicate::ScalarExists(field));
    }
    if suffix == "errorDeclaration" {
        return Ok(Predicate::ScalarExists(ScalarField::ErrorDeclarationTime));
    }
    if suffix.contains('_') {
        let (namespace, field_name) = split_ns_name(name, suffix)?;
        return Ok(Predicate::FieldExists {
            kind: FieldKind::Extension,
            nested: false,
            namespace,
            name: field_name,
        });
    }
    Err(EpcisError::UnsupportedParameter(name.to_owned()))
}

fn scalar_cmp(
    name: &str,
    field: ScalarField,
    cmp: Comparator,
    value: &str,
) -> Result<Predicate, EpcisError> {
    let is_time = matches!(
        field,
        ScalarField::EventTime | ScalarField::RecordTime | ScalarField::ErrorDeclarationTime
    );

    let value = if is_time {
        CmpValue::Time(parse_time(name, value)?)
    } else {
        if cmp != Comparator::Eq {
            return Err(invalid(name, "ordering comparators apply to time fields only"));
        }
        if field == ScalarField::Action {
            let actions = split_list(value)
                .map(|v| {
                    v.parse::<EventAction>()
                        .map_err(|_| invalid(name, "unknown action"))
                })
                .collect::<Result<Vec<_>, _>>()?;
            CmpValue::Actions(actions)
        } else {
            CmpValue::Text(split_list(value).map(str::to_owned).collect())
        }
    };

    Ok(Predicate::Scalar { field, cmp, value })
}

fn field_cmp(
    name: &str,
    kind: FieldKind,
    nested: bool,
    rest: &str,
    cmp: Comparator,
    value: &str,
) -> Result<Predicate, EpcisError> {
    let (namespace, field_name) = split_ns_name(name, rest)?;
    let value = match cmp {
        Comparator::Eq => CmpValue::Text(split_list(value).map(str::to_owned).collect()),
        _ => typed_ordering_value(name, value)?,
    };
    Ok(Predicate::FieldCmp {
        kind,
        nested,
        namespace,
        name: field_name,
        cmp,
        value,
    })
}

fn sensor_cmp(
    name: &str,
    field: SensorField,
    cmp: Comparator,
    value: &str,
) -> Result<SensorCondition, EpcisError> {
    let numeric = matches!(
        field,
        SensorField::Value
            | SensorField::MinValue
            | SensorField::MaxValue
            | SensorField::MeanValue
            | SensorField::SDev
            | SensorField::PercRank
            | SensorField::PercValue
    );
    let value = if numeric {
        CmpValue::Number(
            value
                .parse()
                .map_err(|_| invalid(name, "expected a numeric value"))?,
        )
    } else if field == SensorField::Time {
        CmpValue::Time(parse_time(name, value)?)
    } else {
        if cmp != Comparator::Eq {
            return Err(invalid(name, "ordering comparators need a numeric or time field"));
        }
        CmpValue::Text(split_list(value).map(str::to_owned).collect())
    };
    Ok(SensorCondition { field, cmp, value })
}

/// Ordering comparators against extension fields take the date slot for
/// ISO-8601 literals and the numeric slot otherwise.
fn typed_ordering_value(name: &str, value: &str) -> Result<CmpValue, EpcisError> {
    if let Ok(t) = DateTime::parse_from_rfc3339(value.trim()) {
        return Ok(CmpValue::Time(t.with_timezone(&Utc)));
    }
    value
        .trim()
        .parse::<f64>()
        .map(CmpValue::Number)
        .map_err(|_| invalid(name, "expected a numeric or ISO-8601 value"))
}

/// `<namespace>_<name>`: the final underscore separates the two, so
/// namespaces may themselves contain underscores.
fn split_ns_name(param: &str, rest: &str) -> Result<(String, String), EpcisError> {
    rest.rsplit_once('_')
        .map(|(ns, name)| (ns.to_owned(), name.to_owned()))
        .ok_or_else(|| EpcisError::UnsupportedParameter(param.to_owned()))
}

fn location_field(suffix: &str) -> Option<LocationField> {
    match suffix {
        "readPoint" => Some(LocationField::ReadPoint),
        "bizLocation" => Some(LocationField::BizLocation),
        _ => None,
    }
}

fn scalar_field(suffix: &str) -> Option<ScalarField> {
    match suffix {
        "eventTime" => Some(ScalarField::EventTime),
        "recordTime" => Some(ScalarField::RecordTime),
        "action" => Some(ScalarField::Action),
        "bizStep" => Some(ScalarField::BizStep),
        "disposition" => Some(ScalarField::Disposition),
        "readPoint" => Some(ScalarField::ReadPoint),
        "bizLocation" => Some(ScalarField::BizLocation),
        "transformationID" => Some(ScalarField::TransformationId),
        "eventID" => Some(ScalarField::EventId),
        "certificationInfo" => Some(ScalarField::CertificationInfo),
        "errorDeclarationTime" => Some(ScalarField::ErrorDeclarationTime),
        "errorReason" => Some(ScalarField::ErrorReason),
        "correctiveEventID" => Some(ScalarField::CorrectiveEventId),
        _ => None,
    }
}

fn sensor_field(suffix: &str) -> Option<SensorField> {
    match suffix {
        "type" => Some(SensorField::Type),
        "deviceID" => Some(SensorField::DeviceId),
        "rawData" => Some(SensorField::RawData),
        "dataProcessingMethod" => Some(SensorField::DataProcessingMethod),
        "time" => Some(SensorField::Time),
        "microorganism" => Some(SensorField::Microorganism),
        "chemicalSubstance" => Some(SensorField::ChemicalSubstance),
        "value" => Some(SensorField::Value),
        "stringValue" => Some(SensorField::StringValue),
        "booleanValue" => Some(SensorField::BooleanValue),
        "hexBinaryValue" => Some(SensorField::HexBinaryValue),
        "uriValue" => Some(SensorField::UriValue),
        "minValue" => Some(SensorField::MinValue),
        "maxValue" => Some(SensorField::MaxValue),
        "meanValue" => Some(SensorField::MeanValue),
        "sDev" => Some(SensorField::SDev),
        "percRank" => Some(SensorField::PercRank),
        "percValue" => Some(SensorField::PercValue),
        "uom" => Some(SensorField::Uom),
        "component" => Some(SensorField::Component),
        _ => None,
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split('|').map(str::trim).filter(|v| !v.is_empty())
}

fn parse_count(name: &str, value: &str) -> Result<usize, EpcisError> {
    value
        .parse::<usize>()
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| invalid(name, "expected a positive integer"))
}

fn parse_time(name: &str, value: &str) -> Result<DateTime<Utc>, EpcisError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| invalid(name, "expected an ISO-8601 timestamp"))
}

fn invalid(name: &str, reason: &str) -> EpcisError {
    EpcisError::InvalidParameterValue {
        name: name.to_owned(),
        reason: reason.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_event_type_membership() {
        let (plan, _) = parse(&params(&[("eventType", "ObjectEvent|AggregationEvent")])).unwrap();
        assert_eq!(
            plan.predicates,
            vec![Predicate::EventTypeIn(vec![
                EventType::Object,
                EventType::Aggregation
            ])]
        );
    }

    #[test]
    fn parses_time_comparators() {
        let (plan, _) = parse(&params(&[("GE_eventTime", "2025-01-01T00:00:00Z")])).unwrap();
        let expected = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            plan.predicates,
            vec![Predicate::Scalar {
                field: ScalarField::EventTime,
                cmp: Comparator::Ge,
                value: CmpValue::Time(expected),
            }]
        );
    }

    #[test]
    fn parses_match_families() {
        let (plan, _) = parse(&params(&[(
            "MATCH_anyEPC",
            "urn:epc:id:sgtin:8901213.105919.*",
        )]))
        .unwrap();
        match &plan.predicates[0] {
            Predicate::MatchEpc { types, patterns } => {
                assert_eq!(types.len(), 5);
                assert_eq!(patterns, &vec!["urn:epc:id:sgtin:8901213.105919.*".to_owned()]);
            }
            other => panic!("unexpected predicate {other:?}"),
        }
    }

    #[test]
    fn parses_ilmd_and_inner_fields() {
        let (plan, _) = parse(&params(&[
            ("EQ_ILMD_https://ns.acme.example/epcis_lot", "ABC123"),
            ("GE_INNER_https://ns.acme.example/epcis_weight", "12.5"),
        ]))
        .unwrap();
        assert_eq!(
            plan.predicates[0],
            Predicate::FieldCmp {
                kind: FieldKind::Ilmd,
                nested: false,
                namespace: "https://ns.acme.example/epcis".to_owned(),
                name: "lot".to_owned(),
                cmp: Comparator::Eq,
                value: CmpValue::Text(vec!["ABC123".to_owned()]),
            }
        );
        assert_eq!(
            plan.predicates[1],
            Predicate::FieldCmp {
                kind: FieldKind::Extension,
                nested: true,
                namespace: "https://ns.acme.example/epcis".to_owned(),
                name: "weight".to_owned(),
                cmp: Comparator::Ge,
                value: CmpValue::Number(12.5),
            }
        );
    }

    #[test]
    fn ordering_value_prefers_dates() {
        let (plan, _) = parse(&params(&[(
            "LT_ILMD_https://ns.acme.example/epcis_bestBefore",
            "2025-06-01T00:00:00Z",
        )]))
        .unwrap();
        match &plan.predicates[0] {
            Predicate::FieldCmp { value: CmpValue::Time(_), .. } => {}
            other => panic!("expected a date-slot comparison, got {other:?}"),
        }
    }

    #[test]
    fn sensor_conditions_bind_to_one_report() {
        let (plan, _) = parse(&params(&[
            ("EQ_type", "gs1:MT-Temperature"),
            ("GE_value", "5"),
            ("LT_value", "10"),
        ]))
        .unwrap();
        assert_eq!(plan.predicates.len(), 1);
        match &plan.predicates[0] {
            Predicate::SensorReportWhere(conditions) => assert_eq!(conditions.len(), 3),
            other => panic!("unexpected predicate {other:?}"),
        }
    }

    #[test]
    fn parses_order_and_caps() {
        let (plan, token) = parse(&params(&[
            ("orderBy", "recordTime"),
            ("orderDirection", "DESC"),
            ("perPage", "500"),
            ("maxEventCount", "1000"),
            ("nextPageToken", "abc"),
        ]))
        .unwrap();
        assert_eq!(plan.order_key, OrderKey::RecordTime);
        assert_eq!(plan.direction, OrderDirection::Desc);
        assert_eq!(plan.per_page, Some(500));
        assert_eq!(plan.max_event_count, Some(1000));
        assert_eq!(token.as_deref(), Some("abc"));
    }

    #[test]
    fn unknown_parameter_is_rejected() {
        let err = parse(&params(&[("FANCY_param", "x")])).unwrap_err();
        assert!(matches!(err, EpcisError::UnsupportedParameter(name) if name == "FANCY_param"));
    }

    #[test]
    fn malformed_value_is_rejected() {
        let err = parse(&params(&[("GE_eventTime", "not-a-date")])).unwrap_err();
        assert!(matches!(
            err,
            EpcisError::InvalidParameterValue { name, .. } if name == "GE_eventTime"
        ));
    }

    #[test]
    fn ordering_on_text_scalar_is_rejected() {
        let err = parse(&params(&[("GE_bizStep", "urn:x")])).unwrap_err();
        assert!(matches!(err, EpcisError::InvalidParameterValue { .. }));
    }

    #[test]
    fn exists_parameters() {
        let (plan, _) = parse(&params(&[
            ("EXISTS_errorDeclaration", ""),
            ("EXISTS_ILMD_https://ns.acme.example/epcis_lot", ""),
        ]))
        .unwrap();
        assert_eq!(
            plan.predicates[0],
            Predicate::ScalarExists(ScalarField::ErrorDeclarationTime)
        );
        assert_eq!(
            plan.predicates[1],
            Predicate::FieldExists {
                kind: FieldKind::Ilmd,
                nested: false,
                namespace: "https://ns.acme.example/epcis".to_owned(),
                name: "lot".to_owned(),
            }
        );
    }

    #[test]
    fn parses_masterdata_attribute_predicates() {
        let (plan, _) = parse(&params(&[
            ("HASATTR_bizLocation", "urn:epcglobal:cbv:mda:site"),
            ("EQATTR_bizLocation_urn:epcglobal:cbv:mda:sst", "201"),
        ]))
        .unwrap();
        assert_eq!(
            plan.predicates[0],
            Predicate::HasMasterdataAttr {
                field: LocationField::BizLocation,
                attributes: vec!["urn:epcglobal:cbv:mda:site".to_owned()],
            }
        );
        assert_eq!(
            plan.predicates[1],
            Predicate::MasterdataAttrEq {
                field: LocationField::BizLocation,
                attribute: "urn:epcglobal:cbv:mda:sst".to_owned(),
                values: vec!["201".to_owned()],
            }
        );
    }

    #[test]
    fn action_values_are_validated() {
        let (plan, _) = parse(&params(&[("EQ_action", "ADD|DELETE")])).unwrap();
        assert_eq!(
            plan.predicates[0],
            Predicate::Scalar {
                field: ScalarField::Action,
                cmp: Comparator::Eq,
                value: CmpValue::Actions(vec![EventAction::Add, EventAction::Delete]),
            }
        );
        assert!(parse(&params(&[("EQ_action", "FROB")])).is_err());
    }
}
