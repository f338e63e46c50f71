//! Predicate AST -> Postgres SQL.
//!
//! Phase 1 projects only `events.id`, joining child tables through EXISTS
//! subqueries so predicate joins never multiply result rows. The translation
//! is held to the reference evaluator's semantics by the shared tests.

use sqlx::{Postgres, QueryBuilder};

use epcis_query::predicate::{
    CmpValue, Comparator, LocationField, OrderDirection, OrderKey, Predicate, QueryPlan,
    ScalarField, SensorCondition, SensorField,
};

pub(crate) fn build_id_query(plan: &QueryPlan, limit: usize) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new("SELECT e.id FROM events e WHERE TRUE");
    for predicate in &plan.predicates {
        qb.push(" AND ");
        push_predicate(&mut qb, predicate);
    }

    let order_col = order_column(plan.order_key);
    let direction = match plan.direction {
        OrderDirection::Asc => "ASC",
        OrderDirection::Desc => "DESC",
    };
    qb.push(format!(
        " ORDER BY {order_col} {direction}, e.id {direction} LIMIT "
    ));
    qb.push_bind(limit as i64);
    qb
}

fn order_column(key: OrderKey) -> &'static str {
    match key {
        OrderKey::EventTime => "e.event_time",
        OrderKey::RecordTime => "e.record_time",
    }
}

fn push_predicate(qb: &mut QueryBuilder<'static, Postgres>, predicate: &Predicate) {
    match predicate {
        Predicate::TenantIs(tenant) => {
            qb.push("e.tenant_id = ");
            qb.push_bind(tenant.clone());
        }
        Predicate::EventTypeIn(types) => {
            let values: Vec<String> = types.iter().map(|t| t.as_str().to_owned()).collect();
            qb.push("e.event_type = ANY(");
            qb.push_bind(values);
            qb.push(")");
        }
        Predicate::Scalar { field, cmp, value } => push_scalar(qb, *field, *cmp, value),
        Predicate::ScalarExists(field) => push_scalar_exists(qb, *field),
        Predicate::MatchEpc { types, patterns } => {
            let type_values: Vec<String> =
                types.iter().map(|t| t.as_str().to_owned()).collect();
            qb.push("EXISTS (SELECT 1 FROM event_epcs x WHERE x.event_pk = e.id AND x.epc_type = ANY(");
            qb.push_bind(type_values);
            qb.push(") AND (FALSE");
            for pattern in patterns {
                match pattern.strip_suffix('*') {
                    Some(prefix) => {
                        qb.push(" OR x.epc_id LIKE ");
                        qb.push_bind(format!("{}%", like_escape(prefix)));
                    }
                    None => {
                        qb.push(" OR x.epc_id = ");
                        qb.push_bind(pattern.clone());
                    }
                }
            }
            qb.push("))");
        }
        Predicate::WithDescendants { field, roots } => {
            // The store resolves descendants before translation; reaching
            // this arm means no masterdata expansion happened, so fall back
            // to plain equality on the roots.
            qb.push(location_column(*field));
            qb.push(" = ANY(");
            qb.push_bind(roots.clone());
            qb.push(")");
        }
        Predicate::FieldCmp {
            kind,
            nested,
            namespace,
            name,
            cmp,
            value,
        } => {
            qb.push("EXISTS (SELECT 1 FROM event_fields f WHERE f.event_pk = e.id AND f.kind = ");
            qb.push_bind(kind.element().as_str().to_owned());
            qb.push(if *nested {
                " AND f.parent_idx IS NOT NULL"
            } else {
                " AND f.parent_idx IS NULL"
            });
            qb.push(" AND f.namespace = ");
            qb.push_bind(namespace.clone());
            qb.push(" AND f.name = ");
            qb.push_bind(name.clone());
            qb.push(" AND ");
            match value {
                CmpValue::Text(values) => {
                    qb.push("f.text_value = ANY(");
                    qb.push_bind(values.clone());
                    qb.push(")");
                }
                CmpValue::Number(n) => {
                    qb.push(format!("f.numeric_value {} ", cmp_sql(*cmp)));
                    qb.push_bind(*n);
                }
                CmpValue::Time(t) => {
                    qb.push(format!("f.date_value {} ", cmp_sql(*cmp)));
                    qb.push_bind(*t);
                }
                CmpValue::Actions(_) => {
                    qb.push("FALSE");
                }
            }
            qb.push(")");
        }
        Predicate::FieldExists {
            kind,
            nested,
            namespace,
            name,
        } => {
            qb.push("EXISTS (SELECT 1 FROM event_fields f WHERE f.event_pk = e.id AND f.kind = ");
            qb.push_bind(kind.element().as_str().to_owned());
            qb.push(if *nested {
                " AND f.parent_idx IS NOT NULL"
            } else {
                " AND f.parent_idx IS NULL"
            });
            qb.push(" AND f.namespace = ");
            qb.push_bind(namespace.clone());
            qb.push(" AND f.name = ");
            qb.push_bind(name.clone());
            qb.push(")");
        }
        Predicate::SensorReportWhere(conditions) => {
            qb.push("EXISTS (SELECT 1 FROM sensor_reports r WHERE r.event_pk = e.id");
            for condition in conditions {
                qb.push(" AND ");
                push_sensor_condition(qb, condition);
            }
            qb.push(")");
        }
        Predicate::HasMasterdataAttr { field, attributes } => {
            qb.push("EXISTS (SELECT 1 FROM masterdata m WHERE m.tenant_id = e.tenant_id AND m.element_id = ");
            qb.push(location_column(*field));
            qb.push(" AND (FALSE");
            for attribute in attributes {
                qb.push(" OR jsonb_exists(m.attributes, ");
                qb.push_bind(attribute.clone());
                qb.push(")");
            }
            qb.push("))");
        }
        Predicate::MasterdataAttrEq {
            field,
            attribute,
            values,
        } => {
            qb.push("EXISTS (SELECT 1 FROM masterdata m WHERE m.tenant_id = e.tenant_id AND m.element_id = ");
            qb.push(location_column(*field));
            qb.push(" AND m.attributes->>");
            qb.push_bind(attribute.clone());
            qb.push(" = ANY(");
            qb.push_bind(values.clone());
            qb.push("))");
        }
        Predicate::PageBoundary {
            key,
            time,
            id,
            direction,
        } => {
            let operator = match direction {
                OrderDirection::Asc => ">",
                OrderDirection::Desc => "<",
            };
            qb.push(format!("({}, e.id) {operator} (", order_column(*key)));
            qb.push_bind(*time);
            qb.push(", ");
            qb.push_bind(*id);
            qb.push(")");
        }
    }
}

fn push_scalar(
    qb: &mut QueryBuilder<'static, Postgres>,
    field: ScalarField,
    cmp: Comparator,
    value: &CmpValue,
) {
    match (field, value) {
        (ScalarField::CorrectiveEventId, CmpValue::Text(values)) => {
            qb.push("(FALSE");
            for value in values {
                qb.push(" OR jsonb_exists(e.corrective_event_ids, ");
                qb.push_bind(value.clone());
                qb.push(")");
            }
            qb.push(")");
        }
        (_, CmpValue::Time(t)) => {
            qb.push(format!("{} {} ", scalar_column(field), cmp_sql(cmp)));
            qb.push_bind(*t);
        }
        (_, CmpValue::Actions(actions)) => {
            let values: Vec<String> = actions.iter().map(|a| a.as_str().to_owned()).collect();
            qb.push("e.action = ANY(");
            qb.push_bind(values);
            qb.push(")");
        }
        (_, CmpValue::Text(values)) => {
            qb.push(format!("{} = ANY(", scalar_column(field)));
            qb.push_bind(values.clone());
            qb.push(")");
        }
        (_, CmpValue::Number(_)) => {
            qb.push("FALSE");
        }
    }
}

fn push_scalar_exists(qb: &mut QueryBuilder<'static, Postgres>, field: ScalarField) {
    match field {
        ScalarField::EventTime => {
            qb.push("TRUE");
        }
        ScalarField::CorrectiveEventId => {
            qb.push("jsonb_array_length(e.corrective_event_ids) > 0");
        }
        ScalarField::ErrorDeclarationTime => {
            qb.push("(e.corrective_declaration_time IS NOT NULL OR e.corrective_reason IS NOT NULL OR jsonb_array_length(e.corrective_event_ids) > 0)");
        }
        ScalarField::EventId => {
            qb.push("e.event_id <> ''");
        }
        other => {
            qb.push(format!("{} IS NOT NULL", scalar_column(other)));
        }
    }
}

fn push_sensor_condition(qb: &mut QueryBuilder<'static, Postgres>, condition: &SensorCondition) {
    let column = sensor_column(condition.field);
    match &condition.value {
        CmpValue::Number(n) => {
            qb.push(format!("{column} {} ", cmp_sql(condition.cmp)));
            qb.push_bind(*n);
        }
        CmpValue::Time(t) => {
            qb.push(format!("r.report_time {} ", cmp_sql(condition.cmp)));
            qb.push_bind(*t);
        }
        CmpValue::Text(values) => {
            if condition.field == SensorField::BooleanValue {
                qb.push("r.boolean_value::text = ANY(");
            } else {
                qb.push(format!("{column} = ANY("));
            }
            qb.push_bind(values.clone());
            qb.push(")");
        }
        CmpValue::Actions(_) => {
            qb.push("FALSE");
        }
    }
}

fn scalar_column(field: ScalarField) -> &'static str {
    match field {
        ScalarField::EventTime => "e.event_time",
        ScalarField::RecordTime => "e.record_time",
        ScalarField::Action => "e.action",
        ScalarField::BizStep => "e.business_step",
        ScalarField::Disposition => "e.disposition",
        ScalarField::ReadPoint => "e.read_point",
        ScalarField::BizLocation => "e.business_location",
        ScalarField::TransformationId => "e.transformation_id",
        ScalarField::EventId => "e.event_id",
        ScalarField::CertificationInfo => "e.certification_info",
        ScalarField::ErrorDeclarationTime => "e.corrective_declaration_time",
        ScalarField::ErrorReason => "e.corrective_reason",
        ScalarField::CorrectiveEventId => "e.corrective_event_ids",
    }
}

fn location_column(field: LocationField) -> &'static str {
    match field {
        LocationField::ReadPoint => "e.read_point",
        LocationField::BizLocation => "e.business_location",
    }
}

fn sensor_column(field: SensorField) -> &'static str {
    match field {
        SensorField::Type => "r.report_type",
        SensorField::DeviceId => "r.device_id",
        SensorField::RawData => "r.raw_data",
        SensorField::DataProcessingMethod => "r.data_processing_method",
        SensorField::Time => "r.report_time",
        SensorField::Microorganism => "r.microorganism",
        SensorField::ChemicalSubstance => "r.chemical_substance",
        SensorField::Value => "r.value",
        SensorField::StringValue => "r.string_value",
        SensorField::BooleanValue => "r.boolean_value",
        SensorField::HexBinaryValue => "r.hex_binary_value",
        SensorField::UriValue => "r.uri_value",
        SensorField::MinValue => "r.min_value",
        SensorField::MaxValue => "r.max_value",
        SensorField::MeanValue => "r.mean_value",
        SensorField::SDev => "r.s_dev",
        SensorField::PercRank => "r.perc_rank",
        SensorField::PercValue => "r.perc_value",
        SensorField::Uom => "r.uom",
        SensorField::Component => "r.component",
    }
}

fn cmp_sql(cmp: Comparator) -> &'static str {
    match cmp {
        Comparator::Eq => "=",
        Comparator::Gt => ">",
        Comparator::Ge => ">=",
        Comparator::Lt => "<",
        Comparator::Le => "<=",
    }
}

/// Escape LIKE metacharacters in a literal prefix.
fn like_escape(prefix: &str) -> String {
    prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use epcis_common::model::EventType;

    #[test]
    fn builds_sql_for_a_representative_chain() {
        let mut plan = QueryPlan::default();
        plan.predicates.push(Predicate::TenantIs("tenant-a".into()));
        plan.predicates
            .push(Predicate::EventTypeIn(vec![EventType::Object]));
        plan.predicates.push(Predicate::MatchEpc {
            types: vec![epcis_common::model::EpcType::List],
            patterns: vec!["urn:epc:id:sgtin:8901213.*".into()],
        });
        plan.predicates
            .push(Predicate::SensorReportWhere(vec![SensorCondition {
                field: SensorField::Value,
                cmp: Comparator::Ge,
                value: CmpValue::Number(5.0),
            }]));

        let mut qb = build_id_query(&plan, 100);
        let sql = qb.sql().to_owned();

        assert!(sql.starts_with("SELECT e.id FROM events e WHERE TRUE"));
        assert!(sql.contains("e.tenant_id = $1"));
        assert!(sql.contains("e.event_type = ANY($2)"));
        assert!(sql.contains("x.epc_id LIKE $4"));
        assert!(sql.contains("sensor_reports r"));
        assert!(sql.contains("ORDER BY e.event_time ASC, e.id ASC LIMIT $6"));
    }

    #[test]
    fn like_escaping_protects_metacharacters() {
        assert_eq!(like_escape("a%b_c"), "a\\%b\\_c");
        assert_eq!(like_escape("plain"), "plain");
    }

    #[test]
    fn page_boundary_uses_row_comparison() {
        let mut plan = QueryPlan::default();
        plan.predicates.push(Predicate::PageBoundary {
            key: OrderKey::EventTime,
            time: chrono::Utc::now(),
            id: 9,
            direction: OrderDirection::Asc,
        });
        let mut qb = build_id_query(&plan, 10);
        assert!(qb.sql().contains("(e.event_time, e.id) > ($1, $2)"));
    }
}
