//! Flattening and re-materialization of hierarchical extension content.
//!
//! Decoders walk each custom-namespaced subtree depth-first, assigning a
//! monotonically increasing index per event; encoders rebuild the tree by
//! bucketing children on `parent_index` once and recursing in index order.

use std::collections::HashMap;

use epcis_common::model::{Field, FieldKind};

/// Assigns DFS indexes for one event's flat field list. One allocator is
/// shared across all subtrees of an event so indexes stay unique.
#[derive(Debug, Default)]
pub struct FieldAllocator {
    next_index: i32,
}

impl FieldAllocator {
    pub fn new() -> Self {
        FieldAllocator::default()
    }

    /// Continue allocation after fields that already exist on the event.
    pub fn resuming_from(next_index: i32) -> Self {
        FieldAllocator { next_index }
    }

    pub fn next(&mut self) -> i32 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }
}

/// A decoded extension node before flattening: element name, namespace,
/// attributes, leaf text, and children in document order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtensionNode {
    pub namespace: String,
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: Option<String>,
    pub children: Vec<ExtensionNode>,
}

impl ExtensionNode {
    pub fn leaf(namespace: impl Into<String>, name: impl Into<String>, text: &str) -> Self {
        ExtensionNode {
            namespace: namespace.into(),
            name: name.into(),
            text: Some(text.to_owned()),
            ..Default::default()
        }
    }
}

/// Flatten one subtree depth-first into `out`. Attributes become fields with
/// the attribute-marker kind, sharing the element's index as `parent_index`.
pub fn flatten(
    node: &ExtensionNode,
    kind: FieldKind,
    parent_index: Option<i32>,
    entity_index: Option<i32>,
    alloc: &mut FieldAllocator,
    out: &mut Vec<Field>,
) {
    let index = alloc.next();
    let mut field = Field::element(kind.element(), index, parent_index, &node.namespace, &node.name);
    if let Some(text) = &node.text {
        field = field.with_text(text);
    }
    field.entity_index = entity_index;
    out.push(field);

    for (attr_name, attr_value) in &node.attributes {
        let attr_index = alloc.next();
        let mut attr =
            Field::element(kind.attribute(), attr_index, Some(index), &node.namespace, attr_name)
                .with_text(attr_value);
        attr.entity_index = entity_index;
        out.push(attr);
    }

    for child in &node.children {
        flatten(child, kind, Some(index), entity_index, alloc, out);
    }
}

/// Rebuild the extension trees of one field partition.
///
/// `fields` must all belong to one event and one `entity_index` partition and
/// share one element/attribute kind pair. Children are pre-bucketed by
/// `parent_index` in one pass; a per-child linear scan over the whole list
/// would be quadratic with thousands of fields.
pub fn rebuild(fields: &[&Field]) -> Vec<ExtensionNode> {
    let mut by_parent: HashMap<Option<i32>, Vec<&Field>> = HashMap::new();
    for field in fields {
        by_parent.entry(field.parent_index).or_default().push(field);
    }
    for bucket in by_parent.values_mut() {
        bucket.sort_by_key(|f| f.index);
    }

    let roots = by_parent.get(&None).cloned().unwrap_or_default();
    roots
        .iter()
        .filter(|f| !f.kind.is_attribute())
        .map(|root| rebuild_node(root, &by_parent))
        .collect()
}

fn rebuild_node(field: &Field, by_parent: &HashMap<Option<i32>, Vec<&Field>>) -> ExtensionNode {
    let mut node = ExtensionNode {
        namespace: field.namespace.clone(),
        name: field.name.clone(),
        attributes: Vec::new(),
        text: field.text_value.clone(),
        children: Vec::new(),
    };

    if let Some(children) = by_parent.get(&Some(field.index)) {
        for child in children {
            if child.kind.is_attribute() {
                node.attributes
                    .push((child.name.clone(), child.text_value.clone().unwrap_or_default()));
            } else {
                node.children.push(rebuild_node(child, by_parent));
            }
        }
    }

    // Container elements carry no text of their own.
    if !node.children.is_empty() {
        node.text = None;
    }
    node
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> ExtensionNode {
        ExtensionNode {
            namespace: "https://ns.example.com/epcis".into(),
            name: "shipment".into(),
            attributes: vec![("priority".into(), "high".into())],
            text: None,
            children: vec![
                ExtensionNode::leaf("https://ns.example.com/epcis", "carrier", "ACME"),
                ExtensionNode {
                    namespace: "https://ns.example.com/epcis".into(),
                    name: "pallet".into(),
                    attributes: vec![],
                    text: None,
                    children: vec![ExtensionNode::leaf(
                        "https://ns.example.com/epcis",
                        "weight",
                        "12.5",
                    )],
                },
            ],
        }
    }

    #[test]
    fn flatten_assigns_dfs_indexes() {
        let mut out = Vec::new();
        let mut alloc = FieldAllocator::new();
        flatten(&tree(), FieldKind::Extension, None, None, &mut alloc, &mut out);

        // shipment, @priority, carrier, pallet, weight
        assert_eq!(out.len(), 5);
        let indexes: Vec<i32> = out.iter().map(|f| f.index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3, 4]);

        // Every parent_index references a smaller index.
        for field in &out {
            if let Some(parent) = field.parent_index {
                assert!(parent < field.index);
            }
        }
    }

    #[test]
    fn attributes_hang_off_their_element() {
        let mut out = Vec::new();
        let mut alloc = FieldAllocator::new();
        flatten(&tree(), FieldKind::Extension, None, None, &mut alloc, &mut out);

        let attr = out.iter().find(|f| f.kind.is_attribute()).unwrap();
        assert_eq!(attr.name, "priority");
        assert_eq!(attr.parent_index, Some(0));
        assert_eq!(attr.text_value.as_deref(), Some("high"));
    }

    #[test]
    fn leaf_values_are_parsed_speculatively() {
        let mut out = Vec::new();
        let mut alloc = FieldAllocator::new();
        flatten(&tree(), FieldKind::Extension, None, None, &mut alloc, &mut out);

        let weight = out.iter().find(|f| f.name == "weight").unwrap();
        assert_eq!(weight.numeric_value, Some(12.5));
    }

    #[test]
    fn rebuild_round_trips_the_tree() {
        let original = tree();
        let mut out = Vec::new();
        let mut alloc = FieldAllocator::new();
        flatten(&original, FieldKind::Extension, None, None, &mut alloc, &mut out);

        let refs: Vec<&Field> = out.iter().collect();
        let rebuilt = rebuild(&refs);
        assert_eq!(rebuilt.len(), 1);
        assert_eq!(rebuilt[0], original);
    }

    #[test]
    fn rebuild_handles_sibling_roots() {
        let a = ExtensionNode::leaf("ns", "first", "1");
        let b = ExtensionNode::leaf("ns", "second", "2");
        let mut out = Vec::new();
        let mut alloc = FieldAllocator::new();
        flatten(&a, FieldKind::Ilmd, None, None, &mut alloc, &mut out);
        flatten(&b, FieldKind::Ilmd, None, None, &mut alloc, &mut out);

        let refs: Vec<&Field> = out.iter().collect();
        let rebuilt = rebuild(&refs);
        assert_eq!(rebuilt, vec![a, b]);
    }

    #[test]
    fn allocator_resumes_past_existing_fields() {
        let mut alloc = FieldAllocator::resuming_from(7);
        assert_eq!(alloc.next(), 7);
        assert_eq!(alloc.next(), 8);
    }
}
