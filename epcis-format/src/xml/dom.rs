//! A minimal namespace-resolving XML tree.
//!
//! The decoders work over a fully-read document (the capture byte budget is
//! enforced before parsing), so a small owned tree keeps the event walkers
//! simple while quick-xml does the tokenizing.

use std::collections::HashMap;

use quick_xml::events::{BytesStart, Event as XmlEvent};
use quick_xml::Reader;

use epcis_common::error::EpcisError;

use crate::xml::emit::XmlEmitter;

#[derive(Debug, Clone, PartialEq)]
pub struct XmlAttr {
    /// Resolved namespace URI, only for prefixed attributes.
    pub namespace: Option<String>,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct XmlNode {
    /// Resolved namespace URI of the element.
    pub namespace: Option<String>,
    pub name: String,
    pub attributes: Vec<XmlAttr>,
    pub children: Vec<XmlNode>,
    pub text: String,
}

impl XmlNode {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }
}

/// A parsed document: the root element plus every `xmlns:prefix` declaration
/// seen, as uri -> prefix.
#[derive(Debug)]
pub struct XmlDocument {
    pub root: XmlNode,
    pub namespaces: HashMap<String, String>,
}

struct Scope {
    /// prefix -> uri bindings introduced by one element.
    bindings: HashMap<String, String>,
    /// Default namespace in effect, if redeclared here.
    default_ns: Option<Option<String>>,
}

/// Parse a full document into an [`XmlDocument`].
pub fn parse(bytes: &[u8]) -> Result<XmlDocument, EpcisError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| EpcisError::MalformedDocument(format!("invalid utf-8: {e}")))?;
    let mut reader = Reader::from_str(text);
    reader.trim_text(true);

    let mut namespaces: HashMap<String, String> = HashMap::new();
    // (node under construction, scopes introduced by it)
    let mut stack: Vec<XmlNode> = Vec::new();
    let mut scopes: Vec<Scope> = Vec::new();
    let mut root: Option<XmlNode> = None;

    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(start)) => {
                let node = open_element(&start, &mut scopes, &mut namespaces)?;
                stack.push(node);
            }
            Ok(XmlEvent::Empty(start)) => {
                let node = open_element(&start, &mut scopes, &mut namespaces)?;
                scopes.pop();
                attach(node, &mut stack, &mut root)?;
            }
            Ok(XmlEvent::End(_)) => {
                let node = stack.pop().ok_or_else(|| {
                    EpcisError::MalformedDocument("unbalanced end tag".to_owned())
                })?;
                scopes.pop();
                attach(node, &mut stack, &mut root)?;
            }
            Ok(XmlEvent::Text(text)) => {
                if let Some(node) = stack.last_mut() {
                    let decoded = text
                        .unescape()
                        .map_err(|e| EpcisError::MalformedDocument(e.to_string()))?;
                    node.text.push_str(&decoded);
                }
            }
            Ok(XmlEvent::CData(data)) => {
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Ok(XmlEvent::Decl(_) | XmlEvent::Comment(_) | XmlEvent::PI(_) | XmlEvent::DocType(_)) => {}
            Ok(XmlEvent::Eof) => break,
            Err(e) => return Err(EpcisError::MalformedDocument(e.to_string())),
        }
    }

    if !stack.is_empty() {
        return Err(EpcisError::MalformedDocument(
            "unexpected end of document".to_owned(),
        ));
    }
    let root = root.ok_or_else(|| EpcisError::MalformedDocument("empty document".to_owned()))?;
    Ok(XmlDocument { root, namespaces })
}

fn attach(
    mut node: XmlNode,
    stack: &mut Vec<XmlNode>,
    root: &mut Option<XmlNode>,
) -> Result<(), EpcisError> {
    node.text = node.text.trim().to_owned();
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(node);
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(node);
            Ok(())
        }
        None => Err(EpcisError::MalformedDocument(
            "multiple root elements".to_owned(),
        )),
    }
}

fn open_element(
    start: &BytesStart<'_>,
    scopes: &mut Vec<Scope>,
    namespaces: &mut HashMap<String, String>,
) -> Result<XmlNode, EpcisError> {
    let mut scope = Scope {
        bindings: HashMap::new(),
        default_ns: None,
    };
    let mut plain_attrs: Vec<(Option<String>, String, String)> = Vec::new();

    for attr in start.attributes() {
        let attr = attr.map_err(|e| EpcisError::MalformedDocument(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| EpcisError::MalformedDocument(e.to_string()))?
            .to_string();

        if key == "xmlns" {
            scope.default_ns = Some(if value.is_empty() { None } else { Some(value) });
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            namespaces
                .entry(value.clone())
                .or_insert_with(|| prefix.to_owned());
            scope.bindings.insert(prefix.to_owned(), value);
        } else if let Some((prefix, local)) = key.split_once(':') {
            plain_attrs.push((Some(prefix.to_owned()), local.to_owned(), value));
        } else {
            plain_attrs.push((None, key, value));
        }
    }

    scopes.push(scope);

    let qname = String::from_utf8_lossy(start.name().as_ref()).to_string();
    let (prefix, local) = match qname.split_once(':') {
        Some((p, l)) => (Some(p.to_owned()), l.to_owned()),
        None => (None, qname),
    };

    let namespace = match &prefix {
        Some(p) => Some(resolve_prefix(scopes, p).ok_or_else(|| {
            EpcisError::MalformedDocument(format!("undeclared namespace prefix {p}"))
        })?),
        None => resolve_default(scopes),
    };

    let attributes = plain_attrs
        .into_iter()
        .map(|(prefix, name, value)| {
            let namespace = match prefix {
                Some(p) => resolve_prefix(scopes, &p),
                None => None,
            };
            XmlAttr {
                namespace,
                name,
                value,
            }
        })
        .collect();

    Ok(XmlNode {
        namespace,
        name: local,
        attributes,
        children: Vec::new(),
        text: String::new(),
    })
}

fn resolve_prefix(scopes: &[Scope], prefix: &str) -> Option<String> {
    scopes
        .iter()
        .rev()
        .find_map(|s| s.bindings.get(prefix).cloned())
}

fn resolve_default(scopes: &[Scope]) -> Option<String> {
    scopes
        .iter()
        .rev()
        .find_map(|s| s.default_ns.clone())
        .flatten()
}

/// Render a node back to markup, prefixing foreign-namespace elements from
/// the given uri -> prefix table. Used for stored header fragments.
pub fn render(node: &XmlNode, prefixes: &HashMap<String, String>) -> String {
    let mut out = XmlEmitter::fragment();
    render_node(node, prefixes, &mut out);
    out.finish()
}

fn render_node(node: &XmlNode, prefixes: &HashMap<String, String>, out: &mut XmlEmitter) {
    let name = qualified(node, prefixes);
    let mut start = BytesStart::new(name.as_str());
    for attr in &node.attributes {
        start.push_attribute((attr.name.as_str(), attr.value.as_str()));
    }
    if node.children.is_empty() && node.text.is_empty() {
        out.empty(start);
        return;
    }
    out.open(start);
    if !node.text.is_empty() {
        out.text(&node.text);
    }
    for child in &node.children {
        render_node(child, prefixes, out);
    }
    out.close(&name);
}

fn qualified(node: &XmlNode, prefixes: &HashMap<String, String>) -> String {
    match node
        .namespace
        .as_ref()
        .and_then(|ns| prefixes.get(ns))
    {
        Some(prefix) => format!("{prefix}:{}", node.name),
        None => node.name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_elements_with_namespaces() {
        let doc = parse(
            br#"<root xmlns="urn:example:core" xmlns:ext="https://ns.example.com">
                 <item kind="a">hello</item>
                 <ext:custom ext:weight="2">5.5</ext:custom>
               </root>"#,
        )
        .unwrap();

        assert_eq!(doc.root.name, "root");
        assert_eq!(doc.root.namespace.as_deref(), Some("urn:example:core"));
        assert_eq!(doc.root.children.len(), 2);

        let item = &doc.root.children[0];
        assert_eq!(item.attr("kind"), Some("a"));
        assert_eq!(item.text, "hello");
        assert_eq!(item.namespace.as_deref(), Some("urn:example:core"));

        let custom = &doc.root.children[1];
        assert_eq!(custom.namespace.as_deref(), Some("https://ns.example.com"));
        assert_eq!(custom.attributes[0].name, "weight");
        assert_eq!(
            custom.attributes[0].namespace.as_deref(),
            Some("https://ns.example.com")
        );

        assert_eq!(
            doc.namespaces.get("https://ns.example.com").map(String::as_str),
            Some("ext")
        );
    }

    #[test]
    fn rejects_malformed_markup() {
        assert!(matches!(
            parse(b"<root><unclosed></root>"),
            Err(EpcisError::MalformedDocument(_))
        ));
    }

    #[test]
    fn rejects_undeclared_prefix() {
        assert!(matches!(
            parse(b"<ext:root>x</ext:root>"),
            Err(EpcisError::MalformedDocument(_))
        ));
    }

    #[test]
    fn empty_elements_are_supported() {
        let doc = parse(br#"<root><empty attr="1"/></root>"#).unwrap();
        assert_eq!(doc.root.children[0].attr("attr"), Some("1"));
    }

    #[test]
    fn render_round_trips_simple_markup() {
        let doc = parse(br#"<a href="x &amp; y"><b>text</b></a>"#).unwrap();
        let out = render(&doc.root, &HashMap::new());
        assert_eq!(out, r#"<a href="x &amp; y"><b>text</b></a>"#);
    }
}
