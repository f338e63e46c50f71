//! Event-stream XML emission over an in-memory buffer.
//!
//! All encoders write through [`quick_xml::Writer`]; text and attribute
//! escaping is the writer's job. Writes target a `Vec<u8>` and cannot fail,
//! so the helpers keep the encoder call sites free of `Result` plumbing.

use std::io::Cursor;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event as XmlEvent};
use quick_xml::Writer;

pub(crate) struct XmlEmitter {
    writer: Writer<Cursor<Vec<u8>>>,
}

impl XmlEmitter {
    /// An emitter that starts with the XML declaration.
    pub(crate) fn document() -> Self {
        let mut emitter = XmlEmitter::fragment();
        emitter.emit(XmlEvent::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)));
        emitter
    }

    /// An emitter for embeddable markup, no declaration.
    pub(crate) fn fragment() -> Self {
        XmlEmitter {
            writer: Writer::new(Cursor::new(Vec::new())),
        }
    }

    pub(crate) fn emit(&mut self, event: XmlEvent<'_>) {
        self.writer
            .write_event(event)
            .expect("writes to an in-memory buffer cannot fail");
    }

    pub(crate) fn open(&mut self, start: BytesStart<'_>) {
        self.emit(XmlEvent::Start(start));
    }

    pub(crate) fn open_tag(&mut self, tag: &str) {
        self.open(BytesStart::new(tag));
    }

    pub(crate) fn close(&mut self, tag: &str) {
        self.emit(XmlEvent::End(BytesEnd::new(tag)));
    }

    pub(crate) fn empty(&mut self, start: BytesStart<'_>) {
        self.emit(XmlEvent::Empty(start));
    }

    pub(crate) fn text(&mut self, text: &str) {
        self.emit(XmlEvent::Text(BytesText::new(text)));
    }

    /// `<tag>text</tag>` with writer-side escaping.
    pub(crate) fn elem(&mut self, tag: &str, text: &str) {
        self.open_tag(tag);
        self.text(text);
        self.close(tag);
    }

    /// Splice pre-rendered markup verbatim (stored header fragments and
    /// envelope payloads that were emitted by this module already).
    pub(crate) fn raw(&mut self, markup: &str) {
        self.emit(XmlEvent::Text(BytesText::from_escaped(markup)));
    }

    pub(crate) fn finish(self) -> String {
        String::from_utf8(self.writer.into_inner().into_inner())
            .expect("the writer only emits utf-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_leads_with_the_declaration() {
        let mut emitter = XmlEmitter::document();
        emitter.elem("a", "x");
        assert_eq!(
            emitter.finish(),
            r#"<?xml version="1.0" encoding="UTF-8"?><a>x</a>"#
        );
    }

    #[test]
    fn text_and_attributes_are_escaped() {
        let mut emitter = XmlEmitter::fragment();
        let mut start = BytesStart::new("a");
        start.push_attribute(("href", "x & y"));
        emitter.open(start);
        emitter.text("1 < 2");
        emitter.close("a");
        assert_eq!(emitter.finish(), r#"<a href="x &amp; y">1 &lt; 2</a>"#);
    }

    #[test]
    fn raw_markup_is_spliced_verbatim() {
        let mut emitter = XmlEmitter::fragment();
        emitter.open_tag("outer");
        emitter.raw("<inner>kept</inner>");
        emitter.close("outer");
        assert_eq!(emitter.finish(), "<outer><inner>kept</inner></outer>");
    }

    #[test]
    fn empty_elements_self_close() {
        let mut emitter = XmlEmitter::fragment();
        let mut start = BytesStart::new("e");
        start.push_attribute(("k", "v"));
        emitter.empty(start);
        assert_eq!(emitter.finish(), r#"<e k="v"/>"#);
    }
}
