pub mod decode;
pub mod encode;

/// The EPCIS 2.0 JSON-LD context URL, always declared first.
pub const EPCIS_CONTEXT: &str = "https://ref.gs1.org/standards/epcis/2.0.0/epcis-context.jsonld";
