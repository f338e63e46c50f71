//! Wire formats for the repository: EPCIS 1.x / 2.0 XML, EPCIS 2.0 JSON-LD,
//! and the 1.2 SOAP envelope, plus the canonical event hasher.
//!
//! Decoders turn a byte stream into the canonical [`epcis_common::model`]
//! aggregate; encoders reverse them. Hierarchical extension content is
//! flattened to indexed [`Field`](epcis_common::model::Field) rows on the way
//! in and re-materialized by bucketing on the way out.

pub mod fields;
pub mod hash;
pub mod json;
pub mod soap;
pub mod xml;

use epcis_common::error::EpcisError;
use epcis_common::model::Capture;

/// Declared content type of a capture body, selects the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Xml,
    JsonLd,
}

impl DocumentFormat {
    pub fn from_content_type(content_type: &str) -> Result<Self, EpcisError> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "application/xml" | "text/xml" => Ok(DocumentFormat::Xml),
            "application/json" | "application/ld+json" => Ok(DocumentFormat::JsonLd),
            other => Err(EpcisError::UnsupportedContentType(other.to_owned())),
        }
    }
}

/// Decode a capture body of the given format, within a byte budget.
pub fn decode(
    body: &[u8],
    format: DocumentFormat,
    size_limit: usize,
) -> Result<Capture, EpcisError> {
    if body.len() > size_limit {
        return Err(EpcisError::OversizedDocument);
    }
    match format {
        DocumentFormat::Xml => xml::decode::decode_document(body),
        DocumentFormat::JsonLd => json::decode::decode_document(body),
    }
}
