pub mod decode;
pub mod dom;
pub(crate) mod emit;
pub mod encode;

/// EPCIS 1.x core namespace.
pub const NS_EPCIS_1: &str = "urn:epcglobal:epcis:xsd:1";
/// EPCIS 2.0 core namespace.
pub const NS_EPCIS_2: &str = "urn:epcglobal:epcis:xsd:2";
/// EPCIS 1.2 query namespace (SOAP surface).
pub const NS_EPCIS_QUERY_1: &str = "urn:epcglobal:epcis-query:xsd:1";
/// EPCIS 1.2 masterdata namespace.
pub const NS_EPCIS_MASTERDATA_1: &str = "urn:epcglobal:epcis-masterdata:xsd:1";
/// GS1 standard business document header namespace.
pub const NS_SBDH: &str = "http://www.unece.org/cefact/namespaces/StandardBusinessDocumentHeader";

/// Whether a resolved namespace belongs to the EPCIS standard itself (or is
/// absent), as opposed to a user extension namespace.
pub fn is_standard_ns(ns: Option<&str>) -> bool {
    match ns {
        None => true,
        Some(ns) => ns.starts_with("urn:epcglobal:epcis") || ns == NS_SBDH,
    }
}
