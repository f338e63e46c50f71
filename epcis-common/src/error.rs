use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single semantic-rule failure, carried in `ValidationFailed` and
/// `SchemaInvalid` so clients can see which rules broke.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Stable rule identifier, e.g. `AggregationAddRequiresParent`.
    pub rule: String,
    pub message: String,
}

impl Violation {
    pub fn new(rule: &str, message: impl Into<String>) -> Self {
        Violation {
            rule: rule.to_owned(),
            message: message.into(),
        }
    }
}

/// Boundary errors for the whole repository. Every variant maps to exactly
/// one wire behavior; raw storage-engine messages never cross this type.
#[derive(Error, Debug)]
pub enum EpcisError {
    #[error("document is not well-formed: {0}")]
    MalformedDocument(String),

    #[error("document failed schema validation")]
    SchemaInvalid(Vec<Violation>),

    #[error("unsupported schema version: {0}")]
    UnsupportedVersion(String),

    #[error("document exceeds the configured byte budget")]
    OversizedDocument,

    #[error("capture failed semantic validation")]
    ValidationFailed(Vec<Violation>),

    #[error("capture exceeds the configured event count limit")]
    CaptureLimitExceeded,

    #[error("unsupported query parameter: {0}")]
    UnsupportedParameter(String),

    #[error("invalid value for parameter {name}: {reason}")]
    InvalidParameterValue { name: String, reason: String },

    #[error("query would return more events than permitted")]
    QueryTooLarge,

    #[error("no query named {0}")]
    NoSuchQuery(String),

    #[error("no capture {0}")]
    NoSuchCapture(String),

    #[error("no subscription named {0}")]
    NoSuchSubscription(String),

    #[error("a query or subscription named {0} already exists")]
    DuplicateName(String),

    #[error("request is not authenticated")]
    Unauthenticated,

    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("storage operation failed")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("delivery failed: {0}")]
    Network(String),

    #[error("request was canceled")]
    Canceled,
}

impl EpcisError {
    pub fn storage<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        EpcisError::Storage(Box::new(err))
    }

    /// Violations carried by this error, if any.
    pub fn violations(&self) -> &[Violation] {
        match self {
            EpcisError::SchemaInvalid(v) | EpcisError::ValidationFailed(v) => v,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_failed_exposes_violations() {
        let err = EpcisError::ValidationFailed(vec![Violation::new(
            "AggregationAddRequiresParent",
            "AggregationEvent with ADD has no parentID",
        )]);
        assert_eq!(err.violations().len(), 1);
        assert_eq!(err.violations()[0].rule, "AggregationAddRequiresParent");
    }

    #[test]
    fn storage_error_hides_engine_detail() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "connection reset by peer");
        let err = EpcisError::storage(inner);
        assert_eq!(err.to_string(), "storage operation failed");
    }
}
