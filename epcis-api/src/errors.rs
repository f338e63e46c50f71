//! Boundary error -> wire response mapping.
//!
//! Structured detail (rule identifiers, offending parameter) travels in the
//! JSON body; storage-engine detail never does.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use epcis_common::error::EpcisError;

pub struct ApiError(pub EpcisError);

impl From<EpcisError> for ApiError {
    fn from(err: EpcisError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = status_of(&err);

        if matches!(err, EpcisError::Canceled) {
            // The caller is gone; no body.
            return status.into_response();
        }

        if matches!(err, EpcisError::Unauthenticated) {
            return (
                status,
                [(axum::http::header::WWW_AUTHENTICATE, "Basic realm=\"epcis\"")],
                err.to_string(),
            )
                .into_response();
        }

        let violations: Vec<_> = err
            .violations()
            .iter()
            .map(|v| json!({ "rule": v.rule, "message": v.message }))
            .collect();
        let body = json!({
            "type": kind_of(&err),
            "title": err.to_string(),
            "violations": violations,
        });
        (status, Json(body)).into_response()
    }
}

fn status_of(err: &EpcisError) -> StatusCode {
    match err {
        EpcisError::MalformedDocument(_)
        | EpcisError::SchemaInvalid(_)
        | EpcisError::UnsupportedVersion(_)
        | EpcisError::ValidationFailed(_)
        | EpcisError::UnsupportedParameter(_)
        | EpcisError::InvalidParameterValue { .. } => StatusCode::BAD_REQUEST,

        EpcisError::CaptureLimitExceeded
        | EpcisError::OversizedDocument
        | EpcisError::QueryTooLarge => StatusCode::PAYLOAD_TOO_LARGE,

        EpcisError::UnsupportedContentType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        EpcisError::Unauthenticated => StatusCode::UNAUTHORIZED,
        EpcisError::NoSuchQuery(_)
        | EpcisError::NoSuchCapture(_)
        | EpcisError::NoSuchSubscription(_) => StatusCode::NOT_FOUND,
        EpcisError::DuplicateName(_) => StatusCode::CONFLICT,
        EpcisError::Storage(_) | EpcisError::Network(_) => StatusCode::INTERNAL_SERVER_ERROR,
        EpcisError::Canceled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
    }
}

fn kind_of(err: &EpcisError) -> &'static str {
    match err {
        EpcisError::MalformedDocument(_) => "MalformedDocument",
        EpcisError::SchemaInvalid(_) => "SchemaInvalid",
        EpcisError::UnsupportedVersion(_) => "UnsupportedVersion",
        EpcisError::OversizedDocument => "OversizedDocument",
        EpcisError::ValidationFailed(_) => "ValidationFailed",
        EpcisError::CaptureLimitExceeded => "CaptureLimitExceeded",
        EpcisError::UnsupportedParameter(_) => "UnsupportedParameter",
        EpcisError::InvalidParameterValue { .. } => "InvalidParameterValue",
        EpcisError::QueryTooLarge => "QueryTooLargeException",
        EpcisError::NoSuchQuery(_) => "NoSuchNameException",
        EpcisError::NoSuchCapture(_) => "NoSuchCapture",
        EpcisError::NoSuchSubscription(_) => "NoSuchSubscriptionException",
        EpcisError::DuplicateName(_) => "DuplicateNameException",
        EpcisError::Unauthenticated => "SecurityException",
        EpcisError::UnsupportedContentType(_) => "UnsupportedContentType",
        EpcisError::Storage(_) => "ImplementationException",
        EpcisError::Network(_) => "ImplementationException",
        EpcisError::Canceled => "Canceled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use epcis_common::error::Violation;

    #[test]
    fn statuses_follow_the_error_kind() {
        assert_eq!(
            status_of(&EpcisError::ValidationFailed(vec![])),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(&EpcisError::CaptureLimitExceeded),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            status_of(&EpcisError::UnsupportedContentType("image/png".into())),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            status_of(&EpcisError::Unauthenticated),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_of(&EpcisError::NoSuchQuery("q".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(&EpcisError::DuplicateName("q".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(status_of(&EpcisError::Canceled).as_u16(), 499);
    }

    #[test]
    fn storage_detail_stays_internal() {
        let err = EpcisError::storage(std::io::Error::new(
            std::io::ErrorKind::Other,
            "password=hunter2 connection failed",
        ));
        assert_eq!(err.to_string(), "storage operation failed");
        assert_eq!(kind_of(&err), "ImplementationException");
    }

    #[test]
    fn validation_violations_reach_the_body() {
        let err = EpcisError::ValidationFailed(vec![Violation::new(
            "AggregationAddRequiresParent",
            "no parentID",
        )]);
        assert_eq!(err.violations().len(), 1);
        assert_eq!(kind_of(&err), "ValidationFailed");
    }
}
