//! HTTP Basic identity: the credential hash IS the tenant id.
//!
//! Any credential pair maps deterministically to an opaque tenant; there is
//! no account database in the core. Operators grant the super-user bypass by
//! listing tenant ids in configuration.

use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};

use epcis_common::error::EpcisError;
use epcis_query::engine::QueryIdentity;

/// Resolve the caller's identity from the Authorization header.
pub fn authenticate(
    headers: &HeaderMap,
    super_tenants: &[String],
) -> Result<QueryIdentity, EpcisError> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(EpcisError::Unauthenticated)?;

    let encoded = header
        .strip_prefix("Basic ")
        .ok_or(EpcisError::Unauthenticated)?;
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| EpcisError::Unauthenticated)?;
    let credentials =
        String::from_utf8(decoded).map_err(|_| EpcisError::Unauthenticated)?;
    if credentials.is_empty() || !credentials.contains(':') {
        return Err(EpcisError::Unauthenticated);
    }

    let tenant_id = tenant_of(&credentials);
    let super_user = super_tenants.iter().any(|t| t == &tenant_id);
    Ok(QueryIdentity {
        tenant_id,
        super_user,
    })
}

/// Tenant id for a `user:password` credential string.
pub fn tenant_of(credentials: &str) -> String {
    let digest = Sha256::digest(credentials.as_bytes());
    // 128 bits of the digest is plenty for an isolation key and keeps the
    // ids readable in logs and configuration.
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value.parse().unwrap());
        headers
    }

    fn basic(credentials: &str) -> String {
        format!("Basic {}", STANDARD.encode(credentials))
    }

    #[test]
    fn same_credentials_same_tenant() {
        let a = authenticate(&headers_with(&basic("alice:secret")), &[]).unwrap();
        let b = authenticate(&headers_with(&basic("alice:secret")), &[]).unwrap();
        assert_eq!(a.tenant_id, b.tenant_id);
        assert!(!a.super_user);
    }

    #[test]
    fn different_credentials_different_tenants() {
        let a = authenticate(&headers_with(&basic("alice:secret")), &[]).unwrap();
        let b = authenticate(&headers_with(&basic("bob:secret")), &[]).unwrap();
        assert_ne!(a.tenant_id, b.tenant_id);
    }

    #[test]
    fn missing_or_malformed_headers_are_rejected() {
        assert!(matches!(
            authenticate(&HeaderMap::new(), &[]),
            Err(EpcisError::Unauthenticated)
        ));
        assert!(matches!(
            authenticate(&headers_with("Bearer token"), &[]),
            Err(EpcisError::Unauthenticated)
        ));
        assert!(matches!(
            authenticate(&headers_with("Basic !!!"), &[]),
            Err(EpcisError::Unauthenticated)
        ));
        // Credentials without a colon are not a Basic user:password pair.
        let no_colon = format!("Basic {}", STANDARD.encode("justuser"));
        assert!(matches!(
            authenticate(&headers_with(&no_colon), &[]),
            Err(EpcisError::Unauthenticated)
        ));
    }

    #[test]
    fn super_user_is_configuration_driven() {
        let tenant = tenant_of("root:root");
        let identity =
            authenticate(&headers_with(&basic("root:root")), &[tenant.clone()]).unwrap();
        assert!(identity.super_user);

        let identity = authenticate(&headers_with(&basic("root:root")), &[]).unwrap();
        assert!(!identity.super_user);
    }
}
