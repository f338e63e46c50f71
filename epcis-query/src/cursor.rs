//! Opaque pagination tokens.
//!
//! A token encodes the (order key, order value, id) position of the last
//! emitted row plus an HMAC over that position, base64url without padding.
//! Clients replay it verbatim; a forged or truncated token is an
//! `InvalidParameterValue` on `nextPageToken`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use epcis_common::error::EpcisError;

use crate::predicate::OrderKey;

type HmacSha256 = Hmac<Sha256>;

/// The position a page ended at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageCursor {
    pub order_key: OrderKey,
    pub order_value: DateTime<Utc>,
    pub id: i64,
}

#[derive(Serialize, Deserialize)]
struct TokenPayload {
    #[serde(rename = "orderKey")]
    order_key: OrderKey,
    #[serde(rename = "orderValue")]
    order_value: String,
    id: i64,
    hmac: String,
}

/// Encode a cursor into an opaque token.
pub fn encode_token(cursor: &PageCursor, secret: &[u8]) -> String {
    let order_value = cursor
        .order_value
        .to_rfc3339_opts(SecondsFormat::Micros, true);
    let payload = TokenPayload {
        order_key: cursor.order_key,
        hmac: sign(secret, cursor.order_key, &order_value, cursor.id),
        order_value,
        id: cursor.id,
    };
    let json = serde_json::to_vec(&payload).expect("cursor payload serializes");
    URL_SAFE_NO_PAD.encode(json)
}

/// Decode and verify a token produced by [`encode_token`].
pub fn decode_token(token: &str, secret: &[u8]) -> Result<PageCursor, EpcisError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| bad_token("not base64url"))?;
    let payload: TokenPayload =
        serde_json::from_slice(&bytes).map_err(|_| bad_token("unreadable payload"))?;

    let expected = sign(secret, payload.order_key, &payload.order_value, payload.id);
    if expected != payload.hmac {
        return Err(bad_token("signature mismatch"));
    }

    let order_value = DateTime::parse_from_rfc3339(&payload.order_value)
        .map_err(|_| bad_token("unreadable order value"))?
        .with_timezone(&Utc);
    Ok(PageCursor {
        order_key: payload.order_key,
        order_value,
        id: payload.id,
    })
}

fn sign(secret: &[u8], order_key: OrderKey, order_value: &str, id: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(order_key.as_str().as_bytes());
    mac.update(b"|");
    mac.update(order_value.as_bytes());
    mac.update(b"|");
    mac.update(id.to_string().as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

fn bad_token(reason: &str) -> EpcisError {
    EpcisError::InvalidParameterValue {
        name: "nextPageToken".to_owned(),
        reason: reason.to_owned(),
    }
}
