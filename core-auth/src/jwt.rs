//! Unverified JWT claim inspection.
//!
//! Signatures are the backend's business. These helpers only read the
//! payload segment to learn who a token names and when it expires.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::error::{AuthError, Result};

/// The registered claims this crate cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub exp: Option<i64>,
    #[serde(default)]
    pub email: Option<String>,
}

pub fn decode_claims(token: &str) -> Result<Claims> {
    let mut segments = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(AuthError::MalformedToken(
            "expected three dot-separated segments".to_string(),
        ));
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| AuthError::MalformedToken(format!("payload is not base64url: {}", e)))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::MalformedToken(format!("payload is not a claims object: {}", e)))
}

/// Expiry from the `exp` claim. A missing claim is malformed.
pub fn expires_at(token: &str) -> Result<DateTime<Utc>> {
    let exp = decode_claims(token)?
        .exp
        .ok_or_else(|| AuthError::MalformedToken("missing exp claim".to_string()))?;

    Utc.timestamp_opt(exp, 0)
        .single()
        .ok_or_else(|| AuthError::MalformedToken(format!("exp {} out of range", exp)))
}

#[cfg(test)]
pub(crate) fn encode_unsigned(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.signature", header, payload)
}
