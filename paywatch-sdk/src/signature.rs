//! HMAC-SHA256 body signing used by the Service API and by outgoing webhooks.
//!
//! The header carries the signing time and the signature:
//!
//! ```text
//! Paywatch-Signature: {unix_timestamp}.{base64_signature}
//! ```
//!
//! and the signature covers `"{timestamp}.{json_body}"`.

use ring::hmac;

pub const SIGNATURE_HEADER: &str = "Paywatch-Signature";

/// Maximum accepted age of a signature, in seconds.
pub const MAX_SIGNATURE_AGE: i64 = 5 * 60;

/// Marker for bodies that can be wrapped in a [`SignedObject`].
pub trait Signature: for<'de> serde::Deserialize<'de> + serde::Serialize {}

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("invalid header format")]
    InvalidFormat,
    #[error("invalid base64 encoding")]
    InvalidBase64,
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid signature")]
    SignatureMismatch,
    #[error("signature expired")]
    Expired,
}

impl From<ring::error::Unspecified> for SignatureError {
    fn from(_: ring::error::Unspecified) -> Self {
        Self::SignatureMismatch
    }
}

/// A typed body together with the exact JSON that was signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedObject<T: Signature> {
    pub body: T,
    pub timestamp: i64,
    pub json: String,
    pub signature: Box<[u8]>,
}

impl<T: Signature> SignedObject<T> {
    /// Serialize and sign `body` at the current time.
    pub fn new(body: T, key: &[u8]) -> Result<Self, serde_json::Error> {
        let timestamp = time::OffsetDateTime::now_utc().unix_timestamp();
        Self::new_at(body, key, timestamp)
    }

    pub fn new_at(body: T, key: &[u8], timestamp: i64) -> Result<Self, serde_json::Error> {
        let json = serde_json::to_string(&body)?;
        let signature = sign(key, timestamp, &json);
        Ok(Self {
            body,
            timestamp,
            json,
            signature,
        })
    }

    /// Parse a header value and a raw body. The HMAC is **not** checked here;
    /// call [`verify`](Self::verify).
    pub fn from_header_and_body(
        header_value: &str,
        body_json: String,
    ) -> Result<Self, SignatureError> {
        let (timestamp, signature) = parse_signature_header(header_value)?;
        let body: T = serde_json::from_str(&body_json)?;
        Ok(Self {
            body,
            timestamp,
            json: body_json,
            signature,
        })
    }

    /// Check the HMAC and freshness, returning the authenticated body.
    pub fn verify(self, key: &[u8]) -> Result<T, SignatureError> {
        let data = format!("{}.{}", self.timestamp, self.json);
        hmac::verify(
            &hmac::Key::new(hmac::HMAC_SHA256, key),
            data.as_bytes(),
            self.signature.as_ref(),
        )?;
        check_timestamp(self.timestamp)?;
        Ok(self.body)
    }

    pub fn to_header(&self) -> String {
        format_signature_header(self.timestamp, &self.signature)
    }
}

fn sign(key: &[u8], timestamp: i64, json: &str) -> Box<[u8]> {
    let data = format!("{timestamp}.{json}");
    hmac::sign(&hmac::Key::new(hmac::HMAC_SHA256, key), data.as_bytes())
        .as_ref()
        .to_owned()
        .into_boxed_slice()
}

/// Split `{timestamp}.{base64}` into its parts.
pub fn parse_signature_header(value: &str) -> Result<(i64, Box<[u8]>), SignatureError> {
    let (timestamp, encoded) = value.split_once('.').ok_or(SignatureError::InvalidFormat)?;
    let timestamp: i64 = timestamp
        .parse()
        .map_err(|_| SignatureError::InvalidFormat)?;
    let signature = fast32::base64::RFC4648_NOPAD
        .decode_str(encoded)
        .map_err(|_| SignatureError::InvalidBase64)?
        .into_boxed_slice();
    Ok((timestamp, signature))
}

pub fn format_signature_header(timestamp: i64, signature: &[u8]) -> String {
    format!(
        "{}.{}",
        timestamp,
        fast32::base64::RFC4648_NOPAD.encode(signature)
    )
}

pub fn check_timestamp(timestamp: i64) -> Result<(), SignatureError> {
    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    if now - timestamp > MAX_SIGNATURE_AGE {
        return Err(SignatureError::Expired);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::OrderStatusRequest;

    const KEY: &[u8] = b"merchant-secret";

    fn request() -> OrderStatusRequest {
        OrderStatusRequest {
            trade_id: "20240101170000000000123".to_string(),
        }
    }

    #[test]
    fn test_header_round_trip_verifies() {
        let signed = SignedObject::new(request(), KEY).unwrap();
        let parsed =
            SignedObject::<OrderStatusRequest>::from_header_and_body(&signed.to_header(), signed.json)
                .unwrap();
        assert_eq!(parsed.verify(KEY).unwrap(), request());
    }

    #[test]
    fn test_tampered_body_is_rejected() {
        let signed = SignedObject::new(request(), KEY).unwrap();
        let tampered = signed.json.replace("123", "124");
        let parsed =
            SignedObject::<OrderStatusRequest>::from_header_and_body(&signed.to_header(), tampered)
                .unwrap();
        assert!(matches!(
            parsed.verify(KEY),
            Err(SignatureError::SignatureMismatch)
        ));
    }

    #[test]
    fn test_stale_signature_is_rejected() {
        let old = time::OffsetDateTime::now_utc().unix_timestamp() - MAX_SIGNATURE_AGE - 10;
        let signed = SignedObject::new_at(request(), KEY, old).unwrap();
        assert!(matches!(signed.verify(KEY), Err(SignatureError::Expired)));
    }

    #[test]
    fn test_malformed_header() {
        assert!(matches!(
            parse_signature_header("no-dot-here"),
            Err(SignatureError::InvalidFormat)
        ));
        assert!(matches!(
            parse_signature_header("123.!!!"),
            Err(SignatureError::InvalidBase64)
        ));
    }
}
