//! The signed row-copy request carried by queue messages.
//!
//! Producers announce a fragment with a JSON `RowCopyRequest` wrapped in a
//! signed envelope. Verification is a seam: the HMAC verifier covers the
//! shared-secret deployment, the permissive verifier accepts bare requests
//! where the transport is already authenticated.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use granary_core::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// A producer's announcement of one uploaded fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowCopyRequest {
    /// Destination table.
    pub table_name: String,
    /// Object key (or full URL) of the gzipped TSV.
    pub key_name: String,
    /// Schema version the fragment was produced against.
    #[serde(default)]
    pub table_version: i64,
}

impl RowCopyRequest {
    /// The fragment's object-storage URL. Bare keys get the `s3://` scheme.
    #[must_use]
    pub fn object_url(&self) -> String {
        if self.key_name.contains("://") {
            self.key_name.clone()
        } else {
            format!("s3://{}", self.key_name)
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SignedEnvelope {
    payload: String,
    signature: String,
}

/// Validates and parses a queue message body into a [`RowCopyRequest`].
pub trait RequestVerifier: Send + Sync + 'static {
    /// Verifies `body` and parses the request out of it.
    fn verify_and_parse(&self, body: &str) -> Result<RowCopyRequest>;
}

/// HMAC-SHA256 verifier over a shared key.
pub struct HmacVerifier {
    key: Vec<u8>,
}

impl HmacVerifier {
    /// Creates a verifier with the given shared key.
    #[must_use]
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    fn mac(&self, payload: &str) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .unwrap_or_else(|_| HmacSha256::new_from_slice(b"-").expect("hmac accepts any key"));
        mac.update(payload.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    /// Produces a signed envelope for `request`. Used by producers and the
    /// test suites.
    pub fn sign(&self, request: &RowCopyRequest) -> Result<String> {
        let payload = serde_json::to_string(request)
            .map_err(|e| Error::Serialization(format!("encoding row-copy request: {e}")))?;
        let signature = BASE64.encode(self.mac(&payload));
        serde_json::to_string(&SignedEnvelope { payload, signature })
            .map_err(|e| Error::Serialization(format!("encoding signed envelope: {e}")))
    }
}

impl RequestVerifier for HmacVerifier {
    fn verify_and_parse(&self, body: &str) -> Result<RowCopyRequest> {
        let envelope: SignedEnvelope = serde_json::from_str(body)
            .map_err(|e| Error::InvalidInput(format!("malformed signed envelope: {e}")))?;
        let claimed = BASE64
            .decode(&envelope.signature)
            .map_err(|e| Error::InvalidInput(format!("malformed signature: {e}")))?;
        let expected = self.mac(&envelope.payload);
        if !constant_time_eq(&claimed, &expected) {
            return Err(Error::InvalidInput(
                "row-copy request signature mismatch".to_string(),
            ));
        }
        serde_json::from_str(&envelope.payload)
            .map_err(|e| Error::InvalidInput(format!("malformed row-copy request: {e}")))
    }
}

/// Accepts unsigned request bodies. For transports that are authenticated
/// upstream of granary.
#[derive(Debug, Default)]
pub struct PermissiveVerifier;

impl RequestVerifier for PermissiveVerifier {
    fn verify_and_parse(&self, body: &str) -> Result<RowCopyRequest> {
        serde_json::from_str(body)
            .map_err(|e| Error::InvalidInput(format!("malformed row-copy request: {e}")))
    }
}

fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    let max_len = left.len().max(right.len());
    let mut diff = left.len() ^ right.len();
    for i in 0..max_len {
        let left_byte = *left.get(i).unwrap_or(&0);
        let right_byte = *right.get(i).unwrap_or(&0);
        diff |= (left_byte ^ right_byte) as usize;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RowCopyRequest {
        RowCopyRequest {
            table_name: "chat_message".to_string(),
            key_name: "processed/chat_message/0001.tsv.gz".to_string(),
            table_version: 4,
        }
    }

    #[test]
    fn hmac_roundtrip() {
        let verifier = HmacVerifier::new(*b"shared-secret");
        let body = verifier.sign(&request()).expect("sign");
        let parsed = verifier.verify_and_parse(&body).expect("verify");
        assert_eq!(parsed, request());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let verifier = HmacVerifier::new(*b"shared-secret");
        let body = verifier.sign(&request()).expect("sign");
        let tampered = body.replace("chat_message", "other_table");
        assert!(verifier.verify_and_parse(&tampered).is_err());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let signer = HmacVerifier::new(*b"shared-secret");
        let verifier = HmacVerifier::new(*b"other-secret!");
        let body = signer.sign(&request()).expect("sign");
        assert!(verifier.verify_and_parse(&body).is_err());
    }

    #[test]
    fn permissive_parses_bare_requests() {
        let body = serde_json::to_string(&request()).expect("encode");
        let parsed = PermissiveVerifier.verify_and_parse(&body).expect("parse");
        assert_eq!(parsed, request());
        assert!(PermissiveVerifier.verify_and_parse("junk").is_err());
    }

    #[test]
    fn camel_case_wire_format() {
        let parsed = PermissiveVerifier
            .verify_and_parse(
                r#"{"tableName":"t","keyName":"k/0.tsv.gz","tableVersion":2}"#,
            )
            .expect("parse");
        assert_eq!(parsed.table_name, "t");
        assert_eq!(parsed.table_version, 2);
        assert_eq!(parsed.object_url(), "s3://k/0.tsv.gz");
    }

    #[test]
    fn object_url_preserves_explicit_scheme() {
        let mut req = request();
        req.key_name = "mem://frags/a.tsv.gz".to_string();
        assert_eq!(req.object_url(), "mem://frags/a.tsv.gz");
    }
}
