//! Shared-key request signing for the ingestion API
//!
//! HMAC-SHA256 over a canonical description of the request, keyed with the
//! base64-decoded workspace secret.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::SinkError;

type HmacSha256 = Hmac<Sha256>;

pub const CONTENT_TYPE: &str = "application/json";
pub const RESOURCE: &str = "/api/logs";

/// Canonical string covered by the signature
pub fn string_to_sign(content_length: usize, date: &str) -> String {
    format!(
        "POST\n{}\n{}\nx-ms-date:{}\n{}",
        content_length, CONTENT_TYPE, date, RESOURCE
    )
}

/// Sign `message` with a base64-encoded shared secret
pub fn build_signature(message: &str, secret: &str) -> Result<String, SinkError> {
    let key = BASE64_STANDARD
        .decode(secret.trim())
        .map_err(|e| SinkError::Signature {
            message: format!("workspace key is not valid base64: {}", e),
        })?;
    let mut mac = HmacSha256::new_from_slice(&key).map_err(|e| SinkError::Signature {
        message: e.to_string(),
    })?;
    mac.update(message.as_bytes());
    Ok(BASE64_STANDARD.encode(mac.finalize().into_bytes()))
}

/// `Authorization` header value for a signed request
pub fn authorization(
    workspace_id: &str,
    secret: &str,
    content_length: usize,
    date: &str,
) -> Result<String, SinkError> {
    let signature = build_signature(&string_to_sign(content_length, date), secret)?;
    Ok(format!("SharedKey {}:{}", workspace_id, signature))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DATE: &str = "Tue, 05 Mar 2024 09:07:03 GMT";

    #[test]
    fn test_string_to_sign() {
        assert_eq!(
            string_to_sign(22, DATE),
            "POST\n22\napplication/json\nx-ms-date:Tue, 05 Mar 2024 09:07:03 GMT\n/api/logs"
        );
    }

    #[test]
    fn test_known_signature() {
        let header = authorization("ws-123", "c2VjcmV0LWtleQ==", 22, DATE).unwrap();
        assert_eq!(
            header,
            "SharedKey ws-123:RubiHxa7v+QgCkoPxWGyL1kXy2zVLhip0V21DoO7z7w="
        );
    }

    #[test]
    fn test_invalid_secret() {
        let err = build_signature("anything", "%%% not base64").unwrap_err();
        assert!(matches!(err, SinkError::Signature { .. }));
    }
}
