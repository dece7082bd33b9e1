use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::IngestError;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `sha256=<hex>` of the raw body.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Verify an HMAC-SHA256 signature over the raw body, in constant time.
///
/// Accepts raw hex or `sha256=<hex>`.
pub fn verify(secret: &str, signature: &str, body: &[u8]) -> Result<(), IngestError> {
    let sig = signature.trim();
    let sig_hex = sig.strip_prefix("sha256=").unwrap_or(sig);
    let provided = hex::decode(sig_hex).map_err(|_| IngestError::Signature)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| IngestError::Signature)?;
    mac.update(body);
    mac.verify_slice(&provided).map_err(|_| IngestError::Signature)
}

/// `sha256=<hex>` header value for `body`.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, IngestError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| IngestError::Signature)?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}
