use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Hex encoded HMAC-SHA256 of a raw payload.
pub fn sign_payload(secret: &str, payload: &[u8]) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a provider signature header against the raw payload.
///
/// Accepts either bare hex or the `sha256=<hex>` form.
pub fn verify_payload_signature(
    secret: &str,
    payload: &[u8],
    signature: &str,
) -> Result<bool, anyhow::Error> {
    let provided = signature
        .trim()
        .strip_prefix("sha256=")
        .unwrap_or(signature.trim())
        .to_ascii_lowercase();
    let expected = sign_payload(secret, payload)?;

    Ok(constant_time_eq(expected.as_bytes(), provided.as_bytes()))
}

/// Constant time comparison of two byte strings.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    if expected.len() != provided.len() {
        return false;
    }
    expected.ct_eq(provided).into()
}
