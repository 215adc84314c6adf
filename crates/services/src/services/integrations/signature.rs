//! HMAC helpers shared by the webhook verifiers.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use reqwest::header::HeaderMap;
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::ProviderError;

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

fn hmac_sha256(secret: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>, ProviderError> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| ProviderError::InvalidSignature)?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

pub fn hmac_sha256_hex(secret: &[u8], parts: &[&[u8]]) -> Result<String, ProviderError> {
    hmac_sha256(secret, parts).map(hex::encode)
}

pub fn hmac_sha256_base64(secret: &[u8], parts: &[&[u8]]) -> Result<String, ProviderError> {
    hmac_sha256(secret, parts).map(|digest| STANDARD.encode(digest))
}

pub fn hmac_sha1_hex(secret: &[u8], body: &[u8]) -> Result<String, ProviderError> {
    let mut mac = HmacSha1::new_from_slice(secret).map_err(|_| ProviderError::InvalidSignature)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Compare a received signature with the expected one in constant time.
pub fn verify_equal(received: &str, expected: &str) -> Result<(), ProviderError> {
    if bool::from(received.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(ProviderError::InvalidSignature)
    }
}

pub fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, ProviderError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ProviderError::MissingHeader(name))
}
