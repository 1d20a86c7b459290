//! Ed25519 key helpers for token signing.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;

pub use ed25519_dalek::{Signature, SigningKey, VerifyingKey};

pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Parse a base64url-encoded 32-byte seed into a signing key.
pub fn signing_key_from_base64(raw: &str) -> Result<SigningKey> {
    let decoded = URL_SAFE_NO_PAD
        .decode(raw.trim())
        .with_context(|| "failed to decode signing key from base64 (URL-safe)")?;
    let bytes: [u8; 32] = decoded
        .try_into()
        .map_err(|_| anyhow!("signing key must be 32 bytes"))?;
    Ok(SigningKey::from_bytes(&bytes))
}

pub fn signing_key_to_base64(key: &SigningKey) -> String {
    URL_SAFE_NO_PAD.encode(key.to_bytes())
}

pub fn verifying_key_base64(key: &SigningKey) -> String {
    URL_SAFE_NO_PAD.encode(key.verifying_key().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_round_trips_through_base64() {
        let key = generate_signing_key();
        let encoded = signing_key_to_base64(&key);
        let restored = signing_key_from_base64(&encoded).expect("valid seed");
        assert_eq!(key.to_bytes(), restored.to_bytes());
    }

    #[test]
    fn rejects_short_seeds() {
        let err = signing_key_from_base64("dG9vLXNob3J0").unwrap_err();
        assert!(err.to_string().contains("32 bytes"));
    }

    #[test]
    fn rejects_invalid_base64() {
        assert!(signing_key_from_base64("not*base64*at*all").is_err());
    }
}
