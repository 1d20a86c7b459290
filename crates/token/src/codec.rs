use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use dealboard_core::{
    AccessClaims, DeviceEnvironment, Identity, RefreshClaims, RegistrationClaims, RoleSet,
};

use crate::keys::generate_signing_key;

/// Decode failures, ordered by how early in the pipeline they surface.
/// `Expired` is only produced by [`Decoded::into_fresh`]; a stale token
/// with a valid signature still decodes so callers can tell "stale" from
/// "forged".
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("token signature is invalid")]
    SignatureInvalid,
    #[error("token has expired")]
    Expired,
}

/// Signing keys, one per token kind. Cross-kind presentation fails
/// signature verification because the keys never match.
pub struct TokenKeys {
    pub register: SigningKey,
    pub access: SigningKey,
    pub refresh: SigningKey,
}

impl TokenKeys {
    /// Fresh random keys; every token dies with the process. Used when no
    /// seeds are configured.
    pub fn ephemeral() -> Self {
        Self {
            register: generate_signing_key(),
            access: generate_signing_key(),
            refresh: generate_signing_key(),
        }
    }
}

/// Validity windows, one per token kind.
#[derive(Debug, Clone, Copy)]
pub struct TokenTtls {
    pub register: Duration,
    pub access: Duration,
    pub refresh: Duration,
}

impl Default for TokenTtls {
    fn default() -> Self {
        Self {
            register: Duration::seconds(600),
            access: Duration::seconds(1800),
            refresh: Duration::days(14),
        }
    }
}

/// Successfully verified token: well-formed payload, valid signature.
/// Expiry is reported separately so callers can branch on it.
#[derive(Debug, Clone)]
pub struct Decoded<C> {
    pub claims: C,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl<C> Decoded<C> {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn into_fresh(self, now: DateTime<Utc>) -> Result<C, TokenError> {
        if self.is_expired(now) {
            Err(TokenError::Expired)
        } else {
            Ok(self.claims)
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope<C> {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    iat: i64,
    exp: i64,
    #[serde(flatten)]
    claims: C,
}

/// One token kind: key + TTL + optional payload tag. `seal`/`open` are
/// shared by all kinds; only the parameters differ.
struct KindCodec {
    signing: SigningKey,
    ttl: Duration,
    tag: Option<&'static str>,
}

impl KindCodec {
    fn seal<C: Serialize>(&self, claims: C) -> Result<String> {
        self.seal_at(claims, Utc::now())
    }

    fn seal_at<C: Serialize>(&self, claims: C, now: DateTime<Utc>) -> Result<String> {
        let envelope = Envelope {
            kind: self.tag.map(str::to_string),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
            claims,
        };
        let payload =
            serde_json::to_vec(&envelope).with_context(|| "failed to serialize token claims")?;
        let signature = self.signing.sign(&payload);
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }

    fn open<C: DeserializeOwned>(&self, token: &str) -> Result<Decoded<C>, TokenError> {
        let mut parts = token.split('.');
        let (Some(payload_b64), Some(signature_b64), None) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed);
        };

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenError::Malformed)?;
        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| TokenError::Malformed)?;
        let signature =
            Signature::from_slice(&signature_bytes).map_err(|_| TokenError::Malformed)?;

        // Signature covers the raw payload bytes; verify before parsing.
        self.signing
            .verifying_key()
            .verify_strict(&payload, &signature)
            .map_err(|_| TokenError::SignatureInvalid)?;

        let envelope: Envelope<C> =
            serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;
        if envelope.kind.as_deref() != self.tag {
            return Err(TokenError::Malformed);
        }

        let issued_at = DateTime::from_timestamp(envelope.iat, 0).ok_or(TokenError::Malformed)?;
        let expires_at = DateTime::from_timestamp(envelope.exp, 0).ok_or(TokenError::Malformed)?;

        Ok(Decoded {
            claims: envelope.claims,
            issued_at,
            expires_at,
        })
    }
}

/// Signs and verifies the three claim shapes. Stateless and cheap to
/// share behind an `Arc`.
pub struct TokenCodec {
    register: KindCodec,
    access: KindCodec,
    refresh: KindCodec,
}

impl TokenCodec {
    pub fn new(keys: TokenKeys, ttls: TokenTtls) -> Self {
        Self {
            register: KindCodec {
                signing: keys.register,
                ttl: ttls.register,
                tag: None,
            },
            access: KindCodec {
                signing: keys.access,
                ttl: ttls.access,
                tag: Some("access"),
            },
            refresh: KindCodec {
                signing: keys.refresh,
                ttl: ttls.refresh,
                tag: Some("refresh"),
            },
        }
    }

    pub fn encode_registration(
        &self,
        identity: &Identity,
        device: &DeviceEnvironment,
    ) -> Result<String> {
        self.register
            .seal(RegistrationClaims::new(identity.clone(), device.clone()))
    }

    pub fn decode_registration(
        &self,
        token: &str,
    ) -> Result<Decoded<RegistrationClaims>, TokenError> {
        self.register.open(token)
    }

    pub fn encode_access(&self, user_id: i64, roles: &RoleSet, nickname: &str) -> Result<String> {
        self.access.seal(AccessClaims {
            user_id,
            nickname: nickname.to_string(),
            roles: roles.clone(),
        })
    }

    pub fn decode_access(&self, token: &str) -> Result<Decoded<AccessClaims>, TokenError> {
        self.access.open(token)
    }

    /// Mints a refresh token with a fresh random `state` nonce.
    pub fn encode_refresh(&self, user_id: i64, device_id: &str) -> Result<String> {
        self.refresh.seal(RefreshClaims::new(user_id, device_id))
    }

    pub fn decode_refresh(&self, token: &str) -> Result<Decoded<RefreshClaims>, TokenError> {
        self.refresh.open(token)
    }
}
