//! Signed-claims tokens for the Dealboard backend.
//!
//! One generic codec signs and verifies all three token kinds
//! (registration, access, refresh). Kinds differ only in claim shape,
//! signing key, TTL, and the `type` tag embedded in the payload.

pub mod codec;
pub mod keys;

pub use codec::{Decoded, TokenCodec, TokenError, TokenKeys, TokenTtls};
pub use keys::{
    generate_signing_key, signing_key_from_base64, signing_key_to_base64, verifying_key_base64,
    SigningKey,
};
