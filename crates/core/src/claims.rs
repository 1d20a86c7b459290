//! Claim bodies for the three signed token kinds.
//!
//! These structs are the wire payloads embedded in signed tokens; field
//! names are part of the client contract and must stay camelCase. Issue
//! and expiry instants live in the token envelope, not here.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::{DeviceEnvironment, Identity};
use crate::user::RoleSet;

/// Claims bridging a successful external-identity login to a local user
/// that does not exist yet. The signed token is the only record of this
/// state; nothing is persisted server-side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationClaims {
    pub oauth_id: String,
    pub provider: String,
    #[serde(flatten)]
    pub device: DeviceEnvironment,
}

impl RegistrationClaims {
    pub fn new(identity: Identity, device: DeviceEnvironment) -> Self {
        Self {
            oauth_id: identity.oauth_id,
            provider: identity.provider,
            device,
        }
    }

    pub fn identity(&self) -> Identity {
        Identity::new(self.oauth_id.clone(), self.provider.clone())
    }
}

/// Stateless caller assertion; verification never touches storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessClaims {
    pub user_id: i64,
    pub nickname: String,
    pub roles: RoleSet,
}

/// Claims paired with a server-side session record. `state` is a random
/// nonce so two tokens minted in the same instant for the same device
/// still differ.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshClaims {
    pub user_id: i64,
    pub device_id: String,
    pub state: Uuid,
}

impl RefreshClaims {
    pub fn new(user_id: i64, device_id: impl Into<String>) -> Self {
        Self {
            user_id,
            device_id: device_id.into(),
            state: Uuid::new_v4(),
        }
    }
}
