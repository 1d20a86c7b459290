use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::Identity;

/// Roles carried in access tokens. Ordered set so serialized claims are
/// deterministic.
pub type RoleSet = BTreeSet<String>;

/// Role granted to every freshly registered user.
pub const ROLE_USER: &str = "USER";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub oauth_id: String,
    pub provider: String,
    pub nickname: String,
    pub email: Option<String>,
    pub roles: RoleSet,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn identity(&self) -> Identity {
        Identity::new(self.oauth_id.clone(), self.provider.clone())
    }
}

/// Profile + identity payload for user creation. The id is assigned by
/// the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub oauth_id: String,
    pub provider: String,
    pub nickname: String,
    pub email: Option<String>,
    pub roles: RoleSet,
}

impl NewUser {
    pub fn registered(identity: Identity, nickname: impl Into<String>, email: Option<String>) -> Self {
        Self {
            oauth_id: identity.oauth_id,
            provider: identity.provider,
            nickname: nickname.into(),
            email,
            roles: RoleSet::from([ROLE_USER.to_string()]),
        }
    }
}
