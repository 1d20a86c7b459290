//! Core domain types shared across the Dealboard backend.

pub mod claims;
pub mod identity;
pub mod user;

pub use claims::{AccessClaims, RefreshClaims, RegistrationClaims};
pub use identity::{DeviceEnvironment, Identity};
pub use user::{NewUser, RoleSet, User, ROLE_USER};
