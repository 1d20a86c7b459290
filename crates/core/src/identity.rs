use serde::{Deserialize, Serialize};

/// External-provider identity. Never mutated after issuance; used only as
/// a lookup key into the user store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub oauth_id: String,
    pub provider: String,
}

impl Identity {
    pub fn new(oauth_id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            oauth_id: oauth_id.into(),
            provider: provider.into(),
        }
    }
}

/// Client-supplied device descriptor. `device_id` partitions refresh
/// sessions; the remaining fields are opaque strings echoed back to
/// operators for session listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEnvironment {
    pub device_id: String,
    pub os: String,
    pub browser: String,
    pub version: String,
}

impl DeviceEnvironment {
    pub fn new(
        device_id: impl Into<String>,
        os: impl Into<String>,
        browser: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            os: os.into(),
            browser: browser.into(),
            version: version.into(),
        }
    }
}
