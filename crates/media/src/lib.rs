//! Media repository integrations.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize, Clone)]
pub struct MediaConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}

pub fn validate_config(cfg: &MediaConfig) -> Result<()> {
    if cfg.endpoint.is_empty() || cfg.bucket.is_empty() {
        anyhow::bail!("media configuration is incomplete");
    }

    Ok(())
}

/// What an attached image decorates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Profile,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Profile => "profile",
        }
    }
}

/// Boundary to the media service: binds previously uploaded images to a
/// user. Upload itself lives in the media service, not here.
#[async_trait]
pub trait ImageAttachment: Send + Sync {
    async fn attach(&self, user_id: i64, image_ids: &[i64], kind: AttachmentKind) -> Result<()>;
}

/// No-op client for deployments without a media service.
#[derive(Debug, Default)]
pub struct DisabledImageAttachment;

#[async_trait]
impl ImageAttachment for DisabledImageAttachment {
    async fn attach(&self, user_id: i64, image_ids: &[i64], kind: AttachmentKind) -> Result<()> {
        debug!(
            user_id,
            count = image_ids.len(),
            kind = kind.as_str(),
            "media service disabled; dropping image attachment"
        );
        Ok(())
    }
}
