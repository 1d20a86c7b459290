use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::CookieJar;
use serde::{Deserialize, Serialize};
use tracing::error;

use dealboard_core::{DeviceEnvironment, Identity, User};

use crate::session::{flow_error_response, SessionResponse, UserStore};
use crate::AppState;

/// Attributes handed back by the external OAuth2 provider after the
/// authorization-code exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthProfile {
    pub id: String,
    pub provider: String,
    pub email: Option<String>,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

/// Boundary to the external OAuth2 provider. Exchanges an authorization
/// code for the provider's view of the identity.
#[async_trait]
pub trait OAuthGateway: Send + Sync {
    async fn fetch_profile(&self, provider: &str, code: &str) -> Result<OAuthProfile>;
}

/// Outcome of resolving an external identity against the user store.
#[derive(Debug)]
pub enum ResolvedIdentity {
    Existing(User),
    New {
        identity: Identity,
        email: Option<String>,
    },
}

/// Read-only lookup from external identity to local user. Never creates
/// a user; creation only happens inside registration completion.
pub struct IdentityBridge {
    users: Arc<dyn UserStore>,
}

impl IdentityBridge {
    pub fn new(users: Arc<dyn UserStore>) -> Self {
        Self { users }
    }

    pub async fn resolve(&self, profile: &OAuthProfile) -> Result<ResolvedIdentity> {
        match self
            .users
            .find_by_oauth_id(&profile.id, &profile.provider)
            .await?
        {
            Some(user) => Ok(ResolvedIdentity::Existing(user)),
            None => Ok(ResolvedIdentity::New {
                identity: Identity::new(profile.id.clone(), profile.provider.clone()),
                email: profile.email.clone(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub provider: String,
    pub code: String,
    pub device: DeviceEnvironment,
}

impl LoginRequest {
    fn validate(self) -> Result<(String, String, DeviceEnvironment), Vec<FieldError>> {
        let mut errors = Vec::new();

        let provider = self.provider.trim().to_string();
        if provider.is_empty() {
            errors.push(FieldError::new("provider", "must be provided"));
        }

        let code = self.code.trim().to_string();
        if code.is_empty() {
            errors.push(FieldError::new("code", "must be provided"));
        }

        if self.device.device_id.trim().is_empty() {
            errors.push(FieldError::new("device.deviceId", "must be provided"));
        }

        if errors.is_empty() {
            Ok((provider, code, self.device))
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationRequired {
    registered: bool,
    register_token: String,
    email: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionEstablished {
    registered: bool,
    #[serde(flatten)]
    session: SessionResponse,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<FieldError>>,
}

#[derive(Debug, Serialize)]
struct FieldError {
    field: &'static str,
    message: &'static str,
}

impl FieldError {
    const fn new(field: &'static str, message: &'static str) -> Self {
        Self { field, message }
    }
}

impl<'a> ErrorBody<'a> {
    fn validation(details: Vec<FieldError>) -> Self {
        Self {
            error: "validation_error",
            details: Some(details),
        }
    }

    fn simple(error: &'a str) -> Self {
        Self {
            error,
            details: None,
        }
    }
}

/// Post-callback login: resolve the provider identity, then either
/// establish a device session or hand back a registration token for the
/// completion call.
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(payload): Json<LoginRequest>,
) -> Response {
    let (provider, code, device) = match payload.validate() {
        Ok(valid) => valid,
        Err(details) => {
            return (StatusCode::BAD_REQUEST, Json(ErrorBody::validation(details))).into_response();
        }
    };

    let Some(gateway) = state.oauth_gateway() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorBody::simple("oauth_unavailable")),
        )
            .into_response();
    };

    let profile = match gateway.fetch_profile(&provider, &code).await {
        Ok(profile) => profile,
        Err(err) => {
            error!(?err, provider, "oauth code exchange failed");
            return (
                StatusCode::BAD_GATEWAY,
                Json(ErrorBody::simple("oauth_exchange_failed")),
            )
                .into_response();
        }
    };

    match state.identity_bridge().resolve(&profile).await {
        Ok(ResolvedIdentity::Existing(user)) => {
            match state.orchestrator().login(&user, &device).await {
                Ok(session) => (
                    StatusCode::OK,
                    jar.add(session.refresh_cookie),
                    Json(SessionEstablished {
                        registered: true,
                        session: SessionResponse {
                            access_token: session.access_token,
                        },
                    }),
                )
                    .into_response(),
                Err(err) => flow_error_response("auth.login", err),
            }
        }
        Ok(ResolvedIdentity::New { identity, email }) => {
            match state.codec().encode_registration(&identity, &device) {
                Ok(register_token) => (
                    StatusCode::OK,
                    Json(RegistrationRequired {
                        registered: false,
                        register_token,
                        email,
                    }),
                )
                    .into_response(),
                Err(err) => {
                    error!(?err, "failed to mint registration token");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(ErrorBody::simple("server_error")),
                    )
                        .into_response()
                }
            }
        }
        Err(err) => {
            error!(?err, "identity resolution failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody::simple("server_error")),
            )
                .into_response()
        }
    }
}
