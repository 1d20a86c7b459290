use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use dealboard_core::RoleSet;
use dealboard_token::TokenCodec;

use crate::AppState;

const BEARER_PREFIX: &str = "Bearer ";

/// Caller identity decoded from a fresh access token, threaded through
/// request extensions. Handlers that tolerate anonymous callers extract
/// it as `Option<Extension<CallerIdentity>>`.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub user_id: i64,
    pub nickname: String,
    pub roles: RoleSet,
}

/// Attaches caller identity when the `Authorization` header carries a
/// valid, unexpired bearer access token. Never rejects the request:
/// downstream authorization decides what anonymous callers may do.
pub async fn attach_caller_identity(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(identity) = identity_from_headers(&state.codec(), request.headers()) {
        request.extensions_mut().insert(identity);
    }
    next.run(request).await
}

fn identity_from_headers(codec: &TokenCodec, headers: &HeaderMap) -> Option<CallerIdentity> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix(BEARER_PREFIX)?;

    let decoded = match codec.decode_access(token) {
        Ok(decoded) => decoded,
        Err(err) => {
            debug!(%err, "discarding unverifiable access token");
            return None;
        }
    };
    if decoded.is_expired(Utc::now()) {
        debug!("discarding expired access token");
        return None;
    }

    Some(CallerIdentity {
        user_id: decoded.claims.user_id,
        nickname: decoded.claims.nickname,
        roles: decoded.claims.roles,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MeResponse {
    user_id: i64,
    nickname: String,
    roles: RoleSet,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

pub async fn me(identity: Option<Extension<CallerIdentity>>) -> Response {
    match identity {
        Some(Extension(identity)) => Json(MeResponse {
            user_id: identity.user_id,
            nickname: identity.nickname,
            roles: identity.roles,
        })
        .into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody {
                error: "unauthenticated",
            }),
        )
            .into_response(),
    }
}
