use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::cookie::Cookie;
use axum_extra::extract::CookieJar;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use dealboard_core::{DeviceEnvironment, NewUser, User};
use dealboard_media::{AttachmentKind, ImageAttachment};
use dealboard_storage::{CreateUserError, RefreshSessionRows, StoragePool, UserRepository};
use dealboard_token::{TokenCodec, TokenError};

use crate::cookies::{CookieFactory, REFRESH_COOKIE_NAME};
use crate::AppState;

/// Header clients use to assert their device id on registration
/// completion. The signed registration claims remain authoritative.
pub const DEVICE_ID_HEADER: &str = "x-device-id";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session not found")]
    NotFound,
    #[error("stored token was superseded")]
    Stale,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SaveUserError {
    #[error("oauth identity already registered")]
    DuplicateIdentity,
    #[error("nickname already taken")]
    NicknameTaken,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Domain failures of the two stateful flows, surfaced unmodified to the
/// HTTP boundary.
#[derive(Debug, thiserror::Error)]
pub enum AuthFlowError {
    #[error("invalid token: {0}")]
    TokenInvalid(#[from] TokenError),
    #[error("device id does not match refresh claims")]
    DeviceMismatch,
    #[error("no live refresh session for this device")]
    SessionNotFound,
    #[error("presented refresh token is no longer current")]
    RefreshStale,
    #[error("oauth identity already registered")]
    DuplicateIdentity,
    #[error("nickname already taken")]
    NicknameTaken,
    #[error("user not found")]
    UserNotFound,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_oauth_id(&self, oauth_id: &str, provider: &str) -> Result<Option<User>>;
    async fn find_by_id(&self, id: i64) -> Result<Option<User>>;
    async fn find_by_nickname(&self, nickname: &str) -> Result<Option<User>>;
    async fn save(&self, new_user: NewUser) -> Result<User, SaveUserError>;
}

/// Device-scoped refresh sessions: at most one live record per
/// `(user, device)`. `rotate` is a compare-and-swap on the previously
/// loaded token value, so of two concurrent rotations exactly one wins
/// and the loser surfaces [`StoreError::Stale`].
#[async_trait]
pub trait RefreshSessionStore: Send + Sync {
    async fn initialize(
        &self,
        user_id: i64,
        token: &str,
        env: &DeviceEnvironment,
    ) -> Result<(), StoreError>;
    async fn rotate(
        &self,
        user_id: i64,
        device_id: &str,
        current: &str,
        next: &str,
    ) -> Result<(), StoreError>;
    async fn load(&self, user_id: i64, device_id: &str) -> Result<String, StoreError>;
    async fn load_env(&self, user_id: i64, device_id: &str)
        -> Result<DeviceEnvironment, StoreError>;
}

fn session_key(user_id: i64, device_id: &str) -> String {
    format!("user:{user_id}:token:refresh:{device_id}")
}

struct StoredSession {
    token: String,
    env: DeviceEnvironment,
    expires_at: DateTime<Utc>,
}

impl StoredSession {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Map-backed store used by tests and by deployments without a database.
/// Records are whole values behind one lock; expired entries count as
/// absent and are overwritten by the next initialize.
pub struct InMemorySessionStore {
    ttl: Duration,
    records: RwLock<HashMap<String, StoredSession>>,
}

impl InMemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: RwLock::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub async fn force_expire(&self, user_id: i64, device_id: &str) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(&session_key(user_id, device_id)) {
            record.expires_at = Utc::now() - Duration::seconds(1);
        }
    }
}

#[async_trait]
impl RefreshSessionStore for InMemorySessionStore {
    async fn initialize(
        &self,
        user_id: i64,
        token: &str,
        env: &DeviceEnvironment,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        records.insert(
            session_key(user_id, &env.device_id),
            StoredSession {
                token: token.to_string(),
                env: env.clone(),
                expires_at: Utc::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn rotate(
        &self,
        user_id: i64,
        device_id: &str,
        current: &str,
        next: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut records = self.records.write().await;
        let record = records
            .get_mut(&session_key(user_id, device_id))
            .filter(|record| record.is_live(now))
            .ok_or(StoreError::NotFound)?;
        if record.token != current {
            return Err(StoreError::Stale);
        }
        record.token = next.to_string();
        record.expires_at = now + self.ttl;
        Ok(())
    }

    async fn load(&self, user_id: i64, device_id: &str) -> Result<String, StoreError> {
        let now = Utc::now();
        let records = self.records.read().await;
        records
            .get(&session_key(user_id, device_id))
            .filter(|record| record.is_live(now))
            .map(|record| record.token.clone())
            .ok_or(StoreError::NotFound)
    }

    async fn load_env(
        &self,
        user_id: i64,
        device_id: &str,
    ) -> Result<DeviceEnvironment, StoreError> {
        let now = Utc::now();
        let records = self.records.read().await;
        records
            .get(&session_key(user_id, device_id))
            .filter(|record| record.is_live(now))
            .map(|record| record.env.clone())
            .ok_or(StoreError::NotFound)
    }
}

/// Map-backed user store for tests and database-less runs.
#[derive(Default)]
pub struct InMemoryUserStore {
    next_id: AtomicI64,
    users: RwLock<HashMap<i64, User>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn remove(&self, id: i64) {
        self.users.write().await.remove(&id);
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn find_by_oauth_id(&self, oauth_id: &str, provider: &str) -> Result<Option<User>> {
        let users = self.users.read().await;
        Ok(users
            .values()
            .find(|user| user.oauth_id == oauth_id && user.provider == provider)
            .cloned())
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<User>> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn find_by_nickname(&self, nickname: &str) -> Result<Option<User>> {
        let users = self.users.read().await;
        Ok(users.values().find(|user| user.nickname == nickname).cloned())
    }

    async fn save(&self, new_user: NewUser) -> Result<User, SaveUserError> {
        let mut users = self.users.write().await;
        if users
            .values()
            .any(|user| user.oauth_id == new_user.oauth_id && user.provider == new_user.provider)
        {
            return Err(SaveUserError::DuplicateIdentity);
        }
        if users.values().any(|user| user.nickname == new_user.nickname) {
            return Err(SaveUserError::NicknameTaken);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let user = User {
            id,
            oauth_id: new_user.oauth_id,
            provider: new_user.provider,
            nickname: new_user.nickname,
            email: new_user.email,
            roles: new_user.roles,
            created_at: Utc::now(),
        };
        users.insert(id, user.clone());
        Ok(user)
    }
}

/// Postgres-backed user store.
#[derive(Clone)]
pub struct PostgresUserStore {
    pool: StoragePool,
}

impl PostgresUserStore {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for PostgresUserStore {
    async fn find_by_oauth_id(&self, oauth_id: &str, provider: &str) -> Result<Option<User>> {
        UserRepository::find_by_oauth_id(self.pool.pool(), oauth_id, provider).await
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<User>> {
        UserRepository::find_by_id(self.pool.pool(), id).await
    }

    async fn find_by_nickname(&self, nickname: &str) -> Result<Option<User>> {
        UserRepository::find_by_nickname(self.pool.pool(), nickname).await
    }

    async fn save(&self, new_user: NewUser) -> Result<User, SaveUserError> {
        UserRepository::create_user(self.pool.pool(), &new_user)
            .await
            .map_err(|err| match err {
                CreateUserError::DuplicateIdentity => SaveUserError::DuplicateIdentity,
                CreateUserError::NicknameTaken => SaveUserError::NicknameTaken,
                CreateUserError::Other(inner) => SaveUserError::Backend(inner),
            })
    }
}

/// Postgres-backed refresh session store.
#[derive(Clone)]
pub struct PostgresSessionStore {
    rows: RefreshSessionRows,
}

impl PostgresSessionStore {
    pub fn new(pool: StoragePool, ttl: Duration) -> Self {
        Self {
            rows: RefreshSessionRows::new(pool, ttl),
        }
    }
}

#[async_trait]
impl RefreshSessionStore for PostgresSessionStore {
    async fn initialize(
        &self,
        user_id: i64,
        token: &str,
        env: &DeviceEnvironment,
    ) -> Result<(), StoreError> {
        self.rows.initialize(user_id, token, env).await?;
        Ok(())
    }

    async fn rotate(
        &self,
        user_id: i64,
        device_id: &str,
        current: &str,
        next: &str,
    ) -> Result<(), StoreError> {
        if self.rows.rotate(user_id, device_id, current, next).await? {
            return Ok(());
        }
        // No row matched the swap: tell a superseded token apart from a
        // missing or lapsed record.
        match self.rows.load(user_id, device_id).await? {
            Some(_) => Err(StoreError::Stale),
            None => Err(StoreError::NotFound),
        }
    }

    async fn load(&self, user_id: i64, device_id: &str) -> Result<String, StoreError> {
        self.rows
            .load(user_id, device_id)
            .await?
            .ok_or(StoreError::NotFound)
    }

    async fn load_env(
        &self,
        user_id: i64,
        device_id: &str,
    ) -> Result<DeviceEnvironment, StoreError> {
        self.rows
            .load_env(user_id, device_id)
            .await?
            .ok_or(StoreError::NotFound)
    }
}

/// Validated profile fields for registration completion.
#[derive(Debug, Clone)]
pub struct RegistrationProfile {
    pub nickname: String,
    pub email: Option<String>,
}

/// Access token plus rendered refresh cookie, the product of every
/// session-establishing flow.
pub struct IssuedSession {
    pub access_token: String,
    pub refresh_cookie: Cookie<'static>,
}

fn map_store(err: StoreError) -> AuthFlowError {
    match err {
        StoreError::NotFound => AuthFlowError::SessionNotFound,
        StoreError::Stale => AuthFlowError::RefreshStale,
        StoreError::Backend(inner) => AuthFlowError::Backend(inner),
    }
}

/// Coordinates the codec, user store, refresh session store, and image
/// collaborator for the stateful auth flows. The only component that
/// touches all of them.
pub struct SessionOrchestrator {
    codec: Arc<TokenCodec>,
    users: Arc<dyn UserStore>,
    sessions: Arc<dyn RefreshSessionStore>,
    images: Arc<dyn ImageAttachment>,
    cookies: CookieFactory,
}

impl SessionOrchestrator {
    pub fn new(
        codec: Arc<TokenCodec>,
        users: Arc<dyn UserStore>,
        sessions: Arc<dyn RefreshSessionStore>,
        images: Arc<dyn ImageAttachment>,
        cookies: CookieFactory,
    ) -> Self {
        Self {
            codec,
            users,
            sessions,
            images,
            cookies,
        }
    }

    /// Turns a registration token into a user row plus a live session.
    /// Failures before the user row is created leave no residue.
    pub async fn complete_registration(
        &self,
        registration_token: &str,
        profile: RegistrationProfile,
        image_id: Option<i64>,
    ) -> Result<IssuedSession, AuthFlowError> {
        let claims = self
            .codec
            .decode_registration(registration_token)?
            .into_fresh(Utc::now())?;
        let identity = claims.identity();

        if self
            .users
            .find_by_oauth_id(&identity.oauth_id, &identity.provider)
            .await?
            .is_some()
        {
            return Err(AuthFlowError::DuplicateIdentity);
        }
        if self
            .users
            .find_by_nickname(&profile.nickname)
            .await?
            .is_some()
        {
            return Err(AuthFlowError::NicknameTaken);
        }

        let user = self
            .users
            .save(NewUser::registered(identity, profile.nickname, profile.email))
            .await
            .map_err(|err| match err {
                SaveUserError::DuplicateIdentity => AuthFlowError::DuplicateIdentity,
                SaveUserError::NicknameTaken => AuthFlowError::NicknameTaken,
                SaveUserError::Backend(inner) => AuthFlowError::Backend(inner),
            })?;

        if let Some(image_id) = image_id {
            self.images
                .attach(user.id, &[image_id], AttachmentKind::Profile)
                .await?;
        }

        info!(
            user_id = user.id,
            device_id = %claims.device.device_id,
            "registration completed"
        );
        self.issue(&user, &claims.device).await
    }

    /// Session establishment for an already-registered identity, e.g.
    /// after an OAuth login on a fresh device. Overwrites any previous
    /// record for that device.
    pub async fn login(
        &self,
        user: &User,
        device: &DeviceEnvironment,
    ) -> Result<IssuedSession, AuthFlowError> {
        info!(user_id = user.id, device_id = %device.device_id, "device session established");
        self.issue(user, device).await
    }

    /// Validated rotation: the presented token must decode, be fresh,
    /// match the caller-asserted device, and equal the stored value.
    pub async fn refresh(
        &self,
        client_device_id: &str,
        presented: &str,
    ) -> Result<IssuedSession, AuthFlowError> {
        let now = Utc::now();
        let claims = self.codec.decode_refresh(presented)?.into_fresh(now)?;

        if claims.device_id != client_device_id {
            warn!(
                user_id = claims.user_id,
                claimed = %claims.device_id,
                asserted = %client_device_id,
                "refresh device mismatch"
            );
            return Err(AuthFlowError::DeviceMismatch);
        }

        let current = self
            .sessions
            .load(claims.user_id, &claims.device_id)
            .await
            .map_err(map_store)?;
        if current != presented {
            warn!(
                user_id = claims.user_id,
                device_id = %claims.device_id,
                "stale refresh token presented"
            );
            return Err(AuthFlowError::RefreshStale);
        }

        let user = self
            .users
            .find_by_id(claims.user_id)
            .await?
            .ok_or(AuthFlowError::UserNotFound)?;

        let access_token = self
            .codec
            .encode_access(user.id, &user.roles, &user.nickname)?;
        let next = self.codec.encode_refresh(user.id, &claims.device_id)?;
        self.sessions
            .rotate(user.id, &claims.device_id, presented, &next)
            .await
            .map_err(map_store)?;

        info!(user_id = user.id, device_id = %claims.device_id, "refresh session rotated");
        Ok(IssuedSession {
            access_token,
            refresh_cookie: self.cookies.refresh_cookie(&next),
        })
    }

    /// Expires the client cookie only. The server-side record is left to
    /// lapse via its TTL; a retained token keeps working until then.
    pub fn logout(&self) -> Cookie<'static> {
        self.cookies.expiring_cookie()
    }

    async fn issue(
        &self,
        user: &User,
        device: &DeviceEnvironment,
    ) -> Result<IssuedSession, AuthFlowError> {
        let access_token = self
            .codec
            .encode_access(user.id, &user.roles, &user.nickname)?;
        let refresh_token = self.codec.encode_refresh(user.id, &device.device_id)?;
        self.sessions
            .initialize(user.id, &refresh_token, device)
            .await
            .map_err(map_store)?;

        Ok(IssuedSession {
            access_token,
            refresh_cookie: self.cookies.refresh_cookie(&refresh_token),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRegistrationRequest {
    pub register_token: String,
    pub nickname: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub image_id: Option<i64>,
}

impl CompleteRegistrationRequest {
    fn validate(self) -> Result<(String, RegistrationProfile, Option<i64>), Vec<FieldError>> {
        let mut errors = Vec::new();

        let register_token = self.register_token.trim().to_string();
        if register_token.is_empty() {
            errors.push(FieldError::new("registerToken", "must be provided"));
        }

        let nickname = self.nickname.trim().to_string();
        if nickname.is_empty() {
            errors.push(FieldError::new("nickname", "must be provided"));
        } else if nickname.chars().count() < 2 || nickname.chars().count() > 24 {
            errors.push(FieldError::new(
                "nickname",
                "must be between 2 and 24 characters",
            ));
        }

        let email = self.email.map(|email| email.trim().to_string());
        if let Some(email) = &email {
            if !email.contains('@') {
                errors.push(FieldError::new("email", "must be a valid address"));
            }
        }

        if errors.is_empty() {
            Ok((
                register_token,
                RegistrationProfile { nickname, email },
                self.image_id,
            ))
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub device_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub access_token: String,
}

#[derive(Debug, Serialize)]
struct LogoutResponse {}

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

pub(crate) fn flow_error_response(route: &'static str, err: AuthFlowError) -> Response {
    let (status, code) = match &err {
        AuthFlowError::TokenInvalid(_) => (StatusCode::UNAUTHORIZED, "token_invalid"),
        AuthFlowError::DeviceMismatch => (StatusCode::FORBIDDEN, "device_mismatch"),
        AuthFlowError::SessionNotFound => (StatusCode::UNAUTHORIZED, "session_not_found"),
        AuthFlowError::RefreshStale => (StatusCode::UNAUTHORIZED, "refresh_stale"),
        AuthFlowError::DuplicateIdentity => (StatusCode::CONFLICT, "duplicate_identity"),
        AuthFlowError::NicknameTaken => (StatusCode::CONFLICT, "nickname_taken"),
        AuthFlowError::UserNotFound => (StatusCode::NOT_FOUND, "user_not_found"),
        AuthFlowError::Backend(inner) => {
            error!(?inner, route, "auth flow failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "server_error")
        }
    };
    (status, Json(ErrorBody::simple(code))).into_response()
}

pub async fn complete_registration(
    State(state): State<AppState>,
    jar: CookieJar,
    headers: HeaderMap,
    Json(payload): Json<CompleteRegistrationRequest>,
) -> Response {
    let (register_token, profile, image_id) = match payload.validate() {
        Ok(valid) => valid,
        Err(details) => {
            return (StatusCode::BAD_REQUEST, Json(ErrorBody::validation(details))).into_response();
        }
    };

    if let Some(device_id) = headers.get(DEVICE_ID_HEADER).and_then(|v| v.to_str().ok()) {
        debug!(device_id, "registration completion requested");
    }

    match state
        .orchestrator()
        .complete_registration(&register_token, profile, image_id)
        .await
    {
        Ok(session) => (
            StatusCode::CREATED,
            jar.add(session.refresh_cookie),
            Json(SessionResponse {
                access_token: session.access_token,
            }),
        )
            .into_response(),
        Err(err) => flow_error_response("auth.register.complete", err),
    }
}

pub async fn refresh(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(payload): Json<RefreshRequest>,
) -> Response {
    let Some(cookie) = jar.get(REFRESH_COOKIE_NAME) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody::simple("refresh_cookie_missing")),
        )
            .into_response();
    };
    let presented = cookie.value().to_string();

    match state
        .orchestrator()
        .refresh(&payload.device_id, &presented)
        .await
    {
        Ok(session) => (
            StatusCode::OK,
            jar.add(session.refresh_cookie),
            Json(SessionResponse {
                access_token: session.access_token,
            }),
        )
            .into_response(),
        Err(err) => flow_error_response("auth.refresh", err),
    }
}

pub async fn logout(State(state): State<AppState>, jar: CookieJar) -> Response {
    let expiring = state.orchestrator().logout();
    (StatusCode::OK, jar.add(expiring), Json(LogoutResponse {})).into_response()
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use dealboard_core::Identity;
    use dealboard_media::DisabledImageAttachment;
    use dealboard_token::{TokenKeys, TokenTtls};

    pub const TEST_REFRESH_TTL_SECS: i64 = 1_209_600;

    pub struct AuthTestHarness {
        pub orchestrator: Arc<SessionOrchestrator>,
        pub users: Arc<InMemoryUserStore>,
        pub sessions: Arc<InMemorySessionStore>,
        pub codec: Arc<TokenCodec>,
    }

    impl AuthTestHarness {
        pub fn new() -> Self {
            Self::with_ttls(TokenTtls::default())
        }

        pub fn with_ttls(ttls: TokenTtls) -> Self {
            let codec = Arc::new(TokenCodec::new(TokenKeys::ephemeral(), ttls));
            let users = Arc::new(InMemoryUserStore::new());
            let sessions = Arc::new(InMemorySessionStore::new(Duration::seconds(
                TEST_REFRESH_TTL_SECS,
            )));
            let orchestrator = Arc::new(SessionOrchestrator::new(
                codec.clone(),
                users.clone(),
                sessions.clone(),
                Arc::new(DisabledImageAttachment),
                CookieFactory::new(TEST_REFRESH_TTL_SECS),
            ));
            Self {
                orchestrator,
                users,
                sessions,
                codec,
            }
        }

        pub fn register_token(&self, oauth_id: &str, device_id: &str) -> String {
            self.codec
                .encode_registration(
                    &Identity::new(oauth_id, "kakao"),
                    &DeviceEnvironment::new(device_id, "macOS", "Firefox", "131.0"),
                )
                .expect("registration token encodes")
        }

        pub fn profile(nickname: &str) -> RegistrationProfile {
            RegistrationProfile {
                nickname: nickname.to_string(),
                email: None,
            }
        }

        pub async fn registered(&self, oauth_id: &str, device_id: &str) -> (User, IssuedSession) {
            let token = self.register_token(oauth_id, device_id);
            let session = self
                .orchestrator
                .complete_registration(&token, Self::profile(oauth_id), None)
                .await
                .expect("registration completes");
            let user = self
                .users
                .find_by_oauth_id(oauth_id, "kakao")
                .await
                .expect("lookup succeeds")
                .expect("user exists");
            (user, session)
        }
    }

    #[test]
    fn session_key_uses_the_kv_record_format() {
        assert_eq!(session_key(42, "dev-1"), "user:42:token:refresh:dev-1");
    }

    #[tokio::test]
    async fn initialize_establishes_a_single_record() {
        let store = InMemorySessionStore::new(Duration::seconds(60));
        let env = DeviceEnvironment::new("dev-1", "macOS", "Firefox", "131.0");

        store.initialize(42, "tok-a", &env).await.expect("initialize");
        assert_eq!(store.load(42, "dev-1").await.expect("load"), "tok-a");
        assert_eq!(store.load_env(42, "dev-1").await.expect("env"), env);

        // Re-initialize overwrites the whole record.
        store.initialize(42, "tok-b", &env).await.expect("initialize");
        assert_eq!(store.load(42, "dev-1").await.expect("load"), "tok-b");
    }

    #[tokio::test]
    async fn rotate_replaces_the_value_and_guards_on_the_old_one() {
        let store = InMemorySessionStore::new(Duration::seconds(60));
        let env = DeviceEnvironment::new("dev-1", "macOS", "Firefox", "131.0");
        store.initialize(42, "tok-a", &env).await.expect("initialize");

        store
            .rotate(42, "dev-1", "tok-a", "tok-b")
            .await
            .expect("rotate succeeds");
        assert_eq!(store.load(42, "dev-1").await.expect("load"), "tok-b");

        let stale = store.rotate(42, "dev-1", "tok-a", "tok-c").await;
        assert!(matches!(stale, Err(StoreError::Stale)));
        assert_eq!(store.load(42, "dev-1").await.expect("load"), "tok-b");
    }

    #[tokio::test]
    async fn expired_records_count_as_absent() {
        let store = InMemorySessionStore::new(Duration::seconds(60));
        let env = DeviceEnvironment::new("dev-1", "macOS", "Firefox", "131.0");
        store.initialize(42, "tok-a", &env).await.expect("initialize");
        store.force_expire(42, "dev-1").await;

        assert!(matches!(
            store.load(42, "dev-1").await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.rotate(42, "dev-1", "tok-a", "tok-b").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn devices_are_isolated() {
        let store = InMemorySessionStore::new(Duration::seconds(60));
        let dev1 = DeviceEnvironment::new("dev-1", "macOS", "Firefox", "131.0");
        let dev2 = DeviceEnvironment::new("dev-2", "android", "Chrome", "130");

        store.initialize(42, "tok-1", &dev1).await.expect("initialize");
        store.initialize(42, "tok-2", &dev2).await.expect("initialize");
        store
            .rotate(42, "dev-1", "tok-1", "tok-1b")
            .await
            .expect("rotate");

        assert_eq!(store.load(42, "dev-1").await.expect("load"), "tok-1b");
        assert_eq!(store.load(42, "dev-2").await.expect("load"), "tok-2");
    }

    #[tokio::test]
    async fn registration_creates_user_and_session() {
        let harness = AuthTestHarness::new();
        let (user, session) = harness.registered("kakao-12345", "dev-1").await;

        let decoded = harness
            .codec
            .decode_access(&session.access_token)
            .expect("access token decodes");
        assert_eq!(decoded.claims.user_id, user.id);
        assert!(decoded.claims.roles.contains("USER"));

        let stored = harness
            .sessions
            .load(user.id, "dev-1")
            .await
            .expect("session exists");
        assert_eq!(stored, session.refresh_cookie.value());

        let env = harness
            .sessions
            .load_env(user.id, "dev-1")
            .await
            .expect("env exists");
        assert_eq!(env.device_id, "dev-1");
    }

    #[tokio::test]
    async fn replaying_a_registration_token_fails_duplicate_identity() {
        let harness = AuthTestHarness::new();
        let token = harness.register_token("kakao-12345", "dev-1");

        harness
            .orchestrator
            .complete_registration(&token, AuthTestHarness::profile("hunter"), None)
            .await
            .expect("first completion succeeds");

        // Token itself is still fresh; the identity lookup now resolves.
        let replay = harness
            .orchestrator
            .complete_registration(&token, AuthTestHarness::profile("hunter2"), None)
            .await;
        assert!(matches!(replay, Err(AuthFlowError::DuplicateIdentity)));
    }

    #[tokio::test]
    async fn taken_nickname_fails_before_user_creation() {
        let harness = AuthTestHarness::new();
        harness.registered("kakao-1", "dev-1").await;

        let token = harness.register_token("kakao-2", "dev-2");
        let outcome = harness
            .orchestrator
            .complete_registration(&token, AuthTestHarness::profile("kakao-1"), None)
            .await;
        assert!(matches!(outcome, Err(AuthFlowError::NicknameTaken)));
        assert!(harness
            .users
            .find_by_oauth_id("kakao-2", "kakao")
            .await
            .expect("lookup succeeds")
            .is_none());
    }

    #[tokio::test]
    async fn expired_registration_token_is_token_invalid() {
        let harness = AuthTestHarness::with_ttls(TokenTtls {
            register: Duration::seconds(-5),
            ..TokenTtls::default()
        });
        let token = harness.register_token("kakao-12345", "dev-1");

        let outcome = harness
            .orchestrator
            .complete_registration(&token, AuthTestHarness::profile("hunter"), None)
            .await;
        assert!(matches!(
            outcome,
            Err(AuthFlowError::TokenInvalid(TokenError::Expired))
        ));
    }

    #[tokio::test]
    async fn refresh_rotates_the_stored_value() {
        let harness = AuthTestHarness::new();
        let (user, session) = harness.registered("kakao-12345", "dev-1").await;
        let original = session.refresh_cookie.value().to_string();

        let rotated = harness
            .orchestrator
            .refresh("dev-1", &original)
            .await
            .expect("refresh succeeds");
        let next = rotated.refresh_cookie.value().to_string();

        assert_ne!(original, next);
        assert_eq!(
            harness.sessions.load(user.id, "dev-1").await.expect("load"),
            next
        );
    }

    #[tokio::test]
    async fn refresh_with_mismatched_device_leaves_store_untouched() {
        let harness = AuthTestHarness::new();
        let (user, session) = harness.registered("kakao-12345", "dev-1").await;
        let original = session.refresh_cookie.value().to_string();

        let outcome = harness.orchestrator.refresh("dev-2", &original).await;
        assert!(matches!(outcome, Err(AuthFlowError::DeviceMismatch)));
        assert_eq!(
            harness.sessions.load(user.id, "dev-1").await.expect("load"),
            original
        );
    }

    #[tokio::test]
    async fn refresh_after_store_expiry_is_session_not_found() {
        let harness = AuthTestHarness::new();
        let (user, session) = harness.registered("kakao-12345", "dev-1").await;
        harness.sessions.force_expire(user.id, "dev-1").await;

        let outcome = harness
            .orchestrator
            .refresh("dev-1", session.refresh_cookie.value())
            .await;
        assert!(matches!(outcome, Err(AuthFlowError::SessionNotFound)));
    }

    #[tokio::test]
    async fn superseded_token_is_refresh_stale() {
        let harness = AuthTestHarness::new();
        let (_, session) = harness.registered("kakao-12345", "dev-1").await;
        let original = session.refresh_cookie.value().to_string();

        harness
            .orchestrator
            .refresh("dev-1", &original)
            .await
            .expect("first refresh succeeds");

        let replay = harness.orchestrator.refresh("dev-1", &original).await;
        assert!(matches!(replay, Err(AuthFlowError::RefreshStale)));
    }

    #[tokio::test]
    async fn concurrent_refreshes_have_exactly_one_winner() {
        let harness = AuthTestHarness::new();
        let (_, session) = harness.registered("kakao-12345", "dev-1").await;
        let original = session.refresh_cookie.value().to_string();

        let (first, second) = tokio::join!(
            harness.orchestrator.refresh("dev-1", &original),
            harness.orchestrator.refresh("dev-1", &original),
        );

        let winners = [&first, &second]
            .iter()
            .filter(|outcome| outcome.is_ok())
            .count();
        assert_eq!(winners, 1, "compare-and-swap admits exactly one rotation");

        let loser = if first.is_ok() { second } else { first };
        assert!(matches!(loser, Err(AuthFlowError::RefreshStale)));
    }

    #[tokio::test]
    async fn deleted_user_fails_refresh_with_user_not_found() {
        let harness = AuthTestHarness::new();
        let (user, session) = harness.registered("kakao-12345", "dev-1").await;
        harness.users.remove(user.id).await;

        let outcome = harness
            .orchestrator
            .refresh("dev-1", session.refresh_cookie.value())
            .await;
        assert!(matches!(outcome, Err(AuthFlowError::UserNotFound)));
    }

    #[tokio::test]
    async fn logout_expires_the_cookie_but_not_the_store_record() {
        let harness = AuthTestHarness::new();
        let (user, session) = harness.registered("kakao-12345", "dev-1").await;
        let original = session.refresh_cookie.value().to_string();

        let expiring = harness.orchestrator.logout();
        assert_eq!(expiring.max_age(), Some(time::Duration::ZERO));
        assert_eq!(expiring.value(), "");

        // Server-side state is deliberately untouched: the retained token
        // still rotates. This assertion starts failing the day logout
        // revokes the record.
        assert_eq!(
            harness.sessions.load(user.id, "dev-1").await.expect("load"),
            original
        );
        harness
            .orchestrator
            .refresh("dev-1", &original)
            .await
            .expect("refresh still succeeds after logout");
    }

    #[tokio::test]
    async fn login_reinitializes_a_device_session() {
        let harness = AuthTestHarness::new();
        let (user, session) = harness.registered("kakao-12345", "dev-1").await;
        let first = session.refresh_cookie.value().to_string();

        let device = DeviceEnvironment::new("dev-1", "macOS", "Firefox", "132.0");
        let relogin = harness
            .orchestrator
            .login(&user, &device)
            .await
            .expect("login succeeds");
        let second = relogin.refresh_cookie.value().to_string();

        assert_ne!(first, second);
        assert_eq!(
            harness.sessions.load(user.id, "dev-1").await.expect("load"),
            second
        );
        // The earlier token was overwritten, so presenting it is stale.
        let outcome = harness.orchestrator.refresh("dev-1", &first).await;
        assert!(matches!(outcome, Err(AuthFlowError::RefreshStale)));
    }
}
