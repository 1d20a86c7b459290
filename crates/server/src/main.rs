mod config;
mod cookies;
mod guard;
mod identity;
mod session;

const REQUEST_ID_HEADER: &str = "x-request-id";
const CONTENT_SECURITY_POLICY: &str =
    "default-src 'none'; frame-ancestors 'none'; base-uri 'none'; form-action 'self'";
const REFERRER_POLICY: &str = "no-referrer";
const X_CONTENT_TYPE_OPTIONS: &str = "nosniff";
const X_FRAME_OPTIONS: &str = "DENY";

use std::{
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

use anyhow::{anyhow, Context, Result};
use axum::{
    extract::State,
    http::{header, header::HeaderName, HeaderValue, Method},
    routing::{get, post},
    Json, Router,
};
use chrono::Duration as ChronoDuration;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    propagate_header::PropagateHeaderLayer,
    request_id::{MakeRequestUuid, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dealboard_core::{Identity, NewUser};
use dealboard_media::{DisabledImageAttachment, ImageAttachment};
use dealboard_storage::{connect, StoragePool, UserRepository};
use dealboard_token::{
    generate_signing_key, signing_key_from_base64, signing_key_to_base64, verifying_key_base64,
    SigningKey, TokenCodec, TokenTtls,
};

use crate::{
    config::{AuthConfig, CliOverrides, LogFormat, ServerConfig},
    cookies::CookieFactory,
    identity::{IdentityBridge, OAuthGateway},
    session::{
        InMemorySessionStore, InMemoryUserStore, PostgresSessionStore, PostgresUserStore,
        RefreshSessionStore, SessionOrchestrator, UserStore,
    },
};

#[derive(Clone)]
struct StorageState {
    status: StorageStatus,
    pool: Option<StoragePool>,
}

#[derive(Clone)]
enum StorageStatus {
    Unconfigured,
    Connected,
    Error(String),
}

impl StorageState {
    fn unconfigured() -> Self {
        Self {
            status: StorageStatus::Unconfigured,
            pool: None,
        }
    }

    fn connected_with_pool(pool: StoragePool) -> Self {
        Self {
            status: StorageStatus::Connected,
            pool: Some(pool),
        }
    }

    fn error(message: String) -> Self {
        Self {
            status: StorageStatus::Error(message),
            pool: None,
        }
    }

    fn component(&self) -> ComponentStatus {
        match &self.status {
            StorageStatus::Unconfigured => ComponentStatus {
                name: "database",
                status: "pending",
                details: Some("database_url not configured".to_string()),
            },
            StorageStatus::Connected => ComponentStatus {
                name: "database",
                status: "configured",
                details: Some("connection established".to_string()),
            },
            StorageStatus::Error(message) => ComponentStatus {
                name: "database",
                status: "error",
                details: Some(message.clone()),
            },
        }
    }

    fn readiness_status(&self) -> &'static str {
        match self.status {
            StorageStatus::Connected => "ready",
            StorageStatus::Unconfigured | StorageStatus::Error(_) => "degraded",
        }
    }

    fn pool(&self) -> Option<StoragePool> {
        self.pool.clone()
    }
}

#[derive(Parser, Debug, Default)]
#[command(
    name = "dealboard-server",
    version,
    about = "Dealboard auth and session gateway"
)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Args, Debug, Default, Clone)]
struct ConfigArgs {
    #[arg(long)]
    bind_addr: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    log_format: Option<LogFormat>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    register_signing_key: Option<String>,
    #[arg(long)]
    access_signing_key: Option<String>,
    #[arg(long)]
    refresh_signing_key: Option<String>,
}

impl ConfigArgs {
    fn into_overrides(self) -> CliOverrides {
        CliOverrides {
            bind_addr: self.bind_addr,
            host: self.host,
            port: self.port,
            log_format: self.log_format,
            database_url: self.database_url,
            register_signing_key: self.register_signing_key,
            access_signing_key: self.access_signing_key,
            refresh_signing_key: self.refresh_signing_key,
        }
    }
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Seed a user account into the configured database.
    SeedUser(SeedUserCommand),
    /// Print fresh base64 signing-key seeds for the three token kinds.
    GenKeys,
}

#[derive(Args, Debug)]
struct SeedUserCommand {
    #[arg(long)]
    oauth_id: String,
    #[arg(long, default_value = "kakao")]
    provider: String,
    #[arg(long)]
    nickname: String,
    #[arg(long)]
    email: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(ServerConfig::load_with(cli.config.into_overrides())?);

    match cli.command {
        Some(command) => run_command(&config, command).await,
        None => run(config).await,
    }
}

async fn run_command(config: &ServerConfig, command: CliCommand) -> Result<()> {
    match command {
        CliCommand::GenKeys => {
            for kind in ["register", "access", "refresh"] {
                println!("{kind}: {}", signing_key_to_base64(&generate_signing_key()));
            }
            Ok(())
        }
        CliCommand::SeedUser(cmd) => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow!("database_url must be configured to seed users"))?;
            let pool = connect(url).await?;
            let user = UserRepository::create_user(
                pool.pool(),
                &NewUser::registered(
                    Identity::new(cmd.oauth_id, cmd.provider),
                    cmd.nickname,
                    cmd.email,
                ),
            )
            .await?;
            println!("created user {} ({})", user.id, user.nickname);
            Ok(())
        }
    }
}

fn load_signing_key(kind: &'static str, configured: Option<&str>) -> Result<SigningKey> {
    match configured {
        Some(raw) => {
            let key = signing_key_from_base64(raw)
                .with_context(|| format!("invalid {kind} signing key"))?;
            info!(
                kind,
                verifying_key = %verifying_key_base64(&key),
                "signing key loaded from configuration"
            );
            Ok(key)
        }
        None => {
            let key = generate_signing_key();
            info!(
                kind,
                verifying_key = %verifying_key_base64(&key),
                "no signing key supplied; generated ephemeral key"
            );
            Ok(key)
        }
    }
}

fn build_token_codec(auth: &AuthConfig) -> Result<TokenCodec> {
    let keys = dealboard_token::TokenKeys {
        register: load_signing_key("register", auth.register_signing_key.as_deref())?,
        access: load_signing_key("access", auth.access_signing_key.as_deref())?,
        refresh: load_signing_key("refresh", auth.refresh_signing_key.as_deref())?,
    };
    let ttls = TokenTtls {
        register: ChronoDuration::seconds(auth.register_ttl_secs),
        access: ChronoDuration::seconds(auth.access_ttl_secs),
        refresh: ChronoDuration::seconds(auth.refresh_ttl_secs),
    };
    Ok(TokenCodec::new(keys, ttls))
}

async fn run(config: Arc<ServerConfig>) -> Result<()> {
    init_tracing(&config);

    info!(
        bind_addr = ?config.bind_addr,
        host = %config.host,
        port = config.port,
        log_format = ?config.log_format,
        database_url_configured = config.database_url.is_some(),
        auth_configured_key_count = config.auth.configured_key_count(),
        register_ttl_secs = config.auth.register_ttl_secs,
        access_ttl_secs = config.auth.access_ttl_secs,
        refresh_ttl_secs = config.auth.refresh_ttl_secs,
        "resolved server configuration"
    );

    let storage = match config.database_url.as_deref() {
        Some(url) => match connect(url).await {
            Ok(pool) => {
                info!("database connection established");
                StorageState::connected_with_pool(pool)
            }
            Err(err) => {
                error!(?err, "failed to establish database connection");
                StorageState::error(err.to_string())
            }
        },
        None => StorageState::unconfigured(),
    };

    let codec = Arc::new(build_token_codec(&config.auth)?);
    let refresh_ttl = ChronoDuration::seconds(config.auth.refresh_ttl_secs);

    let (users, sessions): (Arc<dyn UserStore>, Arc<dyn RefreshSessionStore>) = match storage.pool()
    {
        Some(pool) => (
            Arc::new(PostgresUserStore::new(pool.clone())),
            Arc::new(PostgresSessionStore::new(pool, refresh_ttl)),
        ),
        None => {
            info!("database unavailable; using in-memory auth stores");
            (
                Arc::new(InMemoryUserStore::new()),
                Arc::new(InMemorySessionStore::new(refresh_ttl)),
            )
        }
    };

    let images: Arc<dyn ImageAttachment> = Arc::new(DisabledImageAttachment);
    let orchestrator = Arc::new(SessionOrchestrator::new(
        codec.clone(),
        users.clone(),
        sessions,
        images,
        CookieFactory::new(config.auth.refresh_ttl_secs),
    ));
    let bridge = Arc::new(IdentityBridge::new(users));

    let state = AppState::new(config.clone(), storage, codec, orchestrator, bridge);
    let app = build_app(state);

    let addr: SocketAddr = config.listener_addr()?;
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {addr}");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[derive(Clone)]
struct AppState {
    started_at: Instant,
    #[allow(dead_code)]
    config: Arc<ServerConfig>,
    storage: StorageState,
    codec: Arc<TokenCodec>,
    orchestrator: Arc<SessionOrchestrator>,
    bridge: Arc<IdentityBridge>,
    oauth: Option<Arc<dyn OAuthGateway>>,
}

impl AppState {
    fn new(
        config: Arc<ServerConfig>,
        storage: StorageState,
        codec: Arc<TokenCodec>,
        orchestrator: Arc<SessionOrchestrator>,
        bridge: Arc<IdentityBridge>,
    ) -> Self {
        Self {
            started_at: Instant::now(),
            config,
            storage,
            codec,
            orchestrator,
            bridge,
            oauth: None,
        }
    }

    #[cfg(test)]
    fn with_oauth_gateway(mut self, gateway: Arc<dyn OAuthGateway>) -> Self {
        self.oauth = Some(gateway);
        self
    }

    fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    fn codec(&self) -> Arc<TokenCodec> {
        self.codec.clone()
    }

    fn orchestrator(&self) -> Arc<SessionOrchestrator> {
        self.orchestrator.clone()
    }

    fn identity_bridge(&self) -> Arc<IdentityBridge> {
        self.bridge.clone()
    }

    fn oauth_gateway(&self) -> Option<Arc<dyn OAuthGateway>> {
        self.oauth.clone()
    }

    fn database_component(&self) -> ComponentStatus {
        self.storage.component()
    }
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct ComponentStatus {
    name: &'static str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

#[derive(Serialize)]
struct ReadinessResponse {
    status: &'static str,
    uptime_seconds: u64,
    components: Vec<ComponentStatus>,
}

async fn readiness(State(state): State<AppState>) -> Json<ReadinessResponse> {
    Json(ReadinessResponse {
        status: state.storage.readiness_status(),
        uptime_seconds: state.uptime_seconds(),
        components: vec![state.database_component()],
    })
}

#[derive(Serialize)]
struct VersionResponse {
    version: &'static str,
}

async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn init_tracing(config: &ServerConfig) {
    // Respect RUST_LOG if set, otherwise default to info for our crates.
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dealboard_server=info,dealboard=info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.log_format() {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init(),
    };

    if let Err(err) = result {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!(?e, "failed to install Ctrl+C handler");
    }
    info!("shutdown signal received");
}

fn build_app(state: AppState) -> Router {
    let client_v1_routes = Router::new()
        .route("/auth/login", post(identity::login))
        .route(
            "/auth/register/complete",
            post(session::complete_registration),
        )
        .route("/auth/refresh", post(session::refresh))
        .route("/auth/logout", post(session::logout))
        .route("/users/me", get(guard::me));

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/ready", get(readiness))
        .route("/version", get(version));

    // Keep legacy paths while exposing the same handlers under a versioned prefix.
    router = router.merge(client_v1_routes.clone());
    router = router.nest("/client/v1", client_v1_routes);

    let request_id_header = HeaderName::from_static(REQUEST_ID_HEADER);

    let trace_layer = TraceLayer::new_for_http();

    // The SameSite=None refresh cookie exists for cross-site web clients,
    // so credentials must be allowed here.
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(session::DEVICE_ID_HEADER),
        ])
        .allow_credentials(true);

    let builder = ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("content-security-policy"),
            HeaderValue::from_static(CONTENT_SECURITY_POLICY),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static(REFERRER_POLICY),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static(X_CONTENT_TYPE_OPTIONS),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static(X_FRAME_OPTIONS),
        ))
        .layer(PropagateHeaderLayer::new(request_id_header.clone()))
        .layer(trace_layer)
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid));

    router
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            guard::attach_caller_identity,
        ))
        .layer(builder)
        .layer(cors)
        .with_state(state)
}
