mod admission;
mod auth;
mod config;
mod history;
mod messaging;
#[cfg(feature = "metrics")]
mod metrics;
mod store;
mod telemetry;

const CONTENT_SECURITY_POLICY: &str =
    "default-src 'none'; frame-ancestors 'none'; base-uri 'none'; form-action 'self'";
const REFERRER_POLICY: &str = "no-referrer";
const X_CONTENT_TYPE_OPTIONS: &str = "nosniff";
const X_FRAME_OPTIONS: &str = "DENY";

#[cfg(feature = "metrics")]
use anyhow::Context;
use anyhow::{bail, Result};
use axum::{
    extract::{MatchedPath, Path, State},
    http::{
        header::{HeaderName, CONTENT_TYPE},
        HeaderValue, StatusCode,
    },
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::{future::Future, net::SocketAddr, sync::Arc, time::Instant};
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    propagate_header::PropagateHeaderLayer,
    request_id::{MakeRequestUuid, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{error, info, warn};

use nkata_core::{FieldError, Identity};
use nkata_media::{blob_store_from_config, sniff, BlobError, BlobStore};
use nkata_storage::{connect, migrate, StoragePool};

#[cfg(feature = "metrics")]
use crate::metrics::MetricsContext;
use crate::{
    admission::{AdmissionController, AdmissionPolicy},
    auth::{IdentityResolver, TokenIssuer},
    config::{CliOverrides, LogFormat, ServerConfig},
    history::HistoryService,
    messaging::{MessagingMetrics, MessagingService, PersistenceWorkers},
    store::{InMemoryMessageStore, MessageStore, PostgresMessageStore, UnavailableMessageStore},
    telemetry::{RequestCompleted, RequestSpan, REQUEST_ID_HEADER},
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

    async fn component(&self) -> ComponentStatus {
        match (&self.status, &self.pool) {
            (StorageStatus::Unconfigured, _) => ComponentStatus {
                name: "database",
                status: "in_memory",
                details: Some("database_url not configured; messages are held in memory".into()),
            },
            (StorageStatus::Connected, Some(pool)) => match pool.ping().await {
                Ok(()) => ComponentStatus {
                    name: "database",
                    status: "connected",
                    details: None,
                },
                Err(err) => ComponentStatus {
                    name: "database",
                    status: "error",
                    details: Some(err.to_string()),
                },
            },
            (StorageStatus::Connected, None) => ComponentStatus {
                name: "database",
                status: "connected",
                details: None,
            },
            (StorageStatus::Error(message), _) => ComponentStatus {
                name: "database",
                status: "error",
                details: Some(message.clone()),
            },
        }
    }

    /// A configured database that failed at startup never degrades to the
    /// in-memory store.
    fn message_store(&self) -> Arc<dyn MessageStore> {
        match (&self.status, &self.pool) {
            (StorageStatus::Error(message), _) => {
                Arc::new(UnavailableMessageStore::new(message.clone()))
            }
            (_, Some(pool)) => Arc::new(PostgresMessageStore::new(pool.clone())),
            (_, None) => Arc::new(InMemoryMessageStore::new()),
        }
    }
}

#[derive(Parser, Debug, Default)]
#[command(
    name = "nkata-server",
    version,
    about = "Nkata real-time messaging gateway"
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
    metrics_enabled: Option<bool>,
    #[arg(long)]
    metrics_bind_addr: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    signing_key: Option<String>,
    #[arg(long)]
    admission_max_requests_per_minute: Option<u32>,
    #[arg(long)]
    admission_trust_proxy_headers: Option<bool>,
    #[arg(long)]
    media_storage_dir: Option<std::path::PathBuf>,
    #[arg(long)]
    media_public_base_url: Option<String>,
    #[arg(long)]
    messaging_max_sessions: Option<usize>,
    #[arg(long)]
    messaging_persistence_workers: Option<usize>,
}

impl ConfigArgs {
    fn into_overrides(self) -> CliOverrides {
        CliOverrides {
            bind_addr: self.bind_addr,
            host: self.host,
            port: self.port,
            log_format: self.log_format,
            metrics_enabled: self.metrics_enabled,
            metrics_bind_addr: self.metrics_bind_addr,
            database_url: self.database_url,
            signing_key: self.signing_key,
            max_requests_per_minute: self.admission_max_requests_per_minute,
            trust_proxy_headers: self.admission_trust_proxy_headers,
            media_storage_dir: self.media_storage_dir,
            media_public_base_url: self.media_public_base_url,
            max_sessions: self.messaging_max_sessions,
            persistence_workers: self.messaging_persistence_workers,
        }
    }
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Print a bearer token for a user, signed with the configured key.
    IssueToken(IssueTokenCommand),
    /// Print a fresh signing key suitable for `auth.signing_key`.
    GenerateSigningKey,
}

#[derive(Args, Debug)]
struct IssueTokenCommand {
    /// Username the token resolves to.
    #[arg(long)]
    username: String,
    /// Token lifetime in minutes.
    #[arg(long, default_value_t = 60)]
    ttl_minutes: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let overrides = cli.config.clone().into_overrides();

    let mut config = ServerConfig::load()?;
    config.apply_overrides(&overrides)?;

    match cli.command {
        Some(command) => run_command(&config, command),
        None => run(Arc::new(config)).await,
    }
}

fn run_command(config: &ServerConfig, command: CliCommand) -> Result<()> {
    match command {
        CliCommand::IssueToken(cmd) => {
            println!("{}", issue_token(config, &cmd)?);
            Ok(())
        }
        CliCommand::GenerateSigningKey => {
            println!("{}", TokenIssuer::ephemeral().signing_key_base64());
            Ok(())
        }
    }
}

fn issue_token(config: &ServerConfig, cmd: &IssueTokenCommand) -> Result<String> {
    if cmd.ttl_minutes <= 0 {
        bail!("--ttl-minutes must be positive");
    }
    let issuer = TokenIssuer::from_config(&config.auth)?;
    if issuer.is_ephemeral() {
        bail!("auth.signing_key must be configured to issue tokens the server will accept");
    }
    let identity = Identity::new(cmd.username.as_str())?;
    issuer.issue(&identity, chrono::Duration::minutes(cmd.ttl_minutes))
}

async fn run(config: Arc<ServerConfig>) -> Result<()> {
    telemetry::init(&config);

    let env_override_keys = ServerConfig::environment_override_keys();
    if env_override_keys.is_empty() {
        info!("no NKATA_SERVER environment overrides detected");
    } else {
        info!(keys = ?env_override_keys, "detected NKATA_SERVER environment overrides");
    }

    info!(
        bind_addr = ?config.bind_addr,
        host = %config.host,
        port = config.port,
        log_format = ?config.log_format,
        metrics_enabled = config.metrics.enabled,
        metrics_bind_addr = ?config.metrics.bind_addr,
        database_url_configured = config.database_url.is_some(),
        admission_max_requests_per_minute = config.admission.max_requests_per_minute,
        admission_window_secs = config.admission.window_secs,
        admission_trust_proxy_headers = config.admission.trust_proxy_headers,
        media_storage_dir = ?config.media.storage_dir,
        media_public_base_url = %config.media.public_base_url,
        messaging_max_sessions = config.messaging.max_sessions,
        messaging_persistence_workers = config.messaging.persistence_workers,
        "resolved server configuration"
    );

    let storage = match config.database_url.as_deref() {
        Some(url) => match connect(url).await {
            Ok(pool) => match migrate(&pool).await {
                Ok(()) => {
                    info!("database connection established and migrations applied");
                    StorageState::connected_with_pool(pool)
                }
                Err(err) => {
                    error!(?err, "failed to apply database migrations");
                    StorageState::error(err.to_string())
                }
            },
            Err(err) => {
                error!(?err, "failed to establish database connection");
                StorageState::error(err.to_string())
            }
        },
        None => {
            warn!("database_url not configured; messages will be held in memory");
            StorageState::unconfigured()
        }
    };

    let issuer = TokenIssuer::from_config(&config.auth)?;
    if issuer.is_ephemeral() {
        info!("no auth signing key supplied; generated ephemeral key, issued tokens will not survive a restart");
    } else {
        info!("auth signing key loaded from configuration");
    }

    #[cfg(feature = "metrics")]
    let metrics_ctx = if config.metrics.enabled {
        Some(MetricsContext::init()?)
    } else {
        None
    };

    let services = AppServices {
        store: storage.message_store(),
        blobs: blob_store_from_config(&config.media),
        identity: issuer.resolver(),
        #[cfg(feature = "metrics")]
        metrics: metrics_ctx,
    };
    let state = AppState::new(config.clone(), storage, services);
    let sweeper = state.admission().spawn_sweeper();

    #[cfg(feature = "metrics")]
    {
        if config.metrics.enabled {
            if let Some(bind_addr) = &config.metrics.bind_addr {
                let metrics_addr: SocketAddr = bind_addr
                    .parse()
                    .context("failed to parse metrics bind addr")?;
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_metrics(metrics_addr, state).await {
                        error!(?err, "metrics server terminated unexpectedly");
                    }
                });
            }
        }
    }

    let addr: SocketAddr = config.listener_addr()?;
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {addr}");

    let persistence = state.messaging().persistence().clone();
    serve(listener, build_app(state), shutdown_signal()).await?;

    sweeper.abort();
    info!("draining in-flight message persistence");
    persistence.drain().await;
    Ok(())
}

/// Serve `app` with peer addresses available to the admission middleware.
async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

/// Collaborators injected into the application state.
struct AppServices {
    store: Arc<dyn MessageStore>,
    blobs: Arc<dyn BlobStore>,
    identity: Arc<dyn IdentityResolver>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<MetricsContext>>,
}

#[derive(Clone)]
struct AppState {
    started_at: Instant,
    config: Arc<ServerConfig>,
    storage: StorageState,
    admission: Arc<AdmissionController>,
    identity: Arc<dyn IdentityResolver>,
    messaging: Arc<MessagingService>,
    history: Arc<HistoryService>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<MetricsContext>>,
}

impl AppState {
    fn new(config: Arc<ServerConfig>, storage: StorageState, services: AppServices) -> Self {
        #[cfg(feature = "metrics")]
        let messaging_metrics = MessagingMetrics::new(services.metrics.clone());
        #[cfg(not(feature = "metrics"))]
        let messaging_metrics = MessagingMetrics::default();

        let persistence = PersistenceWorkers::new(
            services.store.clone(),
            config.messaging.persistence_workers,
            messaging_metrics.clone(),
        );
        let messaging = Arc::new(MessagingService::new(
            services.blobs,
            persistence,
            config.messaging.max_sessions,
            messaging_metrics,
        ));

        Self {
            started_at: Instant::now(),
            admission: AdmissionController::new(AdmissionPolicy::from(&config.admission)),
            identity: services.identity,
            history: Arc::new(HistoryService::new(services.store)),
            messaging,
            storage,
            config,
            #[cfg(feature = "metrics")]
            metrics: services.metrics,
        }
    }

    fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    fn admission(&self) -> Arc<AdmissionController> {
        self.admission.clone()
    }

    fn trust_proxy_headers(&self) -> bool {
        self.config.admission.trust_proxy_headers
    }

    fn identity_resolver(&self) -> Arc<dyn IdentityResolver> {
        self.identity.clone()
    }

    fn messaging(&self) -> Arc<MessagingService> {
        self.messaging.clone()
    }

    fn history(&self) -> Arc<HistoryService> {
        self.history.clone()
    }

    #[cfg(feature = "metrics")]
    fn metrics_enabled(&self) -> bool {
        self.config.metrics.enabled
    }

    #[cfg(feature = "metrics")]
    fn metrics(&self) -> Option<Arc<MetricsContext>> {
        self.metrics.clone()
    }

    fn record_http_request(&self, route: &str, status: u16) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            let status_str = status.to_string();
            metrics
                .http_requests_total
                .with_label_values(&[route, status_str.as_str()])
                .inc();
        }
        #[cfg(not(feature = "metrics"))]
        let _ = (route, status);
    }

    fn record_admission_rejection(&self) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.admission_rejections_total.inc();
        }
    }
}

/// JSON error shape shared by every handler.
#[derive(Debug, Serialize)]
pub(crate) struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<FieldError>>,
}

impl ErrorBody {
    pub(crate) fn new(error: &'static str) -> Self {
        Self {
            error,
            details: None,
        }
    }

    pub(crate) fn validation(details: Vec<FieldError>) -> Self {
        Self {
            error: "validation_error",
            details: Some(details),
        }
    }
}

async fn health(matched_path: MatchedPath, State(state): State<AppState>) -> &'static str {
    state.record_http_request(matched_path.as_str(), StatusCode::OK.as_u16());
    "ok"
}

async fn readiness(
    matched_path: MatchedPath,
    State(state): State<AppState>,
) -> Json<ReadinessResponse> {
    let database = state.storage.component().await;
    let status = match database.status {
        "error" => "degraded",
        _ => "ready",
    };

    state.record_http_request(matched_path.as_str(), StatusCode::OK.as_u16());

    Json(ReadinessResponse {
        status,
        uptime_seconds: state.uptime_seconds(),
        components: vec![database],
    })
}

#[derive(Serialize)]
struct VersionResponse {
    version: &'static str,
}

async fn version(
    matched_path: MatchedPath,
    State(state): State<AppState>,
) -> Json<VersionResponse> {
    state.record_http_request(matched_path.as_str(), StatusCode::OK.as_u16());

    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Serve a stored chat blob. The content type comes from the bytes.
async fn media_blob(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let route = "media.chat";
    let response = match state.messaging().blobs().get(&name).await {
        Ok(bytes) => {
            let mime = sniff(&bytes).mime;
            (StatusCode::OK, [(CONTENT_TYPE, mime)], bytes).into_response()
        }
        Err(BlobError::NotFound(_)) => {
            (StatusCode::NOT_FOUND, Json(ErrorBody::new("not_found"))).into_response()
        }
        Err(err) => {
            error!(?err, blob = %name, "failed to read media blob");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody::new("server_error")),
            )
                .into_response()
        }
    };
    state.record_http_request(route, response.status().as_u16());
    response
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!(?e, "failed to install Ctrl+C handler");
    }
    info!("shutdown signal received");
}

fn build_app(state: AppState) -> Router {
    #[cfg(feature = "metrics")]
    let expose_metrics_here = state.metrics_enabled() && state.config.metrics.bind_addr.is_none();

    let v1_routes = Router::new()
        .route(
            "/messages/ws/{conversation_id}",
            get(messaging::session_socket),
        )
        .route(
            "/messages/{message_id}",
            get(history::get_message)
                .patch(history::edit_message)
                .delete(history::delete_message),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            get(history::list_messages),
        )
        .route(
            "/conversations/{conversation_id}/messages/search",
            get(history::search_messages),
        )
        .route("/media/chat/{name}", get(media_blob));

    #[cfg_attr(not(feature = "metrics"), allow(unused_mut))]
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/ready", get(readiness))
        .route("/version", get(version))
        .nest("/v1", v1_routes);

    #[cfg(feature = "metrics")]
    {
        if expose_metrics_here {
            router = router.route("/metrics", get(metrics_handler));
        }
    }

    let router = router.layer(middleware::from_fn_with_state(
        state.clone(),
        admission::admission_middleware,
    ));

    let request_id_header = HeaderName::from_static(REQUEST_ID_HEADER);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(RequestSpan)
        .on_response(RequestCompleted);

    let instrumentation_layers = ServiceBuilder::new()
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
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .into_inner();

    router.layer(instrumentation_layers).with_state(state)
}

#[derive(Serialize)]
struct ReadinessResponse {
    status: &'static str,
    uptime_seconds: u64,
    components: Vec<ComponentStatus>,
}

#[derive(Serialize)]
struct ComponentStatus {
    name: &'static str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    if !state.metrics_enabled() {
        return StatusCode::NOT_FOUND.into_response();
    }

    let Some(metrics) = state.metrics() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            tracing::error!(?err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(feature = "metrics")]
fn build_metrics_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[cfg(feature = "metrics")]
async fn serve_metrics(bind_addr: SocketAddr, state: AppState) -> Result<()> {
    let router = build_metrics_router(state);
    let listener = TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;
    info!("metrics listening on {addr}");
    axum::serve(listener, router.into_make_service()).await?;
    Ok(())
}
