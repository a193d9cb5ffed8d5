use crate::{
    auth::{
        clock::SystemClock,
        middleware::{public_rate_limit, require_auth},
        principal::PgPrincipalDirectory,
        AuthConfig, AuthState,
    },
    cli::globals::GlobalArgs,
    store::{spawn_janitor, PgStore},
    vault,
};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderName, HeaderValue, Method, Request,
    },
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use secrecy::SecretString;
use sqlx::postgres::PgPoolOptions;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::mpsc};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{info, info_span, warn, Span};
use ulid::Ulid;
use utoipa_swagger_ui::SwaggerUi;

pub mod handlers;
pub mod openapi;

pub use self::openapi::openapi;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

/// Vault session to keep alive while the server runs.
#[derive(Debug)]
pub struct VaultLease {
    pub globals: GlobalArgs,
    pub lease_duration: u64,
}

/// Auth routes plus health and API docs, without the outer HTTP layers.
pub fn router(state: Arc<AuthState>) -> Router {
    let public = Router::new()
        .route("/v1/auth/login", post(handlers::login))
        .route("/v1/auth/refresh", post(handlers::refresh))
        .route("/v1/auth/logout", post(handlers::logout))
        .route_layer(from_fn_with_state(state.clone(), public_rate_limit));

    let protected = Router::new()
        .route("/v1/auth/session", get(handlers::session))
        .route_layer(from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public)
        .merge(protected)
        .route("/health", get(handlers::health).options(handlers::health))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", openapi()))
        .with_state(state)
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(
    port: u16,
    dsn: String,
    config: AuthConfig,
    token_secret: SecretString,
    vault_lease: Option<VaultLease>,
) -> Result<()> {
    // Renew vault token, gracefully shutdown if failed
    let (tx, mut rx) = mpsc::unbounded_channel();

    if let Some(lease) = &vault_lease {
        vault::renew::try_renew(&lease.globals, lease.lease_duration, tx.clone()).await?;
    }

    // Connect to database
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(10)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&dsn)
        .await
        .context("Failed to connect to database")?;

    let store = PgStore::new(pool.clone());
    store.migrate().await.context("Failed to prepare auth store")?;
    let janitor = spawn_janitor(store.clone(), JANITOR_INTERVAL);

    let cors = cors_layer(config.frontend_base_url())?;

    let (state, activity_worker) = AuthState::new(
        config,
        &token_secret,
        Arc::new(store),
        Arc::new(PgPrincipalDirectory::new(pool)),
        Arc::new(SystemClock),
    )?;

    let app = router(Arc::new(state)).layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static("x-request-id"),
                |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                "x-request-id",
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span))
            .layer(cors),
    );

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::select! {
            _ = rx.recv() => warn!("Vault token renewal failed"),
            _ = tokio::signal::ctrl_c() => {}
        }
        info!("Gracefully shutdown");
    })
    .await?;

    janitor.abort();
    activity_worker.abort();

    Ok(())
}

/// Cookies are sent cross-origin only to the configured front end.
fn cors_layer(frontend_base_url: &str) -> Result<CorsLayer> {
    let origin = url::Url::parse(frontend_base_url)
        .with_context(|| format!("Invalid frontend base URL: {frontend_base_url}"))?
        .origin()
        .ascii_serialization();

    Ok(CorsLayer::new()
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_origin(AllowOrigin::exact(HeaderValue::from_str(&origin)?))
        .allow_credentials(true))
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
