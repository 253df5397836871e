use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use portal_sentry::auth::{pending, scheduler};
use portal_sentry::browser::{manager, pool::BrowserPool, pool::ChromeWorkerFactory, storage_state};
use portal_sentry::core::config::ServiceConfig;
use portal_sentry::core::types::{
    PaymentCheckRequest, Provider, ProviderHealth, TokenBody, TwoFaSubmitRequest,
};
use portal_sentry::{AppState, RefreshResult};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=warn"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    info!("Starting portal-sentry");

    let config = Arc::new(ServiceConfig::from_env());

    // Create HTTP client
    let http_timeout = env::var("HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(30);
    let connect_timeout = env::var("HTTP_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(10);
    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(http_timeout))
        .connect_timeout(std::time::Duration::from_secs(connect_timeout))
        .build()?;

    // Browser pool
    let chrome = manager::find_chrome_executable(config.chrome_executable.as_deref())
        .ok_or_else(|| {
            anyhow::anyhow!(
                "No Chrome/Chromium executable found. Install one or set CHROME_EXECUTABLE."
            )
        })?;
    info!("Using browser executable: {}", chrome);
    let pool = Arc::new(BrowserPool::new(
        ChromeWorkerFactory::new(chrome, config.headless),
        config.pool_size,
        config.pool_acquire_timeout,
    ));
    // One warm worker keeps first-request latency down; the rest launch lazily.
    pool.warm_up(1).await;

    let state = Arc::new(AppState::new(
        Arc::clone(&config),
        http_client,
        Arc::clone(&pool),
    ));

    // Background loops: proactive refresh and pending-2FA reaping.
    scheduler::spawn_proactive_refresh(
        Arc::clone(&state.orchestrator),
        config.proactive_interval,
        config.refresh_buffer,
    );
    pending::spawn_reaper(
        Arc::clone(&state.pending),
        Arc::clone(&state.automator),
        config.pending_session_ttl,
        std::time::Duration::from_secs(60),
    );

    // Build router
    let app = Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/tokens/refresh", post(refresh_all))
        .route("/tokens/{provider}", get(get_token))
        .route("/tokens/{provider}/2fa", post(submit_2fa))
        .route("/tokens/{provider}/2fa/status", get(twofa_status))
        .route("/api/v1/check", post(check_payment))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    // Start server
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Address already in use: {}. Stop the existing process or set TOKEN_SERVICE_PORT.",
                bind_addr
            )
        }
        Err(e) => return Err(e.into()),
    };
    info!("portal-sentry listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    Ok(())
}

async fn shutdown_signal(state: Arc<AppState>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).ok();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(ref mut s) = sigterm {
                    s.recv().await;
                } else {
                    futures::future::pending::<()>().await;
                }
            } => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutting down, draining browser pool");
    state.pool.shutdown().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Auth guard
// ─────────────────────────────────────────────────────────────────────────────

fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let expected = format!("Bearer {}", state.config.service_secret);
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false)
}

fn unauthorized() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": "Unauthorized" })),
    )
}

fn parse_provider(raw: &str) -> Result<Provider, (StatusCode, Json<serde_json::Value>)> {
    Provider::parse(raw).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("Unknown provider: {}", raw) })),
        )
    })
}

fn token_response(result: RefreshResult) -> (StatusCode, Json<TokenBody>) {
    match result {
        RefreshResult::Token {
            token,
            expires_at,
            cached,
        } => (
            StatusCode::OK,
            Json(TokenBody::Token {
                success: true,
                token,
                expires_at,
                cached,
            }),
        ),
        RefreshResult::Requires2fa { session_id } => (
            StatusCode::OK,
            Json(TokenBody::Requires2fa {
                requires_2fa: true,
                session_id,
                message: "2FA verification required. Submit code via /tokens/{provider}/2fa"
                    .to_string(),
            }),
        ),
        RefreshResult::Failed { message, .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(TokenBody::Error { error: message }),
        ),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// `GET /health` — no auth; used by uptime checks.
async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let mut tokens: HashMap<&'static str, ProviderHealth> = HashMap::new();
    for &provider in Provider::ALL {
        let cred = state.store.get(provider);
        tokens.insert(
            provider.as_str(),
            ProviderHealth {
                has_token: cred.token.is_some(),
                expires_in_minutes: cred.expires_in_minutes(),
                last_refresh: cred.last_refresh,
                last_error: cred.last_error,
                retry_count: cred.retry_count,
                has_storage_state: storage_state::exists(&state.config.state_dir, provider),
            },
        );
    }

    Json(serde_json::json!({
        "status": "healthy",
        "service": "portal-sentry",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": (chrono::Utc::now() - state.started_at).num_seconds(),
        "tokens": tokens,
        "pending_2fa_sessions": state.pending.count().await,
        "browser_pool": {
            "capacity": state.pool.capacity(),
            "available": state.pool.available(),
        },
    }))
}

/// `GET /tokens/{provider}` — cached token, refreshing on miss.
async fn get_token(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<TokenBody>), (StatusCode, Json<serde_json::Value>)> {
    if !authorized(&state, &headers) {
        return Err(unauthorized());
    }
    let provider = parse_provider(&provider)?;
    Ok(token_response(state.orchestrator.get_token(provider).await))
}

/// `POST /tokens/refresh` — force refresh of every provider.
async fn refresh_all(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    if !authorized(&state, &headers) {
        return Err(unauthorized());
    }
    let mut out = serde_json::Map::new();
    for (provider, result) in state.orchestrator.refresh_all().await {
        let body = match result {
            RefreshResult::Token {
                expires_at, cached, ..
            } => serde_json::json!({
                "success": true,
                "expiresAt": expires_at,
                "cached": cached,
            }),
            RefreshResult::Requires2fa { session_id } => serde_json::json!({
                "requires_2fa": true,
                "session_id": session_id,
            }),
            RefreshResult::Failed { code, message } => serde_json::json!({
                "success": false,
                "error_code": code,
                "error": message,
            }),
        };
        out.insert(provider.as_str().to_string(), body);
    }
    Ok(Json(serde_json::Value::Object(out)))
}

/// `POST /tokens/{provider}/2fa` — resume a suspended login with a code.
async fn submit_2fa(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Result<Json<TwoFaSubmitRequest>, axum::extract::rejection::JsonRejection>,
) -> Result<(StatusCode, Json<serde_json::Value>), (StatusCode, Json<serde_json::Value>)> {
    if !authorized(&state, &headers) {
        return Err(unauthorized());
    }
    let provider = parse_provider(&provider)?;
    let Json(req) = body.map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": format!("Invalid request body: {}", e) })),
        )
    })?;

    let code = req.code.trim();
    if code.is_empty() {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "code is required" })),
        ));
    }

    match state
        .orchestrator
        .resume_2fa(provider, req.session_id, code)
        .await
    {
        RefreshResult::Token {
            token,
            expires_at,
            cached,
        } => Ok((
            StatusCode::OK,
            Json(serde_json::json!({
                "success": true,
                "token": token,
                "expiresAt": expires_at,
                "cached": cached,
            })),
        )),
        RefreshResult::Requires2fa { session_id } => Ok((
            // Resume never suspends again; treat defensively as still-pending.
            StatusCode::OK,
            Json(serde_json::json!({
                "requires_2fa": true,
                "session_id": session_id,
            })),
        )),
        RefreshResult::Failed { code, message } => {
            let status = match code {
                portal_sentry::types::ErrorCode::NotFound => StatusCode::NOT_FOUND,
                _ => StatusCode::BAD_REQUEST,
            };
            Ok((status, Json(serde_json::json!({ "error": message }))))
        }
    }
}

/// `GET /tokens/{provider}/2fa/status` — outstanding session ids.
async fn twofa_status(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    if !authorized(&state, &headers) {
        return Err(unauthorized());
    }
    let provider = parse_provider(&provider)?;
    let ids = state.pending.ids_for(provider).await;
    Ok(Json(serde_json::json!({
        "provider": provider.as_str(),
        "pending_sessions": ids,
    })))
}

/// `POST /api/v1/check` — MyCoverageInfo payment-status lookup.
async fn check_payment(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<PaymentCheckRequest>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<portal_sentry::types::PaymentCheckResponse>, (StatusCode, Json<serde_json::Value>)>
{
    if !authorized(&state, &headers) {
        return Err(unauthorized());
    }
    let Json(req) = body.map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": format!("Invalid request body: {}", e) })),
        )
    })?;
    if req.loan_number.trim().is_empty() || req.zip_code.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "loan_number and zip_code are required" })),
        ));
    }

    let response = state.checker.check(&req).await;
    if !response.success {
        warn!(
            "payment check failed: {:?} {:?}",
            response.error_code, response.error_message
        );
    }
    Ok(Json(response))
}
