//! HTTP server implementation using Axum.

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use subtle::ConstantTimeEq;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use spedire_automations::{AutomationAdmin, Dispatcher};
use spedire_core::config::GatewayConfig;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub gateway_config: GatewayConfig,
    pub admin: Arc<AutomationAdmin>,
    pub dispatcher: Arc<Dispatcher>,
    /// Used by the cron endpoint when no `?tolerance=` is given.
    pub tolerance_minutes: u32,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        gateway_config: GatewayConfig,
        admin: Arc<AutomationAdmin>,
        tolerance_minutes: u32,
    ) -> Self {
        Self {
            gateway_config,
            dispatcher: admin.dispatcher().clone(),
            admin,
            tolerance_minutes,
            start_time: std::time::Instant::now(),
        }
    }
}

/// Compare a presented secret without short-circuiting on the first
/// differing byte. Only the length can leak.
pub(crate) fn secret_matches(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

pub(crate) fn json_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        axum::Json(serde_json::json!({"ok": false, "error": message})),
    )
        .into_response()
}

/// Admin token middleware: validates the `X-Admin-Token` header.
async fn require_admin_token(
    State(state): State<Arc<AppState>>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let expected = &state.gateway_config.admin_token;
    // No token configured: the admin API sits behind platform auth
    if expected.is_empty() {
        return next.run(req).await;
    }

    let provided = req
        .headers()
        .get("X-Admin-Token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if secret_matches(provided, expected) {
        return next.run(req).await;
    }

    tracing::warn!("🔒 Rejected admin request to {}", req.uri().path());
    json_error(
        StatusCode::UNAUTHORIZED,
        "Unauthorized: invalid or missing admin token",
    )
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    build_router_from_arc(Arc::new(state))
}

pub fn build_router_from_arc(shared: Arc<AppState>) -> Router {
    // Admin API, guarded by the admin token
    let protected = Router::new()
        .route(
            "/api/v1/automations",
            get(super::routes::list_automations).post(super::routes::create_automation),
        )
        .route(
            "/api/v1/automations/{slug}/toggle",
            post(super::routes::toggle_automation),
        )
        .route(
            "/api/v1/automations/{slug}/config",
            put(super::routes::update_automation_config),
        )
        .route(
            "/api/v1/automations/{slug}/run",
            post(super::routes::run_automation),
        )
        .route(
            "/api/v1/automations/{slug}/runs",
            get(super::routes::list_automation_runs),
        )
        .route("/api/v1/lock/stats", get(super::routes::lock_stats))
        .route("/api/v1/info", get(super::routes::system_info))
        .route_layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_admin_token,
        ));

    // Public routes; the cron endpoint checks its own bearer secret
    let public = Router::new()
        .route("/health", get(super::routes::health_check))
        .route(
            "/api/cron/automation-dispatcher",
            get(super::routes::cron_dispatch).post(super::routes::cron_dispatch),
        );

    protected
        .merge(public)
        .layer({
            let cors = CorsLayer::new()
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::OPTIONS,
                ])
                .allow_headers(Any)
                .max_age(std::time::Duration::from_secs(3600));

            // Example: SPEDIRE_CORS_ORIGINS=https://admin.example.com
            if let Ok(origins_str) = std::env::var("SPEDIRE_CORS_ORIGINS") {
                let origins: Vec<_> = origins_str
                    .split(',')
                    .filter_map(|s| s.trim().parse::<HeaderValue>().ok())
                    .collect();
                cors.allow_origin(origins)
            } else {
                cors.allow_origin(Any)
            }
        })
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Start the HTTP server and serve until the process exits.
pub async fn start(state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.gateway_config.host, state.gateway_config.port);

    if state.gateway_config.cron_secret.is_empty() {
        tracing::warn!("⚠️ cron_secret is not set: /api/cron/automation-dispatcher will answer 503");
    }
    if state.gateway_config.admin_token.is_empty() {
        tracing::warn!("⚠️ admin_token is not set: the admin API is unauthenticated");
    }

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🌐 Gateway listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use spedire_automations::{
        AutomationDb, AutomationLock, HandlerRegistry, HandlerResult, MemoryLockStore,
    };
    use spedire_core::config::LockConfig;
    use tower::ServiceExt;

    fn state(admin_token: &str) -> AppState {
        let db = Arc::new(AutomationDb::open_in_memory().unwrap());
        let lock = Arc::new(AutomationLock::new(
            Some(Arc::new(MemoryLockStore::new())),
            &LockConfig::default(),
        ));
        let mut registry = HandlerRegistry::new();
        registry.register_fn("low-balance-alert", |_, _| async { Ok(HandlerResult::ok(1)) });
        let dispatcher = Arc::new(Dispatcher::new(db.clone(), db.clone(), lock, Arc::new(registry)));
        let admin = Arc::new(AutomationAdmin::new(db.clone(), db, dispatcher));
        let gateway_config = GatewayConfig {
            admin_token: admin_token.into(),
            cron_secret: "cron-s3cret".into(),
            ..Default::default()
        };
        AppState::new(gateway_config, admin, 5)
    }

    async fn status_of(app: Router, req: Request<Body>) -> StatusCode {
        app.oneshot(req).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_admin_token_required_when_configured() {
        let app = build_router(state("admin-123"));

        let missing = Request::get("/api/v1/automations").body(Body::empty()).unwrap();
        assert_eq!(status_of(app.clone(), missing).await, StatusCode::UNAUTHORIZED);

        let wrong = Request::get("/api/v1/automations")
            .header("X-Admin-Token", "nope")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(app.clone(), wrong).await, StatusCode::UNAUTHORIZED);

        let ok = Request::get("/api/v1/automations")
            .header("X-Admin-Token", "admin-123")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(app, ok).await, StatusCode::OK);
    }

    #[test]
    fn test_secret_matches() {
        assert!(secret_matches("admin-123", "admin-123"));
        assert!(!secret_matches("admin-124", "admin-123"));
        assert!(!secret_matches("admin-12", "admin-123"));
        assert!(!secret_matches("", "admin-123"));
    }

    #[tokio::test]
    async fn test_admin_open_without_token() {
        let app = build_router(state(""));
        let req = Request::get("/api/v1/lock/stats").body(Body::empty()).unwrap();
        assert_eq!(status_of(app, req).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let app = build_router(state("admin-123"));
        let req = Request::get("/health").body(Body::empty()).unwrap();
        assert_eq!(status_of(app, req).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cron_endpoint_ignores_admin_token() {
        let app = build_router(state("admin-123"));
        let req = Request::post("/api/cron/automation-dispatcher")
            .header("Authorization", "Bearer cron-s3cret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_of(app, req).await, StatusCode::OK);
    }
}
