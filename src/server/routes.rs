use std::sync::Arc;

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::admin::AdminOps;
use crate::aiban::AiBanPipeline;
use crate::analytics::Analytics;
use crate::cache::CacheManager;
use crate::config::Config;
use crate::db::{GatewayDb, LocalStore};
use crate::geoip::GeoIpService;
use crate::model_status::ModelStatusEngine;
use crate::redemption::RedemptionService;
use crate::tasks::TaskManager;
use crate::warmup::WarmupOrchestrator;

use super::auth;
use super::handlers::{admin, aiban, dashboard, ip, model_status, risk, status_page, system};

/// State shared across all routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Arc<GatewayDb>,
    pub local: LocalStore,
    pub cache: Arc<CacheManager>,
    pub geoip: Arc<GeoIpService>,
    pub analytics: Arc<Analytics>,
    pub model_status: Arc<ModelStatusEngine>,
    pub aiban: Arc<AiBanPipeline>,
    pub admin: Arc<AdminOps>,
    pub redemptions: Arc<RedemptionService>,
    pub tasks: TaskManager,
    pub warmup: Arc<WarmupOrchestrator>,
}

/// Read-only model-status routes mirrored under the public embed
/// prefixes.
fn embed_routes() -> Router<AppState> {
    Router::new()
        .route("/time-windows", get(model_status::time_windows))
        .route("/models", get(model_status::models))
        .route("/status/all", get(model_status::status_all))
        .route("/status/{model_name}", get(model_status::status_single))
}

pub fn build(state: AppState) -> Router {
    Router::new()
        // Health (skip-listed in auth middleware)
        .route("/api/health", get(system::health))
        .route("/api/health/db", get(system::health_db))
        // Auth
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/logout", post(auth::logout))
        // Dashboard
        .route("/api/dashboard/overview", get(dashboard::overview))
        .route("/api/dashboard/usage", get(dashboard::usage))
        .route("/api/dashboard/models", get(dashboard::models))
        .route("/api/dashboard/trends/daily", get(dashboard::trends_daily))
        .route("/api/dashboard/trends/hourly", get(dashboard::trends_hourly))
        .route("/api/dashboard/top-users", get(dashboard::top_users))
        .route("/api/dashboard/channels", get(dashboard::channels))
        .route("/api/dashboard/ip-distribution", get(dashboard::ip_distribution))
        .route("/api/dashboard/cache/invalidate", post(dashboard::cache_invalidate))
        // Risk control
        .route("/api/risk/leaderboards", get(risk::leaderboards))
        .route("/api/risk/users/{user_id}/analysis", get(risk::user_analysis))
        .route("/api/risk/ban-records", get(risk::ban_records))
        .route("/api/risk/token-rotation", get(risk::token_rotation))
        .route("/api/risk/affiliated-accounts", get(risk::affiliated_accounts))
        .route("/api/risk/same-ip-registrations", get(risk::same_ip_registrations))
        // IP monitoring
        .route("/api/ip/stats", get(ip::stats))
        .route("/api/ip/shared", get(ip::shared))
        .route("/api/ip/multi-ip-tokens", get(ip::multi_ip_tokens))
        .route("/api/ip/multi-ip-users", get(ip::multi_ip_users))
        .route("/api/ip/lookup/{ip}", get(ip::lookup))
        .route("/api/ip/users/{user_id}/ips", get(ip::user_ips))
        .route("/api/ip/geo/batch", post(ip::geo_batch))
        .route("/api/ip/geo/{ip}", get(ip::geo))
        .route("/api/ip/enable-all-recording", post(ip::enable_all_recording))
        // Model status
        .route("/api/model-status/time-windows", get(model_status::time_windows))
        .route("/api/model-status/models", get(model_status::models))
        .route("/api/model-status/status/multiple", post(model_status::status_multiple))
        .route("/api/model-status/status/all", get(model_status::status_all))
        .route("/api/model-status/status/{model_name}", get(model_status::status_single))
        .route(
            "/api/model-status/config/{key}",
            get(model_status::get_config).post(model_status::set_config),
        )
        // Public embed mirrors (skip-listed in auth middleware)
        .nest("/api/embed/model-status", embed_routes())
        .nest("/api/model-status/embed", embed_routes())
        // AI ban
        .route("/api/ai-ban/config", get(aiban::get_config).post(aiban::set_config))
        .route("/api/ai-ban/reset-api-health", post(aiban::reset_api_health))
        .route(
            "/api/ai-ban/audit-logs",
            get(aiban::audit_logs).delete(aiban::clear_audit_logs),
        )
        .route("/api/ai-ban/suspicious", get(aiban::suspicious))
        .route("/api/ai-ban/assess", post(aiban::assess))
        .route("/api/ai-ban/scan", post(aiban::scan))
        .route("/api/ai-ban/test-connection", post(aiban::test_connection))
        .route("/api/ai-ban/models", post(aiban::list_models))
        .route("/api/ai-ban/test-model", post(aiban::test_model))
        .route("/api/ai-ban/whitelist", get(aiban::whitelist).post(aiban::whitelist_add))
        .route("/api/ai-ban/whitelist/{user_id}", delete(aiban::whitelist_remove))
        // System
        .route("/api/system/scale", get(system::scale))
        .route("/api/system/scale/refresh", post(system::scale_refresh))
        .route("/api/system/warmup-status", get(system::warmup_status))
        .route("/api/system/indexes", get(system::indexes))
        .route("/api/system/indexes/ensure", post(system::indexes_ensure))
        .route("/api/system/tasks", get(system::tasks))
        .route("/api/system/cache/stats", get(system::cache_stats))
        // Gateway entity administration
        .route("/api/users", get(admin::list_users))
        .route("/api/users/{user_id}/ban", post(admin::ban_user))
        .route("/api/users/{user_id}/unban", post(admin::unban_user))
        .route("/api/tokens", get(admin::list_tokens))
        .route("/api/tokens/{id}", delete(admin::delete_token))
        .route("/api/top-ups", get(admin::list_topups))
        .route("/api/top-ups/statistics", get(admin::topup_stats))
        .route("/api/top-ups/{id}/refund", post(admin::refund_topup))
        .route("/api/redemptions", get(admin::list_redemptions))
        .route("/api/redemptions/generate", post(admin::generate_redemptions))
        .route("/api/redemptions/{id}", delete(admin::delete_redemption))
        // Uptime-kuma-compatible status page
        .route("/api/status-page/heartbeat/{slug}", get(status_page::heartbeat))
        .route("/api/status-page/{slug}", get(status_page::status_page))
        .route("/api/status-page/{slug}/badge", get(status_page::badge))
        .route("/api/status-page/{slug}/summary", get(status_page::summary))
        // Auth middleware (skip-list lives in auth::require_auth)
        .layer(middleware::from_fn_with_state(state.clone(), auth::require_auth))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
