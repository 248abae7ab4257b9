mod admin;
mod aiban;
mod analytics;
mod cache;
mod config;
mod db;
mod error;
mod geoip;
mod model_status;
mod redemption;
mod server;
mod tasks;
mod warmup;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info};

use crate::admin::AdminOps;
use crate::aiban::AiBanPipeline;
use crate::analytics::Analytics;
use crate::cache::CacheManager;
use crate::config::Config;
use crate::db::{GatewayDb, LocalStore};
use crate::geoip::GeoIpService;
use crate::model_status::ModelStatusEngine;
use crate::redemption::RedemptionService;
use crate::tasks::{handler, TaskManager};
use crate::warmup::WarmupOrchestrator;

#[tokio::main]
async fn main() {
    // Load .env (if present) before anything reads env vars.
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    info!(
        bind = %config.bind_addr,
        engine = config.gateway_db.engine.as_str(),
        timezone = %config.timezone,
        "gateway-sentinel starting"
    );

    let local = match LocalStore::open(&config.local_db_path) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to open local store: {e}");
            std::process::exit(1);
        }
    };

    let gateway_db = match GatewayDb::connect(&config.gateway_db).await {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!("failed to connect to the gateway database: {e}");
            std::process::exit(1);
        }
    };

    let cache = Arc::new(CacheManager::new(local.clone(), config.redis.url.as_deref()).await);
    let geoip = Arc::new(GeoIpService::new(&config.geoip));

    let analytics = Arc::new(Analytics::new(
        gateway_db.clone(),
        cache.clone(),
        geoip.clone(),
        local.clone(),
        config.timezone,
    ));
    let model_status = Arc::new(ModelStatusEngine::new(gateway_db.clone(), cache.clone()));
    let aiban = match AiBanPipeline::new(analytics.clone(), gateway_db.clone(), local.clone()).await
    {
        Ok(p) => Arc::new(p),
        Err(e) => {
            error!("failed to initialize the ban pipeline: {e}");
            std::process::exit(1);
        }
    };
    let admin = Arc::new(AdminOps::new(gateway_db.clone()));
    let redemptions = Arc::new(RedemptionService::new(gateway_db.clone()));

    // Shutdown signal shared by the HTTP server and every task loop.
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let task_manager = TaskManager::new(shutdown_tx.clone());

    let warmup = Arc::new(WarmupOrchestrator::new(
        analytics.clone(),
        cache.clone(),
        model_status.clone(),
        task_manager.clone(),
    ));

    register_tasks(
        task_manager.clone(),
        config.clone(),
        gateway_db.clone(),
        cache.clone(),
        geoip.clone(),
        analytics.clone(),
        model_status.clone(),
        aiban.clone(),
        warmup.clone(),
    );

    let state = server::AppState {
        config: config.clone(),
        db: gateway_db,
        local,
        cache,
        geoip,
        analytics,
        model_status,
        aiban,
        admin,
        redemptions,
        tasks: task_manager,
        warmup,
    };

    let server_handle = {
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = server::serve(state, shutdown_rx).await {
                error!("server error: {e}");
                std::process::exit(1);
            }
        })
    };

    info!("gateway-sentinel is running — press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");

    info!("shutdown signal received, stopping...");
    let _ = shutdown_tx.send(());
    let _ = server_handle.await;
    info!("gateway-sentinel stopped");
}

#[allow(clippy::too_many_arguments)]
fn register_tasks(
    tasks: TaskManager,
    config: Arc<Config>,
    db: Arc<GatewayDb>,
    cache: Arc<CacheManager>,
    geoip: Arc<GeoIpService>,
    analytics: Arc<Analytics>,
    model_status: Arc<ModelStatusEngine>,
    aiban: Arc<AiBanPipeline>,
    warmup: Arc<WarmupOrchestrator>,
) {
    // Immediate tasks.
    {
        let warmup = warmup.clone();
        tasks.register(
            "cache_warmup",
            Duration::from_secs(24 * 3600),
            handler(move || {
                let warmup = warmup.clone();
                async move { warmup.run().await }
            }),
        );
    }
    {
        let db = db.clone();
        tasks.register(
            "index_ensure",
            Duration::from_secs(24 * 3600),
            handler(move || {
                let db = db.clone();
                async move {
                    db.ensure_indexes(Duration::from_secs(2)).await?;
                    Ok(())
                }
            }),
        );
    }
    {
        let db = db.clone();
        tasks.register(
            "ip_recording_enforce",
            Duration::from_secs(30 * 60),
            handler(move || {
                let db = db.clone();
                async move {
                    let updated = db.enable_ip_recording_all().await?;
                    if updated > 0 {
                        info!(updated, "re-enabled IP recording");
                    }
                    Ok(())
                }
            }),
        );
    }
    {
        let geoip = geoip.clone();
        tasks.register(
            "geoip_update",
            Duration::from_secs(24 * 3600),
            handler(move || {
                let geoip = geoip.clone();
                async move { geoip.update_databases().await }
            }),
        );
    }
    {
        let cache = cache.clone();
        tasks.register(
            "cache_cleanup",
            Duration::from_secs(3600),
            handler(move || {
                let cache = cache.clone();
                async move {
                    cache.cleanup_expired().await?;
                    Ok(())
                }
            }),
        );
    }

    // Tasks gated on warmup completion.
    {
        let warmup = warmup.clone();
        tasks.start_after_warmup(
            "cache_refresh",
            Duration::from_secs(5 * 60),
            handler(move || {
                let warmup = warmup.clone();
                async move { warmup.refresh_hot_set().await }
            }),
        );
    }
    {
        let analytics = analytics.clone();
        tasks.start_after_warmup(
            "log_sync",
            Duration::from_secs(5 * 60),
            handler(move || {
                let analytics = analytics.clone();
                async move { analytics.sync_log_watermark().await }
            }),
        );
    }
    {
        let aiban = aiban.clone();
        tasks.start_after_warmup(
            "ai_ban_scan",
            Duration::from_secs(config.ai_ban_scan_interval_secs.max(60)),
            handler(move || {
                let aiban = aiban.clone();
                async move { aiban.run_periodic_scan().await }
            }),
        );
    }
    {
        let model_status = model_status.clone();
        tasks.start_after_warmup(
            "model_status_refresh",
            Duration::from_secs(30 * 60),
            handler(move || {
                let model_status = model_status.clone();
                async move {
                    model_status.available_models(true).await?;
                    Ok(())
                }
            }),
        );
    }
}

fn print_usage() {
    println!(
        "gateway-sentinel — administrative side-car for a NewAPI-compatible LLM gateway

USAGE:
    gateway-sentinel

ENVIRONMENT:
    DB_ENGINE                 \"postgres\" (default) or \"mysql\"
    SQL_DSN                   Full connection string; overrides DB_* parts
    DB_DNS, DB_PORT           Gateway DB host and port
    DB_USER, DB_PASSWORD      Gateway DB credentials
    DB_NAME                   Gateway DB name (default: new-api)
    REDIS_HOST, REDIS_PORT    Optional Redis cache tier
    REDIS_PASSWORD, REDIS_DB  Redis credentials / database index
    ADMIN_PASSWORD            Required. Dashboard login password.
    JWT_SECRET                Required. Secret for signing admin JWTs.
    API_KEY                   Optional. Static X-API-Key credential.
    JWT_EXPIRE_HOURS          JWT lifetime (default: 24)
    BIND_ADDR                 Listen address (default: 0.0.0.0:8788)
    TIMEZONE                  IANA zone for trend bucketing (default: UTC)
    GEOIP_DB_PATH             MMDB directory (default: ./data/geoip)
    LOCAL_DB_PATH             Side-car SQLite path (default: ./data/local.db)
    AI_BAN_SCAN_INTERVAL_SECS Ban-scan cadence (default: 600)
    RUST_LOG                  Tracing filter (default: info)
"
    );
}
