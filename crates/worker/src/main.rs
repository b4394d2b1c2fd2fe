use enrichflow::api;
use enrichflow::config;
use enrichflow::db;
use enrichflow::enrich::{Enrichers, LlmClient, SettingsRepo};
use enrichflow::lock::PgAdvisoryLock;
use enrichflow::scheduler::Scheduler;
use enrichflow::telemetry;

use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::from_env()?;
    telemetry::init_logging();

    let api_addr = cfg.admin_addr.clone();
    let auth = if cfg.api_token.is_some() { "enabled" } else { "disabled" };
    let llm_key = if cfg.llm.api_key.is_some() { "set" } else { "missing" };

    tracing::info!(
        instance_id = %cfg.instance_id,
        api = %api_addr.clone().unwrap_or_else(|| "disabled".to_string()),
        auth,
        migrate_on_startup = cfg.migrate_on_startup,
        llm_base_url = %cfg.llm.base_url,
        llm_model = %cfg.llm.model,
        llm_key,
        horizon_days = cfg.processing_horizon_days,
        "enrichflow starting"
    );

    let pool = db::make_pool(&cfg.database_url, &cfg.db).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let llm = LlmClient::new(&cfg.llm);
    let enrichers = Enrichers::new(pool.clone(), llm, &cfg);
    let scheduler = Scheduler::new(
        Arc::new(PgAdvisoryLock::new(pool.clone())),
        enrichers.task_specs(&cfg),
    );
    scheduler.initialize()?;

    // ---- API task ----
    let api_state = api::ApiState {
        scheduler: scheduler.clone(),
        settings: SettingsRepo::new(pool.clone()),
        api_token: cfg.api_token.clone(),
    };
    let app = api::router(api_state);

    let api_handle = tokio::spawn(async move {
        if let Some(addr) = api_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!("admin api listening on http://{addr}");
            axum::serve(listener, app).await?;
        } else {
            std::future::pending::<()>().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    tokio::select! {
        res = api_handle => res??,
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("shutdown requested");
        }
    }

    scheduler.shutdown();
    pool.close().await;
    Ok(())
}
