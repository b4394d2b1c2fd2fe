use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::config::DbSettings;

pub async fn make_pool(database_url: &str, settings: &DbSettings) -> anyhow::Result<PgPool> {
    let disable_jit = settings.disable_jit;

    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .acquire_timeout(settings.acquire_timeout)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                if disable_jit {
                    sqlx::query("SET jit = OFF").execute(&mut *conn).await?;
                }
                Ok(())
            })
        })
        .connect(database_url)
        .await?;

    tracing::debug!(
        max_connections = settings.max_connections,
        acquire_timeout_secs = settings.acquire_timeout.as_secs(),
        disable_jit,
        "database pool ready"
    );
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("migrations applied");
    Ok(())
}

/// Start of the processing horizon: `now - days`.
pub fn cutoff_days(days: i64) -> DateTime<Utc> {
    Utc::now() - ChronoDuration::days(days)
}
