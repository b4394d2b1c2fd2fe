use anyhow::Context;
use enrichflow::config::Config;
use enrichflow::enrich::{EnrichmentKind, EnrichmentRepo, Enrichers, LlmClient};
use enrichflow::lock::PgAdvisoryLock;
use enrichflow::scheduler::{RunOutcome, Scheduler};
use enrichflow::{db, telemetry};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::env;
use std::sync::Arc;

const USAGE: &str = "enrichctl <command>\n\
     Commands:\n\
     - reset                   clear all enrichment records\n\
     - seed <n>                insert n demo conversations\n\
     - progress                per-task progress\n\
     - run <task> [limit]      one locked batch (needs the full worker env)\n\
     \n\
     Uses DATABASE_URL or TEST_DATABASE_URL.\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("{USAGE}");
        std::process::exit(2);
    }

    let _ = dotenvy::dotenv();
    telemetry::init_logging();

    let url = env::var("DATABASE_URL")
        .or_else(|_| env::var("TEST_DATABASE_URL"))
        .context("DATABASE_URL or TEST_DATABASE_URL must be set")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await?;
    db::run_migrations(&pool).await?;

    match args[1].as_str() {
        "reset" => reset(&pool).await?,
        "seed" => {
            let n: i64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(10);
            seed(&pool, n).await?;
        }
        "progress" => show_progress(&pool).await?,
        "run" => {
            let task: EnrichmentKind = args
                .get(2)
                .context("usage: enrichctl run <task> [limit]")?
                .parse()?;
            let limit: i64 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(10);
            run_once(pool, task, limit).await?;
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

async fn reset(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        TRUNCATE TABLE
            conversation_translations,
            conversation_classifications,
            conversation_language_detections
        RESTART IDENTITY
        "#,
    )
    .execute(pool)
    .await?;

    println!("reset OK");
    Ok(())
}

async fn seed(pool: &PgPool, n: i64) -> anyhow::Result<()> {
    let samples: [(Option<&str>, Option<&str>); 4] = [
        (
            Some("How do I track my order?"),
            Some("You can track it from the Orders page."),
        ),
        (Some("如何重置密码？"), Some("请在设置页面点击“忘记密码”。")),
        (
            Some("Das Gerät startet nicht mehr."),
            Some("Bitte halten Sie den Netzschalter 10 Sekunden gedrückt."),
        ),
        (None, Some("Hello! How can I help you today?")),
    ];

    let start: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) + 1 FROM conversations")
        .fetch_one(pool)
        .await?;

    for i in 0..n {
        let id = start + i;
        let (query, response) = samples[(i as usize) % samples.len()];
        sqlx::query(
            r#"
            INSERT INTO conversations (id, created_time, session_id, user_id, query, response)
            VALUES ($1, now() - ($2 * interval '1 second'), $3, 'demo-user', $4, $5)
            "#,
        )
        .bind(id)
        .bind(i as f64)
        .bind(format!("demo-session-{}", i / 3))
        .bind(query)
        .bind(response)
        .execute(pool)
        .await?;

        println!("+ inserted conversation id={id}");
    }
    Ok(())
}

async fn show_progress(pool: &PgPool) -> anyhow::Result<()> {
    let horizon_days = env::var("PROCESSING_HORIZON_DAYS")
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(30);

    for kind in EnrichmentKind::ALL {
        let p = EnrichmentRepo::new(pool.clone(), kind, horizon_days)
            .progress()
            .await?;
        println!(
            "{kind}: total={} completed={} failed={} pending={} ({})",
            p.total,
            p.completed,
            p.failed,
            p.pending,
            p.completion_rate()
        );
    }
    Ok(())
}

async fn run_once(pool: PgPool, task: EnrichmentKind, limit: i64) -> anyhow::Result<()> {
    let cfg = Config::from_env()?;
    let enrichers = Enrichers::new(pool.clone(), LlmClient::new(&cfg.llm), &cfg);

    // Only the manual run; no triggers in a one-shot process.
    let mut specs = enrichers.task_specs(&cfg);
    for spec in &mut specs {
        spec.auto_start = false;
    }
    let scheduler = Scheduler::new(Arc::new(PgAdvisoryLock::new(pool)), specs);

    match scheduler.run_now(task, limit.clamp(1, 1000)).await? {
        RunOutcome::Completed(stats) => println!(
            "{task}: success={} skipped={} failed={} remaining={}",
            stats.success, stats.skipped, stats.failed, stats.remaining
        ),
        RunOutcome::Failed(msg) => anyhow::bail!("{task} batch failed: {msg}"),
        RunOutcome::Skipped => println!("{task}: skipped, already running elsewhere"),
    }
    Ok(())
}
