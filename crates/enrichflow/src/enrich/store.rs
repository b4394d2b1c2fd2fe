use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{EnrichmentKind, EnrichmentStatus, PendingConversation};
use crate::batch::ProgressStats;
use crate::db::cutoff_days;

/// Reads and writes one kind's result table, joined against `conversations`.
///
/// Only conversations created within the last `horizon_days` are considered.
/// A conversation is pending while it has no `completed` row; `failed` rows
/// are picked up again on every pull.
#[derive(Clone)]
pub struct EnrichmentRepo {
    pool: PgPool,
    kind: EnrichmentKind,
    horizon_days: i64,
}

impl EnrichmentRepo {
    pub fn new(pool: PgPool, kind: EnrichmentKind, horizon_days: i64) -> Self {
        Self {
            pool,
            kind,
            horizon_days: horizon_days.max(1),
        }
    }

    pub fn kind(&self) -> EnrichmentKind {
        self.kind
    }

    fn cutoff(&self) -> DateTime<Utc> {
        cutoff_days(self.horizon_days)
    }

    /// Newest first.
    pub async fn fetch_pending(&self, limit: i64) -> anyhow::Result<Vec<PendingConversation>> {
        let sql = format!(
            r#"
            SELECT c.id, c.query, c.response
            FROM conversations c
            LEFT JOIN {table} e
              ON e.conversation_id = c.id
             AND e.status = 'completed'
            WHERE c.created_time >= $1
              AND e.id IS NULL
            ORDER BY c.created_time DESC, c.id DESC
            LIMIT $2
            "#,
            table = self.kind.table()
        );

        let rows = sqlx::query_as::<_, PendingConversation>(&sql)
            .bind(self.cutoff())
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn progress(&self) -> anyhow::Result<ProgressStats> {
        let sql = format!(
            r#"
            SELECT
              COUNT(*)                                        AS total,
              COUNT(*) FILTER (WHERE e.status = 'completed')  AS completed,
              COUNT(*) FILTER (WHERE e.status = 'failed')     AS failed
            FROM conversations c
            LEFT JOIN {table} e ON e.conversation_id = c.id
            WHERE c.created_time >= $1
            "#,
            table = self.kind.table()
        );

        let (total, completed, failed): (i64, i64, i64) = sqlx::query_as(&sql)
            .bind(self.cutoff())
            .fetch_one(&self.pool)
            .await?;

        Ok(ProgressStats::from_counts(total, completed, failed))
    }

    /// Everything in the horizon that is not completed yet (failed included).
    pub async fn remaining(&self) -> anyhow::Result<i64> {
        let p = self.progress().await?;
        Ok(p.total - p.completed)
    }

    pub async fn mark_failed(&self, conversation_id: i64) -> anyhow::Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {table} (conversation_id, status, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (conversation_id)
            DO UPDATE SET status = EXCLUDED.status, updated_at = now()
            "#,
            table = self.kind.table()
        );

        sqlx::query(&sql)
            .bind(conversation_id)
            .bind(EnrichmentStatus::Failed.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn save_translation(
        &self,
        conversation_id: i64,
        query_zh: Option<&str>,
        response_zh: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conversation_translations
                (conversation_id, query_zh, response_zh, status, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (conversation_id)
            DO UPDATE SET
                query_zh = EXCLUDED.query_zh,
                response_zh = EXCLUDED.response_zh,
                status = EXCLUDED.status,
                updated_at = now()
            "#,
        )
        .bind(conversation_id)
        .bind(query_zh)
        .bind(response_zh)
        .bind(EnrichmentStatus::Completed.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn save_classification(
        &self,
        conversation_id: i64,
        category: &str,
        confidence: f64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conversation_classifications
                (conversation_id, category, confidence, status, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (conversation_id)
            DO UPDATE SET
                category = EXCLUDED.category,
                confidence = EXCLUDED.confidence,
                status = EXCLUDED.status,
                updated_at = now()
            "#,
        )
        .bind(conversation_id)
        .bind(category)
        .bind(confidence)
        .bind(EnrichmentStatus::Completed.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn save_language(
        &self,
        conversation_id: i64,
        language: &str,
        confidence: f64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conversation_language_detections
                (conversation_id, language, confidence, status, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (conversation_id)
            DO UPDATE SET
                language = EXCLUDED.language,
                confidence = EXCLUDED.confidence,
                status = EXCLUDED.status,
                updated_at = now()
            "#,
        )
        .bind(conversation_id)
        .bind(language)
        .bind(confidence)
        .bind(EnrichmentStatus::Completed.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record the failure and hand back the item result.
    ///
    /// A failing upsert is logged; the item is reported failed either way.
    pub async fn record_failure(
        &self,
        conversation_id: i64,
        error: impl std::fmt::Display,
    ) -> crate::batch::ProcessResult {
        let message = error.to_string();
        tracing::warn!(
            kind = self.kind.as_str(),
            conversation_id,
            error = %message,
            "enrichment failed"
        );
        if let Err(e) = self.mark_failed(conversation_id).await {
            tracing::error!(
                kind = self.kind.as_str(),
                conversation_id,
                error = %e,
                "failed to record failure"
            );
        }
        crate::batch::ProcessResult::failed(message)
    }
}
