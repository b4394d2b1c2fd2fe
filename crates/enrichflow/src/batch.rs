//! Generic fetch / fan-out / tally engine.
//!
//! A [`Processor`] knows how to find pending items and how to enrich one of
//! them. [`BatchProcessor`] pulls one bounded page, runs it in windows of at
//! most `concurrency` items, and reports what happened. It keeps no state
//! between runs: every call re-derives the pending set from the database.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Outcome of enriching one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessResult {
    pub success: bool,
    /// The work was judged unnecessary (e.g. text already in the target language).
    pub skipped: bool,
    pub error: Option<String>,
}

impl ProcessResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            skipped: false,
            error: None,
        }
    }

    pub fn skipped() -> Self {
        Self {
            success: true,
            skipped: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            skipped: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub success: i64,
    pub failed: i64,
    pub skipped: i64,
    pub remaining: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressStats {
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub pending: i64,
}

impl ProgressStats {
    pub fn from_counts(total: i64, completed: i64, failed: i64) -> Self {
        Self {
            total,
            completed,
            failed,
            pending: (total - completed - failed).max(0),
        }
    }

    /// Share of completed items, formatted like `"42.50%"`.
    pub fn completion_rate(&self) -> String {
        if self.total > 0 {
            format!("{:.2}%", self.completed as f64 / self.total as f64 * 100.0)
        } else {
            "0%".to_string()
        }
    }
}

#[async_trait]
pub trait Processor: Send + Sync + 'static {
    type Item: Send + 'static;

    /// Up to `limit` items currently eligible, in the order they should run.
    async fn fetch_pending(&self, limit: i64) -> anyhow::Result<Vec<Self::Item>>;

    /// Enrich one item and record the outcome durably.
    ///
    /// Must not fail: errors are recorded and returned as
    /// [`ProcessResult::failed`].
    async fn process_one(&self, item: Self::Item) -> ProcessResult;

    /// Eligible items not yet completed, from a fresh aggregate query.
    async fn remaining_count(&self) -> anyhow::Result<i64>;

    async fn progress(&self) -> anyhow::Result<ProgressStats>;
}

pub struct BatchProcessor<P: Processor> {
    processor: Arc<P>,
    concurrency: usize,
}

impl<P: Processor> BatchProcessor<P> {
    pub fn new(processor: P, concurrency: usize) -> Self {
        Self {
            processor: Arc::new(processor),
            concurrency: concurrency.max(1),
        }
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub async fn batch_process(&self, limit: i64) -> anyhow::Result<BatchStats> {
        let mut pending = self.processor.fetch_pending(limit).await?;
        let mut stats = BatchStats::default();

        // Windows run one after another; items inside a window run together.
        while !pending.is_empty() {
            let take = self.concurrency.min(pending.len());
            let window: Vec<P::Item> = pending.drain(..take).collect();

            let mut join_set = JoinSet::new();
            for item in window {
                let processor = self.processor.clone();
                join_set.spawn(async move { processor.process_one(item).await });
            }

            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(result) if result.skipped => stats.skipped += 1,
                    Ok(result) if result.success => stats.success += 1,
                    Ok(result) => {
                        tracing::debug!(
                            error = result.error.as_deref().unwrap_or("unknown"),
                            "item failed"
                        );
                        stats.failed += 1;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "item task aborted");
                        stats.failed += 1;
                    }
                }
            }
        }

        stats.remaining = self.processor.remaining_count().await?;
        Ok(stats)
    }
}

/// Object-safe view of a [`BatchProcessor`], as the scheduler sees it.
#[async_trait]
pub trait BatchJob: Send + Sync {
    async fn run(&self, limit: i64) -> anyhow::Result<BatchStats>;

    async fn progress(&self) -> anyhow::Result<ProgressStats>;

    fn concurrency(&self) -> usize;
}

#[async_trait]
impl<P: Processor> BatchJob for BatchProcessor<P> {
    async fn run(&self, limit: i64) -> anyhow::Result<BatchStats> {
        self.batch_process(limit).await
    }

    async fn progress(&self) -> anyhow::Result<ProgressStats> {
        self.processor.progress().await
    }

    fn concurrency(&self) -> usize {
        self.concurrency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_never_goes_negative() {
        let p = ProgressStats::from_counts(10, 8, 5);
        assert_eq!(p.pending, 0);
        let p = ProgressStats::from_counts(10, 4, 1);
        assert_eq!(p.pending, 5);
    }

    #[test]
    fn completion_rate_formatting() {
        assert_eq!(ProgressStats::from_counts(0, 0, 0).completion_rate(), "0%");
        assert_eq!(ProgressStats::from_counts(8, 3, 0).completion_rate(), "37.50%");
        assert_eq!(ProgressStats::from_counts(4, 4, 0).completion_rate(), "100.00%");
    }
}
