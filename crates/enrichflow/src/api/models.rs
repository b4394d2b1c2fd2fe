use serde::{Deserialize, Serialize};

use crate::batch::{BatchStats, ProgressStats};

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct TaskActionResponse {
    pub success: bool,
    pub message: String,
}

/// Manual run request; `limit` wins over `batch_size` when both are sent.
#[derive(Debug, Default, Deserialize)]
pub struct RunRequest {
    pub limit: Option<i64>,
    pub batch_size: Option<i64>,
}

impl RunRequest {
    pub const DEFAULT_LIMIT: i64 = 10;
    pub const MAX_LIMIT: i64 = 100;

    pub fn effective_limit(&self) -> i64 {
        self.limit
            .or(self.batch_size)
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    #[serde(flatten)]
    pub stats: BatchStats,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ProgressView {
    #[serde(flatten)]
    pub stats: ProgressStats,
    pub completion_rate: String,
}

impl From<ProgressStats> for ProgressView {
    fn from(stats: ProgressStats) -> Self {
        Self {
            completion_rate: stats.completion_rate(),
            stats,
        }
    }
}
