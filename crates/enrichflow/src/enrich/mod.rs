pub mod classification;
pub mod language;
pub mod llm;
pub mod settings;
pub mod store;
pub mod translation;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::batch::{BatchJob, BatchProcessor};
use crate::config::Config;
use crate::scheduler::TaskSpec;

pub use classification::ClassificationProcessor;
pub use language::LanguageProcessor;
pub use llm::{LlmClient, LlmError};
pub use settings::SettingsRepo;
pub use store::EnrichmentRepo;
pub use translation::TranslationProcessor;

/// The three enrichment kinds. Doubles as the task name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnrichmentKind {
    Translation,
    Classification,
    LanguageDetection,
}

impl EnrichmentKind {
    pub const ALL: [EnrichmentKind; 3] = [
        EnrichmentKind::Translation,
        EnrichmentKind::Classification,
        EnrichmentKind::LanguageDetection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentKind::Translation => "translation",
            EnrichmentKind::Classification => "classification",
            EnrichmentKind::LanguageDetection => "language-detection",
        }
    }

    /// Result table for this kind.
    pub fn table(&self) -> &'static str {
        match self {
            EnrichmentKind::Translation => "conversation_translations",
            EnrichmentKind::Classification => "conversation_classifications",
            EnrichmentKind::LanguageDetection => "conversation_language_detections",
        }
    }

    pub fn lock_name(&self) -> String {
        format!("enrichflow:task:{}", self.as_str())
    }
}

impl fmt::Display for EnrichmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnrichmentKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "translation" | "translate" => Ok(EnrichmentKind::Translation),
            "classification" | "classify" => Ok(EnrichmentKind::Classification),
            "language-detection" | "language_detection" | "language" => {
                Ok(EnrichmentKind::LanguageDetection)
            }
            other => anyhow::bail!("unknown task: {other}"),
        }
    }
}

pub enum EnrichmentStatus {
    Completed,
    Failed,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStatus::Completed => "completed",
            EnrichmentStatus::Failed => "failed",
        }
    }
}

/// A conversation with no `completed` row for the kind being processed.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct PendingConversation {
    pub id: i64,
    pub query: Option<String>,
    pub response: Option<String>,
}

/// `Some(trimmed)` for non-blank text.
pub(crate) fn non_blank(text: Option<&str>) -> Option<&str> {
    text.map(str::trim).filter(|s| !s.is_empty())
}

/// The three processors wired to one pool and one LLM client.
#[derive(Clone)]
pub struct Enrichers {
    pub translation: Arc<BatchProcessor<TranslationProcessor>>,
    pub classification: Arc<BatchProcessor<ClassificationProcessor>>,
    pub language_detection: Arc<BatchProcessor<LanguageProcessor>>,
}

impl Enrichers {
    pub fn new(pool: PgPool, llm: LlmClient, cfg: &Config) -> Self {
        let settings = SettingsRepo::new(pool.clone());
        let repo = |kind| EnrichmentRepo::new(pool.clone(), kind, cfg.processing_horizon_days);

        Self {
            translation: Arc::new(BatchProcessor::new(
                TranslationProcessor::new(
                    repo(EnrichmentKind::Translation),
                    settings.clone(),
                    llm.clone(),
                ),
                cfg.translation.concurrency,
            )),
            classification: Arc::new(BatchProcessor::new(
                ClassificationProcessor::new(
                    repo(EnrichmentKind::Classification),
                    settings.clone(),
                    llm.clone(),
                ),
                cfg.classification.concurrency,
            )),
            language_detection: Arc::new(BatchProcessor::new(
                LanguageProcessor::new(repo(EnrichmentKind::LanguageDetection), settings, llm),
                cfg.language_detection.concurrency,
            )),
        }
    }

    pub fn job(&self, kind: EnrichmentKind) -> Arc<dyn BatchJob> {
        match kind {
            EnrichmentKind::Translation => self.translation.clone(),
            EnrichmentKind::Classification => self.classification.clone(),
            EnrichmentKind::LanguageDetection => self.language_detection.clone(),
        }
    }

    /// Scheduler registrations for all three kinds, sized from `cfg`.
    pub fn task_specs(&self, cfg: &Config) -> Vec<TaskSpec> {
        EnrichmentKind::ALL
            .into_iter()
            .map(|kind| {
                let task = match kind {
                    EnrichmentKind::Translation => &cfg.translation,
                    EnrichmentKind::Classification => &cfg.classification,
                    EnrichmentKind::LanguageDetection => &cfg.language_detection,
                };
                TaskSpec {
                    name: kind,
                    schedule: task.schedule.clone(),
                    batch_size: task.batch_size,
                    auto_start: task.auto_start,
                    job: self.job(kind),
                }
            })
            .collect()
    }
}
