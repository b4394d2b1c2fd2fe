use async_trait::async_trait;
use serde::Deserialize;

use super::llm::{parse_payload, ChatRequest, LlmClient};
use super::settings::{Language, LanguageSettings, SettingsRepo};
use super::store::EnrichmentRepo;
use super::{non_blank, EnrichmentKind, PendingConversation};
use crate::batch::{ProcessResult, Processor, ProgressStats};

pub const UNKNOWN_LANGUAGE: &str = "other";

#[derive(Debug, Deserialize, PartialEq)]
pub struct Detected {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl Detected {
    /// `(code, confidence)` with blanks mapped to `other` / 0.
    fn resolve(self) -> (String, f64) {
        let language = self
            .language
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| UNKNOWN_LANGUAGE.to_string());
        let confidence = self
            .confidence
            .filter(|c| c.is_finite())
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);
        (language, confidence)
    }
}

fn system_prompt(base: &str, languages: &[Language]) -> String {
    let codes = languages
        .iter()
        .map(|l| l.code.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "{base}\n\nSupported language codes: {codes}\n\n\
         Reply with JSON only, nothing else:\n\
         {{\"language\": \"<code>\", \"confidence\": 0.95}}\n\n\
         If the language cannot be identified, reply: {{\"language\": \"other\", \"confidence\": 0}}"
    )
}

pub struct LanguageProcessor {
    repo: EnrichmentRepo,
    settings: SettingsRepo,
    llm: LlmClient,
}

impl LanguageProcessor {
    pub fn new(repo: EnrichmentRepo, settings: SettingsRepo, llm: LlmClient) -> Self {
        debug_assert_eq!(repo.kind(), EnrichmentKind::LanguageDetection);
        Self {
            repo,
            settings,
            llm,
        }
    }

    async fn detect(&self, text: &str) -> anyhow::Result<(String, f64)> {
        let settings = self
            .settings
            .load::<LanguageSettings>(EnrichmentKind::LanguageDetection)
            .await
            .value;
        let system = system_prompt(&settings.system_prompt, &settings.languages);

        let message = self
            .llm
            .chat(
                ChatRequest::new(&system, text)
                    .temperature(0.1)
                    .max_tokens(100),
            )
            .await?;

        Ok(parse_payload::<Detected>(message.text()?)?.resolve())
    }

    async fn try_process(&self, item: &PendingConversation) -> anyhow::Result<()> {
        let Some(query) = non_blank(item.query.as_deref()) else {
            return self.repo.save_language(item.id, UNKNOWN_LANGUAGE, 0.0).await;
        };

        let (language, confidence) = self.detect(query).await?;
        self.repo.save_language(item.id, &language, confidence).await
    }
}

#[async_trait]
impl Processor for LanguageProcessor {
    type Item = PendingConversation;

    async fn fetch_pending(&self, limit: i64) -> anyhow::Result<Vec<PendingConversation>> {
        self.repo.fetch_pending(limit).await
    }

    async fn process_one(&self, item: PendingConversation) -> ProcessResult {
        match self.try_process(&item).await {
            Ok(()) => ProcessResult::ok(),
            Err(e) => self.repo.record_failure(item.id, e).await,
        }
    }

    async fn remaining_count(&self) -> anyhow::Result<i64> {
        self.repo.remaining().await
    }

    async fn progress(&self) -> anyhow::Result<ProgressStats> {
        self.repo.progress().await
    }
}
