use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::llm::{parse_payload, ChatRequest, LlmClient};
use super::settings::{Category, ClassificationSettings, SettingsRepo};
use super::store::EnrichmentRepo;
use super::{non_blank, EnrichmentKind, PendingConversation};
use crate::batch::{ProcessResult, Processor, ProgressStats};

pub const FALLBACK_CATEGORY: &str = "other";
const TOOL_NAME: &str = "classify_intent";

#[derive(Debug, Deserialize, PartialEq)]
pub struct Classified {
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub confidence: f64,
}

impl Classified {
    fn normalized(mut self) -> Self {
        if self.category.trim().is_empty() {
            self.category = FALLBACK_CATEGORY.to_string();
        }
        self.confidence = if self.confidence.is_finite() {
            self.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }
}

fn system_prompt(base: &str, categories: &[Category]) -> String {
    let listed = categories
        .iter()
        .map(|c| format!("- {}: {} - {}", c.id, c.name, c.description))
        .collect::<Vec<_>>()
        .join("\n");
    format!("{base}\n\nAvailable categories:\n{listed}\n\nPick the category that best matches the user's question.")
}

/// Function definition whose `category` may only be one of the configured ids.
fn classify_tool(categories: &[Category]) -> Value {
    let ids: Vec<&str> = categories.iter().map(|c| c.id.as_str()).collect();
    json!({
        "type": "function",
        "function": {
            "name": TOOL_NAME,
            "description": "Classify the intent of the user's question",
            "parameters": {
                "type": "object",
                "properties": {
                    "category": {
                        "type": "string",
                        "enum": ids,
                        "description": "Intent category id"
                    },
                    "confidence": {
                        "type": "number",
                        "minimum": 0,
                        "maximum": 1,
                        "description": "Confidence between 0 and 1"
                    }
                },
                "required": ["category", "confidence"]
            }
        }
    })
}

fn forced_choice() -> Value {
    json!({ "type": "function", "function": { "name": TOOL_NAME } })
}

pub struct ClassificationProcessor {
    repo: EnrichmentRepo,
    settings: SettingsRepo,
    llm: LlmClient,
}

impl ClassificationProcessor {
    pub fn new(repo: EnrichmentRepo, settings: SettingsRepo, llm: LlmClient) -> Self {
        debug_assert_eq!(repo.kind(), EnrichmentKind::Classification);
        Self {
            repo,
            settings,
            llm,
        }
    }

    async fn classify(&self, query: &str) -> anyhow::Result<Classified> {
        let settings = self
            .settings
            .load::<ClassificationSettings>(EnrichmentKind::Classification)
            .await
            .value;
        let system = system_prompt(&settings.system_prompt, &settings.categories);

        let message = self
            .llm
            .chat(
                ChatRequest::new(&system, query)
                    .temperature(0.1)
                    .tool(classify_tool(&settings.categories), forced_choice()),
            )
            .await?;

        let parsed = parse_payload::<Classified>(message.tool_arguments()?)?;
        Ok(parsed.normalized())
    }

    async fn try_process(&self, item: &PendingConversation) -> anyhow::Result<()> {
        let Some(query) = non_blank(item.query.as_deref()) else {
            return self
                .repo
                .save_classification(item.id, FALLBACK_CATEGORY, 0.0)
                .await;
        };

        let out = self.classify(query).await?;
        self.repo
            .save_classification(item.id, &out.category, out.confidence)
            .await
    }
}

#[async_trait]
impl Processor for ClassificationProcessor {
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
