//! Chinese translation of the query and response of each conversation.
//!
//! Text that is already mostly Chinese is copied through without an LLM call
//! and the item is reported as skipped.

use async_trait::async_trait;
use serde::Deserialize;

use super::llm::{parse_payload, ChatRequest, LlmClient};
use super::settings::{SettingsRepo, TranslationSettings};
use super::store::EnrichmentRepo;
use super::{non_blank, EnrichmentKind, PendingConversation};
use crate::batch::{ProcessResult, Processor, ProgressStats};

/// Below this share of CJK characters a text gets translated.
const CJK_RATIO_THRESHOLD: f64 = 0.5;

pub fn is_cjk(c: char) -> bool {
    ('\u{4E00}'..='\u{9FA5}').contains(&c)
}

/// `true` for non-blank text that is less than half Chinese.
pub fn needs_translation(text: &str) -> bool {
    if text.trim().is_empty() {
        return false;
    }
    let total = text.chars().count();
    let cjk = text.chars().filter(|c| is_cjk(*c)).count();
    (cjk as f64 / total as f64) < CJK_RATIO_THRESHOLD
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Translated {
    #[serde(default)]
    pub query_zh: Option<String>,
    #[serde(default)]
    pub response_zh: Option<String>,
}

fn user_prompt(query: &str, response: &str) -> String {
    format!("User question:\n{query}\n\nAI answer:\n{response}")
}

/// Translated text, or the original when the model left the field empty.
fn pick<'a>(translated: Option<&'a str>, original: Option<&'a str>) -> Option<&'a str> {
    non_blank(translated).or(original)
}

pub struct TranslationProcessor {
    repo: EnrichmentRepo,
    settings: SettingsRepo,
    llm: LlmClient,
}

impl TranslationProcessor {
    pub fn new(repo: EnrichmentRepo, settings: SettingsRepo, llm: LlmClient) -> Self {
        debug_assert_eq!(repo.kind(), EnrichmentKind::Translation);
        Self {
            repo,
            settings,
            llm,
        }
    }

    async fn translate(&self, query: &str, response: &str) -> anyhow::Result<Translated> {
        let settings = self
            .settings
            .load::<TranslationSettings>(EnrichmentKind::Translation)
            .await
            .value;
        let user = user_prompt(query, response);

        let message = self
            .llm
            .chat(
                ChatRequest::new(&settings.system_prompt, &user)
                    .temperature(0.3)
                    .max_tokens(4000),
            )
            .await?;

        Ok(parse_payload::<Translated>(message.text()?)?)
    }

    async fn try_process(&self, item: &PendingConversation) -> anyhow::Result<bool> {
        let query = item.query.as_deref();
        let response = item.response.as_deref();

        let wants_llm = query.is_some_and(needs_translation) || response.is_some_and(needs_translation);
        if !wants_llm {
            self.repo.save_translation(item.id, query, response).await?;
            return Ok(false);
        }

        let out = self
            .translate(query.unwrap_or_default(), response.unwrap_or_default())
            .await?;

        self.repo
            .save_translation(
                item.id,
                pick(out.query_zh.as_deref(), query),
                pick(out.response_zh.as_deref(), response),
            )
            .await?;
        Ok(true)
    }
}

#[async_trait]
impl Processor for TranslationProcessor {
    type Item = PendingConversation;

    async fn fetch_pending(&self, limit: i64) -> anyhow::Result<Vec<PendingConversation>> {
        self.repo.fetch_pending(limit).await
    }

    async fn process_one(&self, item: PendingConversation) -> ProcessResult {
        match self.try_process(&item).await {
            Ok(true) => ProcessResult::ok(),
            Ok(false) => ProcessResult::skipped(),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn english_needs_translation() {
        assert!(needs_translation("How do I reset my password?"));
    }

    #[test]
    fn chinese_does_not() {
        assert!(!needs_translation("如何重置密码"));
        // 4 of 6 characters are CJK.
        assert!(!needs_translation("重置密码ok"));
    }

    #[test]
    fn blank_text_does_not() {
        assert!(!needs_translation(""));
        assert!(!needs_translation("   \n"));
    }

    #[test]
    fn exactly_half_chinese_is_left_alone() {
        assert!(!needs_translation("密码ab"));
        assert!(needs_translation("密码abc"));
    }

    #[test]
    fn empty_translation_falls_back_to_original() {
        assert_eq!(pick(Some("  "), Some("hello")), Some("hello"));
        assert_eq!(pick(None, Some("hello")), Some("hello"));
        assert_eq!(pick(Some("你好"), Some("hello")), Some("你好"));
        assert_eq!(pick(None, None), None);
    }

    #[test]
    fn parses_camel_case_payload() {
        let t: Translated =
            parse_payload("```json\n{\"queryZh\":\"问题\",\"responseZh\":\"回答\"}\n```").unwrap();
        assert_eq!(t.query_zh.as_deref(), Some("问题"));
        assert_eq!(t.response_zh.as_deref(), Some("回答"));

        let t: Translated = parse_payload("{\"queryZh\":\"问题\"}").unwrap();
        assert_eq!(t.response_zh, None);
    }

    #[test]
    fn user_prompt_carries_both_texts() {
        let p = user_prompt("q", "r");
        assert!(p.contains("User question:\nq"));
        assert!(p.contains("AI answer:\nr"));
    }
}
