//! Prompt configuration stored in `system_settings`.
//!
//! Each enrichment kind keeps one JSON document under its own key. Missing or
//! unreadable documents fall back to the built-in defaults, so a fresh
//! database works without any setup.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;

use super::EnrichmentKind;

pub const DEFAULT_TRANSLATION_PROMPT: &str = "You are a professional translator. \
Translate the user's question and the AI's answer into Simplified Chinese separately.
Return strict JSON only, with nothing else around it:
{\"queryZh\": \"translated question\", \"responseZh\": \"translated answer\"}";

pub const DEFAULT_CLASSIFICATION_PROMPT: &str = "You are an intent classifier. \
Read the user's question and pick the intent category that fits it best.";

pub const DEFAULT_LANGUAGE_PROMPT: &str = "You are a language identification tool. \
Your only job is to name the language of the user's text. Never answer the text itself.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Language {
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationSettings {
    pub system_prompt: String,
}

impl Default for TranslationSettings {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_TRANSLATION_PROMPT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationSettings {
    pub categories: Vec<Category>,
    pub system_prompt: String,
}

impl Default for ClassificationSettings {
    fn default() -> Self {
        let categories = [
            ("product_inquiry", "Product inquiry", "Questions about product features and specs"),
            ("technical_support", "Technical support", "Technical problems and troubleshooting"),
            ("order_service", "Order service", "Order status, shipping, returns"),
            ("complaint", "Complaint", "Complaints, feedback, suggestions"),
            ("other", "Other", "Anything that fits no other category"),
        ]
        .into_iter()
        .map(|(id, name, description)| Category {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
        })
        .collect();

        Self {
            categories,
            system_prompt: DEFAULT_CLASSIFICATION_PROMPT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageSettings {
    pub languages: Vec<Language>,
    pub system_prompt: String,
}

impl Default for LanguageSettings {
    fn default() -> Self {
        let languages = [
            ("ar", "Arabic"),
            ("bg", "Bulgarian"),
            ("de", "German"),
            ("en", "English"),
            ("es", "Spanish"),
            ("fr", "French"),
            ("hi", "Hindi"),
            ("hu", "Hungarian"),
            ("id", "Indonesian"),
            ("it", "Italian"),
            ("ja", "Japanese"),
            ("nl", "Dutch"),
            ("tl", "Filipino"),
            ("pl", "Polish"),
            ("pt", "Portuguese"),
            ("ro", "Romanian"),
            ("ru", "Russian"),
            ("th", "Thai"),
            ("tr", "Turkish"),
            ("uk", "Ukrainian"),
            ("uz", "Uzbek"),
            ("vi", "Vietnamese"),
            ("zh-TW", "Traditional Chinese"),
            ("zh-CN", "Simplified Chinese"),
            ("other", "Other"),
        ]
        .into_iter()
        .map(|(code, name)| Language {
            code: code.to_string(),
            name: name.to_string(),
        })
        .collect();

        Self {
            languages,
            system_prompt: DEFAULT_LANGUAGE_PROMPT.to_string(),
        }
    }
}

fn require_prompt(prompt: &str) -> anyhow::Result<()> {
    anyhow::ensure!(!prompt.trim().is_empty(), "system_prompt must be a non-empty string");
    Ok(())
}

impl TranslationSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        require_prompt(&self.system_prompt)
    }
}

impl ClassificationSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.categories.is_empty(), "categories must not be empty");
        for c in &self.categories {
            anyhow::ensure!(
                !c.id.trim().is_empty() && !c.name.trim().is_empty(),
                "every category needs an id and a name"
            );
        }
        require_prompt(&self.system_prompt)
    }
}

impl LanguageSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.languages.is_empty(), "languages must not be empty");
        for l in &self.languages {
            anyhow::ensure!(
                !l.code.trim().is_empty() && !l.name.trim().is_empty(),
                "every language needs a code and a name"
            );
        }
        require_prompt(&self.system_prompt)
    }
}

/// A settings document plus the time it was last saved (`None` = defaults).
#[derive(Debug, Clone, Serialize)]
pub struct Stored<T> {
    #[serde(flatten)]
    pub value: T,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct SettingsRepo {
    pool: PgPool,
}

impl SettingsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn key(kind: EnrichmentKind) -> &'static str {
        match kind {
            EnrichmentKind::Translation => "translation_config",
            EnrichmentKind::Classification => "classification_config",
            EnrichmentKind::LanguageDetection => "language_detection_config",
        }
    }

    pub async fn get_raw(&self, kind: EnrichmentKind) -> anyhow::Result<Option<(Value, DateTime<Utc>)>> {
        let row = sqlx::query_as::<_, (Value, DateTime<Utc>)>(
            "SELECT value, updated_at FROM system_settings WHERE key = $1",
        )
        .bind(Self::key(kind))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn put_raw(&self, kind: EnrichmentKind, value: &Value) -> anyhow::Result<DateTime<Utc>> {
        let updated_at: DateTime<Utc> = sqlx::query_scalar(
            r#"
            INSERT INTO system_settings (key, value, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (key)
            DO UPDATE SET value = EXCLUDED.value, updated_at = now()
            RETURNING updated_at
            "#,
        )
        .bind(Self::key(kind))
        .bind(value)
        .fetch_one(&self.pool)
        .await?;
        Ok(updated_at)
    }

    /// Typed read with fallback to `T::default()`.
    ///
    /// Fields missing from the stored document take their default values.
    pub async fn load<T>(&self, kind: EnrichmentKind) -> Stored<T>
    where
        T: DeserializeOwned + Serialize + Default,
    {
        match self.get_raw(kind).await {
            Ok(Some((value, updated_at))) => Stored {
                value: merge_with_default(value),
                updated_at: Some(updated_at),
            },
            Ok(None) => Stored {
                value: T::default(),
                updated_at: None,
            },
            Err(e) => {
                tracing::warn!(kind = kind.as_str(), error = %e, "failed to read settings, using defaults");
                Stored {
                    value: T::default(),
                    updated_at: None,
                }
            }
        }
    }

    pub async fn save<T: Serialize>(&self, kind: EnrichmentKind, value: &T) -> anyhow::Result<DateTime<Utc>> {
        let json = serde_json::to_value(value)?;
        self.put_raw(kind, &json).await
    }
}

/// Overlay a stored document on top of the defaults, field by field.
fn merge_with_default<T>(stored: Value) -> T
where
    T: DeserializeOwned + Serialize + Default,
{
    let mut base = match serde_json::to_value(T::default()) {
        Ok(v) => v,
        Err(_) => return T::default(),
    };
    if let (Some(base_obj), Value::Object(stored_obj)) = (base.as_object_mut(), stored) {
        for (k, v) in stored_obj {
            let keep_default = match &v {
                Value::Null => true,
                Value::String(s) => s.trim().is_empty(),
                Value::Array(a) => a.is_empty(),
                _ => false,
            };
            if !keep_default {
                base_obj.insert(k, v);
            }
        }
    }
    serde_json::from_value(base).unwrap_or_default()
}
