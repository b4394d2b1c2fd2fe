//! Thin client for an OpenAI-compatible chat-completions endpoint.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

use crate::config::LlmSettings;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("LLM API key is not configured")]
    MissingApiKey,

    #[error("request timed out after {after_ms}ms")]
    Timeout { after_ms: u128 },

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("LLM API error: {status} - {body}")]
    Status { status: u16, body: String },

    #[error("LLM API returned empty content")]
    EmptyContent,

    #[error("LLM API returned no usable function call")]
    MissingToolCall,

    #[error("failed to parse LLM output: {snippet}")]
    Parse { snippet: String },
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChatMessage>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatMessage {
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
pub struct ToolCall {
    pub function: Option<FunctionCall>,
}

#[derive(Debug, Deserialize)]
pub struct FunctionCall {
    pub arguments: Option<String>,
}

impl ChatMessage {
    /// Trimmed text content, or [`LlmError::EmptyContent`].
    pub fn text(&self) -> Result<&str, LlmError> {
        self.content
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(LlmError::EmptyContent)
    }

    /// Arguments of the first tool call.
    pub fn tool_arguments(&self) -> Result<&str, LlmError> {
        self.tool_calls
            .as_ref()
            .and_then(|calls| calls.first())
            .and_then(|call| call.function.as_ref())
            .and_then(|f| f.arguments.as_deref())
            .filter(|s| !s.trim().is_empty())
            .ok_or(LlmError::MissingToolCall)
    }
}

/// One chat request. Optional parts are left out of the body when unset.
#[derive(Debug, Clone)]
pub struct ChatRequest<'a> {
    pub system: &'a str,
    pub user: &'a str,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
    pub tools: Option<Value>,
    pub tool_choice: Option<Value>,
}

impl<'a> ChatRequest<'a> {
    pub fn new(system: &'a str, user: &'a str) -> Self {
        Self {
            system,
            user,
            temperature: 0.3,
            max_tokens: None,
            tools: None,
            tool_choice: None,
        }
    }

    pub fn temperature(mut self, t: f64) -> Self {
        self.temperature = t;
        self
    }

    pub fn max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = Some(n);
        self
    }

    pub fn tool(mut self, tool: Value, choice: Value) -> Self {
        self.tools = Some(json!([tool]));
        self.tool_choice = Some(choice);
        self
    }
}

#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

impl LlmClient {
    pub fn new(settings: &LlmSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: format!(
                "{}/chat/completions",
                settings.base_url.trim_end_matches('/')
            ),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            timeout: settings.timeout,
        }
    }

    fn body(&self, req: &ChatRequest<'_>) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": req.system },
                { "role": "user", "content": req.user },
            ],
            "temperature": req.temperature,
        });
        if let Some(n) = req.max_tokens {
            body["max_tokens"] = json!(n);
        }
        if let Some(tools) = &req.tools {
            body["tools"] = tools.clone();
        }
        if let Some(choice) = &req.tool_choice {
            body["tool_choice"] = choice.clone();
        }
        body
    }

    /// Send one request and return the first choice's message.
    pub async fn chat(&self, req: ChatRequest<'_>) -> Result<ChatMessage, LlmError> {
        let api_key = self.api_key.as_deref().ok_or(LlmError::MissingApiKey)?;

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .timeout(self.timeout)
            .json(&self.body(&req))
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Status { status, body });
        }

        let completion: ChatCompletion = resp.json().await.map_err(|e| self.map_transport(e))?;

        Ok(completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .unwrap_or_default())
    }

    fn map_transport(&self, e: reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::Timeout {
                after_ms: self.timeout.as_millis(),
            }
        } else {
            LlmError::Request(e)
        }
    }
}

/// Drop a surrounding ```` ``` ```` / ```` ```json ```` fence, if any.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest
        .strip_prefix("json")
        .or_else(|| rest.strip_prefix("JSON"))
        .unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}

/// Parse a JSON payload out of model text, tolerating a code fence.
pub fn parse_payload<T: DeserializeOwned>(text: &str) -> Result<T, LlmError> {
    serde_json::from_str(strip_code_fence(text)).map_err(|_| LlmError::Parse {
        snippet: snippet(text, 100),
    })
}

fn snippet(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
