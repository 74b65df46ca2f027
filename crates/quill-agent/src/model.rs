use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampling {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 4096,
        }
    }
}

/// Text generation over a role-tagged message list.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Model identifier recorded alongside generated output.
    fn name(&self) -> &str;

    async fn complete(&self, messages: &[ChatMessage], sampling: Sampling) -> Result<String>;
}

/// Client for any server speaking the OpenAI `chat/completions` API.
pub struct OpenAiCompatClient {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
    http: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            timeout_secs: 300,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// First choice's text, or an error when the response carries none.
pub fn extract_content(body: &str) -> Result<String> {
    let parsed: CompletionResponse =
        serde_json::from_str(body).context("parse chat completion response")?;
    let Some(choice) = parsed.choices.into_iter().next() else {
        bail!("chat completion returned no choices");
    };
    match choice.message.content {
        Some(text) if !text.trim().is_empty() => Ok(text),
        _ => bail!("chat completion returned empty content"),
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage], sampling: Sampling) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = CompletionRequest {
            model: &self.model,
            messages,
            temperature: sampling.temperature,
            max_tokens: sampling.max_tokens,
        };

        info!(
            model = %self.model,
            base_url = %self.base_url,
            messages = messages.len(),
            "calling chat completion API"
        );

        let mut req = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(self.timeout_secs))
            .json(&body);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }

        let response = match req.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                warn!(model = %self.model, timeout_secs = self.timeout_secs, "chat completion timed out");
                bail!("chat completion timed out after {}s", self.timeout_secs);
            }
            Err(e) => return Err(e).context("chat completion request failed"),
        };

        let status = response.status();
        let text = response.text().await.context("read chat completion body")?;
        if !status.is_success() {
            warn!(model = %self.model, status = %status, "chat completion returned non-200");
            bail!("chat completion error {status}: {}", truncate(&text, 500));
        }

        let content = extract_content(&text)?;
        info!(model = %self.model, output_len = content.len(), "chat completion received");
        Ok(content)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
