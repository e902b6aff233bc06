//! OpenRouter chat-completions provider
//!
//! Retries rate-limited requests with exponential backoff. The API key is
//! held in memory only and never serialized.

use super::prompts::DELIBERATION_SYSTEM;
use super::provider::{ModelProvider, ProviderReply, Usage};
use crate::error::{ProviderError, ProviderErrorKind};
use crate::util::truncate;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Rate limit retry configuration
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000;
const BACKOFF_MULTIPLIER: u64 = 2;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

pub struct OpenRouterProvider {
    client: reqwest::Client,
    api_key: String,
    url: String,
    max_tokens: u32,
}

impl std::fmt::Debug for OpenRouterProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterProvider")
            .field("url", &self.url)
            .field("max_tokens", &self.max_tokens)
            .finish_non_exhaustive()
    }
}

impl OpenRouterProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            url: OPENROUTER_URL.to_string(),
            max_tokens: 4096,
        }
    }

    /// Provider with the key from the environment or keychain, if any
    pub fn from_env() -> Option<Self> {
        crate::config::api_key().map(Self::new)
    }

    /// Point at another OpenAI-compatible endpoint
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    async fn call(&self, prompt: &str, model_id: &str, timeout: Duration) -> Result<ProviderReply, ProviderError> {
        let request = ChatRequest {
            model: model_id,
            messages: vec![
                Message {
                    role: "system",
                    content: DELIBERATION_SYSTEM,
                },
                Message {
                    role: "user",
                    content: prompt,
                },
            ],
            max_tokens: self.max_tokens,
            stream: false,
        };

        let mut retry_count = 0;
        loop {
            let response = self
                .client
                .post(&self.url)
                .header("Content-Type", "application/json")
                .header("X-Title", "bughunt")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .timeout(timeout)
                .json(&request)
                .send()
                .await
                .map_err(|e| transport_error(e, model_id, timeout))?;

            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| transport_error(e, model_id, timeout))?;

            if status.is_success() {
                return parse_reply(&text);
            }

            if status.as_u16() == 429 && retry_count < MAX_RETRIES {
                retry_count += 1;
                let retry_after = parse_retry_after(&text)
                    .unwrap_or((INITIAL_BACKOFF_MS * BACKOFF_MULTIPLIER.pow(retry_count - 1)) / 1000);
                tracing::warn!(
                    model = model_id,
                    "rate limited; retrying in {}s (attempt {}/{})",
                    retry_after,
                    retry_count,
                    MAX_RETRIES
                );
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                continue;
            }

            return Err(status_error(status.as_u16(), &text, retry_count));
        }
    }
}

impl ModelProvider for OpenRouterProvider {
    fn send<'a>(
        &'a self,
        prompt: &'a str,
        model_id: &'a str,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderReply, ProviderError>> + Send + 'a>> {
        Box::pin(self.call(prompt, model_id, timeout))
    }
}

fn transport_error(err: reqwest::Error, model_id: &str, timeout: Duration) -> ProviderError {
    if err.is_timeout() {
        ProviderError::timeout(model_id, timeout.as_secs())
    } else {
        ProviderError::new(ProviderErrorKind::Network, err.to_string())
    }
}

fn status_error(status: u16, body: &str, retries: u32) -> ProviderError {
    match status {
        401 | 403 => ProviderError::new(ProviderErrorKind::Auth, "API key was rejected"),
        429 => ProviderError::new(
            ProviderErrorKind::RateLimited,
            format!("rate limited after {} retries", retries),
        ),
        500..=599 => ProviderError::new(
            ProviderErrorKind::Server,
            format!("server error ({}); the service may be temporarily unavailable", status),
        ),
        _ => ProviderError::new(
            ProviderErrorKind::Server,
            format!("API error {}: {}", status, truncate(body, 200)),
        ),
    }
}

fn parse_reply(body: &str) -> Result<ProviderReply, ProviderError> {
    let parsed: ChatResponse = serde_json::from_str(body).map_err(|e| {
        ProviderError::new(
            ProviderErrorKind::MalformedReply,
            format!("unparsable response: {} ({})", e, truncate(body, 120)),
        )
    })?;
    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(ProviderError::new(
            ProviderErrorKind::MalformedReply,
            "response had no content",
        ));
    }
    let usage = parsed
        .usage
        .map(|u| Usage {
            tokens_in: u.prompt_tokens,
            tokens_out: u.completion_tokens,
        })
        .unwrap_or_default();
    Ok(ProviderReply { text, usage })
}

/// Extract a retry-after hint like "retry after 7 seconds" from an error body
fn parse_retry_after(text: &str) -> Option<u64> {
    let text_lower = text.to_lowercase();
    let pos = text_lower.find("retry")?;
    text_lower[pos..]
        .split_whitespace()
        .skip(1)
        .take(5)
        .filter_map(|word| {
            word.trim_matches(|c: char| !c.is_numeric())
                .parse::<u64>()
                .ok()
        })
        .find(|secs| *secs > 0 && *secs < 300)
}
