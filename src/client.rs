//! Inference client
//!
//! One chat-completions request per batch. The HTTP transport sits behind
//! `ChatBackend` so the retry/rotation policy can be exercised against a
//! scripted backend. Failure kinds map to a fixed policy table:
//! rate-limited → rotate credential and back off; blocked → refuse the batch
//! with no retry; oversized → hand back to the scheduler for a split;
//! transient → bounded retries on the same credential; malformed → one retry,
//! then the raw text goes to the decoder's best-effort cascade.

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::time::Duration;

use crate::{credentials::CredentialPool, error::AppResult, pacing::Pacer};

const RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("content policy refusal: {0}")]
    Blocked(String),

    #[error("prompt rejected as oversized: {0}")]
    Oversized(String),

    #[error("transient provider failure: {0}")]
    Transient(String),

    /// Carries whatever body the provider did return, so a truncated
    /// completion can still reach the decoder.
    #[error("malformed completion")]
    Malformed(String),
}

/// Maps an HTTP failure to its retry class. Pure so the table is testable.
pub fn classify_http_failure(status: u16, body: &str) -> ClientError {
    let lower = body.to_lowercase();
    match status {
        429 => ClientError::RateLimited(body.to_string()),
        400 | 413 => {
            if lower.contains("safety")
                || lower.contains("blocked")
                || lower.contains("content policy")
                || lower.contains("prohibited")
            {
                ClientError::Blocked(body.to_string())
            } else if lower.contains("too large")
                || lower.contains("too long")
                || lower.contains("context length")
                || lower.contains("max tokens")
            {
                ClientError::Oversized(body.to_string())
            } else {
                ClientError::Transient(body.to_string())
            }
        }
        _ => ClientError::Transient(format!("HTTP {status}: {body}")),
    }
}

fn classify_api_error(message: &str) -> ClientError {
    if message.to_lowercase().contains("rate limit") {
        ClientError::RateLimited(message.to_string())
    } else {
        ClientError::Transient(message.to_string())
    }
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ModelLength,
    Error,
    ToolCalls,
    ContentFilter,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    pub message: ChatMessage,
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Deserialize)]
pub struct PromptUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Deserialize)]
pub struct ChatApiResponse {
    pub choices: Vec<ChatChoice>,
    pub usage: Option<PromptUsage>,
}

#[derive(Debug, Deserialize)]
pub struct ChatApiError {
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ChatApiResponseOrError {
    Response(ChatApiResponse),
    Error(ChatApiError),
}

// ============================================================================
// Backend
// ============================================================================

pub trait ChatBackend: Send + Sync {
    /// One network call per invocation.
    fn complete(
        &self,
        system: &str,
        user: &str,
        api_key: &str,
    ) -> impl std::future::Future<Output = Result<String, ClientError>> + Send;
}

pub struct HttpChatBackend {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    temperature: f64,
}

impl HttpChatBackend {
    pub fn new(http: reqwest::Client, endpoint: String, model: String, temperature: f64) -> Self {
        Self {
            http,
            endpoint,
            model,
            temperature,
        }
    }
}

impl ChatBackend for HttpChatBackend {
    async fn complete(&self, system: &str, user: &str, api_key: &str) -> Result<String, ClientError> {
        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&json!({
                "model": &self.model,
                "temperature": self.temperature,
                "messages": [
                    { "role": "system", "content": system },
                    { "role": "user", "content": user }
                ]
            }))
            .send()
            .await
            .map_err(|e| ClientError::Transient(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ClientError::Transient(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_http_failure(status.as_u16(), &body));
        }

        let parsed: ChatApiResponseOrError = serde_json::from_str(&body)
            .map_err(|_| ClientError::Malformed(body.clone()))?;

        let parsed = match parsed {
            ChatApiResponseOrError::Error(err) => return Err(classify_api_error(&err.message)),
            ChatApiResponseOrError::Response(parsed) => parsed,
        };

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::Malformed(body.clone()))?;

        if let Some(usage) = &parsed.usage {
            tracing::debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "completion usage"
            );
        }

        match choice.finish_reason {
            Some(FinishReason::ContentFilter) => {
                return Err(ClientError::Blocked("completion content-filtered".into()))
            }
            Some(FinishReason::Length) | Some(FinishReason::ModelLength) => {
                // Truncated mid-answer; worth one retry, then best-effort decode.
                return Err(ClientError::Malformed(choice.message.content));
            }
            _ => {}
        }

        if choice.message.content.trim().is_empty() {
            return Err(ClientError::Malformed(String::new()));
        }

        Ok(choice.message.content)
    }
}

// ============================================================================
// Retry/rotation policy
// ============================================================================

#[derive(Debug)]
pub enum PromptOutcome {
    Completed(String),
    /// Content-policy refusal; every item in the batch becomes Refused.
    Refused,
    /// Provider rejected the prompt as too large; the scheduler should split.
    Oversized,
    /// Retries exhausted; the batch degrades to decode-failed placeholders.
    Exhausted,
}

pub struct InferenceClient<B> {
    backend: B,
    pacer: Pacer,
    max_attempts: u32,
}

impl<B: ChatBackend> InferenceClient<B> {
    pub fn new(backend: B, pacer: Pacer, max_attempts: u32) -> Self {
        Self {
            backend,
            pacer,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Runs one batch prompt to a terminal outcome. Only pool-wide daily
    /// quota exhaustion escapes as an error.
    pub async fn classify(
        &self,
        pool: &mut CredentialPool,
        system: &str,
        prompt: &str,
        estimated_tokens: usize,
    ) -> AppResult<PromptOutcome> {
        let mut attempts = 0u32;
        let mut malformed_retried = false;

        loop {
            let idx = pool.await_eligible().await?;
            self.pacer.acquire_call().await;
            self.pacer.acquire_tokens(estimated_tokens).await;

            let name = pool.credential(idx).name.clone();
            let key = pool.credential(idx).key.clone();
            pool.record_usage(idx);

            match self.backend.complete(system, prompt, &key).await {
                Ok(text) => return Ok(PromptOutcome::Completed(text)),
                Err(ClientError::RateLimited(msg)) => {
                    tracing::warn!(credential = %name, "provider rate limited: {msg}");
                    pool.rotate();
                    self.pacer.trigger_backoff();
                    attempts += 1;
                    if attempts >= self.max_attempts {
                        return Ok(PromptOutcome::Exhausted);
                    }
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(ClientError::Blocked(msg)) => {
                    tracing::warn!(credential = %name, "batch refused by content policy: {msg}");
                    return Ok(PromptOutcome::Refused);
                }
                Err(ClientError::Oversized(msg)) => {
                    tracing::debug!("prompt rejected as oversized: {msg}");
                    return Ok(PromptOutcome::Oversized);
                }
                Err(ClientError::Transient(msg)) => {
                    attempts += 1;
                    tracing::warn!(
                        credential = %name,
                        attempt = attempts,
                        "transient provider failure: {msg}"
                    );
                    if attempts >= self.max_attempts {
                        return Ok(PromptOutcome::Exhausted);
                    }
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(ClientError::Malformed(raw)) => {
                    if malformed_retried {
                        // Second malformed body in a row: let the decoder
                        // salvage what it can.
                        return Ok(PromptOutcome::Completed(raw));
                    }
                    tracing::warn!(credential = %name, "malformed completion, retrying once");
                    malformed_retried = true;
                }
            }
        }
    }
}
