//! OpenRouter integration.
//!
//! Routes all reasoning calls through OpenRouter's unified API, giving access
//! to multiple model providers with a single API key. Uses the
//! OpenAI-compatible chat completions format and reuses the Anthropic
//! client's prompt templates and parsers.
//!
//! Primary model: Claude 4 Sonnet (best grounded financial reasoning).
//! Fallback model: used when the primary model fails all retries.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::anthropic::AnthropicClient; // Reuse prompt templates + parsing
use super::{JudgeReport, ReasoningModel, TurnContext};
use crate::types::DebateRole;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Default primary model: Claude 4 Sonnet via OpenRouter.
const DEFAULT_PRIMARY_MODEL: &str = "anthropic/claude-sonnet-4";

const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Maximum retries on rate limit / server errors per model attempt.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (ms).
const BASE_BACKOFF_MS: u64 = 1000;

// ---------------------------------------------------------------------------
// Cost tables (approximate per-1K-token pricing via OpenRouter)
// ---------------------------------------------------------------------------

/// Returns (input_cost_per_1k, output_cost_per_1k) for known models.
fn model_costs(model: &str) -> (f64, f64) {
    match model {
        m if m.contains("claude") && m.contains("sonnet") => (0.003, 0.015),
        m if m.contains("claude") && m.contains("opus") => (0.015, 0.075),
        m if m.contains("claude") && m.contains("haiku") => (0.0008, 0.004),
        m if m.contains("grok") => (0.003, 0.015),
        m if m.contains("gpt-4o") => (0.005, 0.015),
        // Conservative default
        _ => (0.005, 0.015),
    }
}

// ---------------------------------------------------------------------------
// API types (OpenAI-compatible)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct OpenRouterClient {
    http: Client,
    api_key: String,
    primary_model: String,
    fallback_model: Option<String>,
    max_tokens: u32,
    total_cost: std::sync::atomic::AtomicU64, // stored as cost * 1_000_000
    total_calls: std::sync::atomic::AtomicU64,
}

impl OpenRouterClient {
    /// Create a new OpenRouter client.
    ///
    /// - `api_key`: OpenRouter API key.
    /// - `primary_model`: Primary model ID (e.g. "anthropic/claude-sonnet-4").
    /// - `fallback_model`: Optional fallback model for when primary fails.
    /// - `max_tokens`: Max output tokens per request.
    pub fn new(
        api_key: String,
        primary_model: Option<String>,
        fallback_model: Option<String>,
        max_tokens: Option<u32>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .context("Failed to build OpenRouter HTTP client")?;

        Ok(Self {
            http,
            api_key,
            primary_model: primary_model.unwrap_or_else(|| DEFAULT_PRIMARY_MODEL.to_string()),
            fallback_model,
            max_tokens: max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            total_cost: std::sync::atomic::AtomicU64::new(0),
            total_calls: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Send a chat completion request to a specific model, with retry +
    /// exponential backoff.
    async fn call_model(
        &self,
        model: &str,
        system: &str,
        user_message: &str,
    ) -> Result<(String, u32, f64)> {
        let request = ChatRequest {
            model: model.to_string(),
            max_tokens: self.max_tokens,
            messages: vec![
                ChatMessage { role: "system".to_string(), content: system.to_string() },
                ChatMessage { role: "user".to_string(), content: user_message.to_string() },
            ],
        };

        let mut last_error = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = BASE_BACKOFF_MS * 2u64.pow(attempt - 1);
                debug!(attempt, delay_ms = delay, model, "Retrying OpenRouter call");
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }

            let resp = self.http
                .post(OPENROUTER_API_URL)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("content-type", "application/json")
                .json(&request)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let body: ChatResponse = response.json().await
                            .context("Failed to parse OpenRouter response")?;

                        let text = body.choices.first()
                            .and_then(|c| c.message.as_ref())
                            .map(|m| m.content.clone())
                            .unwrap_or_default();

                        if text.is_empty() {
                            last_error = Some("Empty completion".to_string());
                            continue;
                        }

                        let usage = body.usage.unwrap_or(ChatUsage {
                            prompt_tokens: 0,
                            completion_tokens: 0,
                        });
                        let total_tokens = usage.prompt_tokens + usage.completion_tokens;
                        let (in_cost, out_cost) = model_costs(model);
                        let cost = (usage.prompt_tokens as f64 / 1000.0) * in_cost
                            + (usage.completion_tokens as f64 / 1000.0) * out_cost;

                        let cost_micro = (cost * 1_000_000.0) as u64;
                        self.total_cost.fetch_add(cost_micro, std::sync::atomic::Ordering::Relaxed);
                        self.total_calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

                        return Ok((text, total_tokens, cost));
                    }

                    if status.as_u16() == 429 || status.as_u16() >= 500 {
                        let error_text = response.text().await.unwrap_or_default();
                        warn!(status = %status, attempt, model, error = %error_text, "Retryable OpenRouter error");
                        last_error = Some(format!("HTTP {status}: {error_text}"));
                        continue;
                    }

                    let error_text = response.text().await.unwrap_or_default();
                    anyhow::bail!("OpenRouter API error {status}: {error_text}");
                }
                Err(e) => {
                    warn!(attempt, model, error = %e, "OpenRouter request failed");
                    last_error = Some(format!("Request error: {e}"));
                    continue;
                }
            }
        }

        anyhow::bail!(
            "OpenRouter model {model} failed after {} retries: {}",
            MAX_RETRIES,
            last_error.unwrap_or_default()
        )
    }

    /// Call the primary model; on exhausted retries, try the fallback model
    /// once more before giving up.
    async fn call_with_fallback(&self, system: &str, user_message: &str) -> Result<(String, u32, f64)> {
        match self.call_model(&self.primary_model, system, user_message).await {
            Ok(result) => Ok(result),
            Err(primary_err) => match &self.fallback_model {
                Some(fallback) => {
                    warn!(
                        primary = %self.primary_model,
                        fallback = %fallback,
                        error = %primary_err,
                        "Primary model failed — trying fallback"
                    );
                    self.call_model(fallback, system, user_message).await
                        .with_context(|| format!("Fallback model also failed (primary: {primary_err})"))
                }
                None => Err(primary_err),
            },
        }
    }

    /// Total cumulative cost across all calls.
    pub fn cumulative_cost(&self) -> f64 {
        self.total_cost.load(std::sync::atomic::Ordering::Relaxed) as f64 / 1_000_000.0
    }

    /// Total number of API calls made.
    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(std::sync::atomic::Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// ReasoningModel implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl ReasoningModel for OpenRouterClient {
    async fn generate_turn(&self, role: DebateRole, ctx: &TurnContext<'_>) -> Result<String> {
        let system = AnthropicClient::role_system(role);
        let user_msg = AnthropicClient::build_turn_prompt(ctx);

        let (text, tokens, cost) = self.call_with_fallback(system, &user_msg).await
            .context("OpenRouter turn generation failed")?;

        info!(
            role = %role,
            round = ctx.round,
            tokens,
            cost = format!("${cost:.4}"),
            "Turn generated"
        );

        Ok(text.trim().to_string())
    }

    async fn judge(&self, proponent_message: &str, skeptic_message: &str) -> Result<JudgeReport> {
        let system = AnthropicClient::judge_system();
        let user_msg = AnthropicClient::build_judge_prompt(proponent_message, skeptic_message);

        let (text, tokens, cost) = self.call_with_fallback(system, &user_msg).await
            .context("OpenRouter judge call failed")?;

        let report = AnthropicClient::parse_judge(&text)
            .context("Failed to parse judge response")?;

        info!(
            score = format!("{:.2}", report.agreement_score),
            tokens,
            cost = format!("${cost:.4}"),
            "Judge assessment complete"
        );

        Ok(report)
    }

    fn cost_per_call(&self) -> f64 {
        let (in_cost, out_cost) = model_costs(&self.primary_model);
        (700.0 / 1000.0) * in_cost + (350.0 / 1000.0) * out_cost
    }

    fn model_name(&self) -> &str {
        &self.primary_model
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
