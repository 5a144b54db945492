//! Anthropic Claude integration.
//!
//! Implements the `ReasoningModel` trait using the Anthropic Messages API.
//! Handles prompt construction for both debate roles and the judge,
//! response parsing, cost tracking, and rate limiting with exponential
//! backoff.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{JudgeReport, ReasoningModel, TurnContext};
use crate::types::DebateRole;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Maximum retries on rate limit / server errors.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (ms).
const BASE_BACKOFF_MS: u64 = 1000;

/// Approximate cost per 1K input tokens (Sonnet).
const INPUT_COST_PER_1K: f64 = 0.003;
/// Approximate cost per 1K output tokens (Sonnet).
const OUTPUT_COST_PER_1K: f64 = 0.015;

// ---------------------------------------------------------------------------
// API types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    #[serde(default)]
    #[allow(dead_code)]
    content_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct AnthropicClient {
    http: Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    total_cost: std::sync::atomic::AtomicU64, // stored as cost * 1_000_000
    total_calls: std::sync::atomic::AtomicU64,
}

impl AnthropicClient {
    pub fn new(api_key: String, model: Option<String>, max_tokens: Option<u32>) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .context("Failed to build Anthropic HTTP client")?;

        Ok(Self {
            http,
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_tokens: max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            total_cost: std::sync::atomic::AtomicU64::new(0),
            total_calls: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Send a messages request with retry + backoff.
    async fn call_api(&self, system: &str, user_message: &str) -> Result<(String, u32, f64)> {
        let request = MessagesRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            messages: vec![Message {
                role: "user".to_string(),
                content: user_message.to_string(),
            }],
            system: Some(system.to_string()),
        };

        let mut last_error = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = BASE_BACKOFF_MS * 2u64.pow(attempt - 1);
                debug!(attempt, delay_ms = delay, "Retrying Anthropic API call");
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }

            let resp = self.http
                .post(ANTHROPIC_API_URL)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&request)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let body: MessagesResponse = response.json().await
                            .context("Failed to parse Anthropic response")?;

                        let text = body.content.iter()
                            .filter_map(|b| b.text.as_deref())
                            .collect::<Vec<_>>()
                            .join("");

                        let usage = body.usage.unwrap_or(Usage {
                            input_tokens: 0,
                            output_tokens: 0,
                        });

                        let total_tokens = usage.input_tokens + usage.output_tokens;
                        let cost = (usage.input_tokens as f64 / 1000.0) * INPUT_COST_PER_1K
                            + (usage.output_tokens as f64 / 1000.0) * OUTPUT_COST_PER_1K;

                        // Track cumulative cost
                        let cost_micro = (cost * 1_000_000.0) as u64;
                        self.total_cost.fetch_add(cost_micro, std::sync::atomic::Ordering::Relaxed);
                        self.total_calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

                        return Ok((text, total_tokens, cost));
                    }

                    // Retryable errors: 429 (rate limit), 500+, 529 (overloaded)
                    if status.as_u16() == 429 || status.as_u16() >= 500 {
                        let error_text = response.text().await.unwrap_or_default();
                        warn!(status = %status, attempt, error = %error_text, "Retryable Anthropic API error");
                        last_error = Some(format!("HTTP {status}: {error_text}"));
                        continue;
                    }

                    // Non-retryable error
                    let error_text = response.text().await.unwrap_or_default();
                    anyhow::bail!("Anthropic API error {status}: {error_text}");
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Anthropic request failed");
                    last_error = Some(format!("Request error: {e}"));
                    continue;
                }
            }
        }

        anyhow::bail!(
            "Anthropic API failed after {} retries: {}",
            MAX_RETRIES,
            last_error.unwrap_or_default()
        )
    }

    // -----------------------------------------------------------------------
    // Prompt construction (shared with the OpenRouter client)
    // -----------------------------------------------------------------------

    /// System prompt for a debate role.
    pub fn role_system(role: DebateRole) -> &'static str {
        match role {
            DebateRole::Proponent => {
                "You are the PROPONENT: a rigorous buy-side analyst presenting the most \
                 analytically sound optimistic interpretation of the scenario results.\n\n\
                 RULES:\n\
                 1. Use ONLY figures explicitly provided in the context panel. Never compute, \
                    extrapolate, or invent financial values.\n\
                 2. Never cite drivers absent from the data (no new products, pre-orders, \
                    market expansion, or internal projections).\n\
                 3. Engage the Skeptic's latest argument directly: acknowledge valid concerns, \
                    then argue why the modeled outcome still supports the scenario.\n\
                 4. Qualitative interpretation is welcome; every number you quote must come \
                    from the panel.\n\
                 5. Respect the solvency finding — do not contradict the modeled runway.\n\
                 6. Keep the response to 2–3 professional paragraphs."
            }
            DebateRole::Skeptic => {
                "You are the SKEPTIC: a skeptical analyst stress-testing the scenario. \
                 Question whether the modeled outcomes make sense given the inputs, surface \
                 downside readings of the distribution, and demand evidence for optimistic \
                 claims.\n\n\
                 RULES:\n\
                 1. Use ONLY figures explicitly provided in the context panel. Never compute, \
                    extrapolate, or invent financial values.\n\
                 2. Never cite drivers absent from the data (no new products, pre-orders, \
                    market expansion, or internal projections).\n\
                 3. Engage the Proponent's latest argument directly and point at the specific \
                    figures that weaken it (e.g. the P10 tail).\n\
                 4. Respect the solvency finding — do not claim insolvency the model does not \
                    show, and do not wave away liquidity risk it does show.\n\
                 5. Keep the response to 2–3 professional paragraphs."
            }
        }
    }

    /// System prompt for the convergence judge.
    pub fn judge_system() -> &'static str {
        "You are a neutral debate judge. Compare the two analyst positions and measure how \
         aligned they are on substance (valuation, margins, liquidity, risk).\n\n\
         Your answer MUST use exactly this layout:\n\
         AGREEMENT_SCORE: 0.XX   (0 = total disagreement, 1 = full alignment)\n\
         SUMMARY: one sentence stating the shared position or the core dispute\n\
         AGREEMENTS:\n\
         - one bullet per substantive point both sides accept\n\
         DISAGREEMENTS:\n\
         - one bullet per substantive point still contested"
    }

    /// Render the grounded context panel for one turn.
    pub fn build_turn_prompt(ctx: &TurnContext<'_>) -> String {
        let inc = &ctx.facts.income_statement;
        let agg = ctx.aggregated;
        let mut prompt = String::with_capacity(2000);

        prompt.push_str(&format!("ROUND: {}\n", ctx.round));
        prompt.push_str(&format!("SCENARIO: {}\n\n", ctx.delta));

        prompt.push_str(&format!("BASE FINANCIALS ({}):\n", ctx.facts.period));
        prompt.push_str(&format!("- Revenue: ${:.1}\n", inc.revenue));
        prompt.push_str(&format!("- OpEx: ${:.1}\n", inc.opex));
        prompt.push_str(&format!("- EBITDA: ${:.1}\n", inc.ebitda));
        prompt.push_str(&format!("- Net income: ${:.1}\n", inc.net_income));
        prompt.push_str(&format!("- Cash reserves: ${:.1}\n", ctx.facts.balance_sheet.cash));

        prompt.push_str("\nSIMULATION RESULTS (the only future truth):\n");
        prompt.push_str(&format!(
            "- NPV: P10 ${:.1} | P50 ${:.1} | P90 ${:.1}\n",
            agg.npv.p10, agg.npv.p50, agg.npv.p90
        ));
        prompt.push_str(&format!("- Year-1 median revenue: ${:.1}\n", agg.median_revenue()));
        prompt.push_str(&format!("- Year-1 median EBITDA: ${:.1}\n", agg.median_ebitda()));
        prompt.push_str(&format!("- Year-1 median FCF: ${:.1}\n", agg.median_fcf()));
        prompt.push_str(&format!(
            "- Modeled rates: revenue growth {:.2}%, opex ratio {:.2}%, discount rate {:.2}%\n",
            agg.assumptions.revenue_growth_mean * 100.0,
            agg.assumptions.opex_ratio_mean * 100.0,
            agg.assumptions.discount_rate_mean * 100.0,
        ));

        prompt.push_str(&format!(
            "\nSOLVENCY (deterministic): {} — {}\n",
            ctx.solvency, ctx.solvency.rationale
        ));

        if let Some(opposing) = ctx.opposing_message {
            prompt.push_str(&format!("\nOPPOSING ARGUMENT:\n\"{opposing}\"\n"));
        }
        if !ctx.own_summary.is_empty() {
            prompt.push_str(&format!("\nYOUR PRIOR POSITION (summary): {}\n", ctx.own_summary));
        }
        if let Some(feedback) = &ctx.validator_feedback {
            prompt.push_str(&format!(
                "\n[SYSTEM FEEDBACK]: Your previous response was rejected: {feedback}\n\
                 Rewrite the argument strictly adhering to the figures above.\n"
            ));
        }

        prompt.push_str("\nPresent your argument now.\n");
        prompt
    }

    /// Render the judge prompt over the two latest opposing turns.
    pub fn build_judge_prompt(proponent_message: &str, skeptic_message: &str) -> String {
        format!(
            "PROPONENT POSITION:\n\"{proponent_message}\"\n\n\
             SKEPTIC POSITION:\n\"{skeptic_message}\"\n\n\
             Assess their alignment using the required layout."
        )
    }

    // -----------------------------------------------------------------------
    // Response parsing (shared with the OpenRouter client)
    // -----------------------------------------------------------------------

    /// Parse a judge response: labeled score line plus bullet sections.
    pub fn parse_judge(text: &str) -> Result<JudgeReport> {
        let mut score: Option<f64> = None;
        let mut summary = String::new();

        for line in text.lines() {
            let upper = line.to_uppercase();
            if score.is_none() {
                if let Some(s) = Self::extract_float_after(&upper, "AGREEMENT_SCORE:") {
                    score = Some(s);
                }
            }
            if summary.is_empty() {
                let trimmed = line.trim_start();
                let is_summary = trimmed
                    .get(.."SUMMARY:".len())
                    .is_some_and(|p| p.eq_ignore_ascii_case("SUMMARY:"));
                if is_summary {
                    summary = trimmed["SUMMARY:".len()..].trim().to_string();
                }
            }
        }

        let score = score
            .ok_or_else(|| anyhow::anyhow!("Could not parse AGREEMENT_SCORE from judge response"))?
            .clamp(0.0, 1.0);

        Ok(JudgeReport {
            agreement_score: score,
            agreements: Self::parse_bullet_section(text, "AGREEMENTS"),
            disagreements: Self::parse_bullet_section(text, "DISAGREEMENTS"),
            summary,
        })
    }

    /// Collect "- " / "* " bullets under a heading, stopping at the next
    /// non-bullet, non-empty line.
    fn parse_bullet_section(text: &str, heading: &str) -> Vec<String> {
        let mut items = Vec::new();
        let mut in_section = false;

        for line in text.lines() {
            let trimmed = line.trim();
            let upper = trimmed.to_uppercase();

            if upper.starts_with(heading) {
                in_section = true;
                continue;
            }
            if in_section {
                if let Some(item) = trimmed.strip_prefix("- ").or_else(|| trimmed.strip_prefix("* ")) {
                    if !item.trim().is_empty() {
                        items.push(item.trim().to_string());
                    }
                } else if !trimmed.is_empty() {
                    in_section = false;
                }
            }
        }
        items
    }

    /// Extract a float value after a label like "AGREEMENT_SCORE:".
    fn extract_float_after(text: &str, label: &str) -> Option<f64> {
        let pos = text.find(label)?;
        Self::extract_any_float(&text[pos + label.len()..])
    }

    /// Extract the first float-like value from text; "85%" parses as 0.85.
    fn extract_any_float(text: &str) -> Option<f64> {
        let mut chars = text.chars().peekable();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_digit() || c == '.' {
                let mut num_str = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        num_str.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if let Ok(val) = num_str.parse::<f64>() {
                    let is_percent = chars.peek() == Some(&'%');
                    if is_percent && val > 1.0 && val <= 100.0 {
                        return Some(val / 100.0);
                    }
                    if (0.0..=1.0).contains(&val) {
                        return Some(val);
                    }
                    if val > 1.0 && val <= 100.0 {
                        return Some(val / 100.0);
                    }
                }
            } else {
                chars.next();
            }
        }
        None
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
impl ReasoningModel for AnthropicClient {
    async fn generate_turn(&self, role: DebateRole, ctx: &TurnContext<'_>) -> Result<String> {
        let system = Self::role_system(role);
        let user_msg = Self::build_turn_prompt(ctx);

        debug!(
            role = %role,
            round = ctx.round,
            retry = ctx.validator_feedback.is_some(),
            model = %self.model,
            "Requesting debate turn"
        );

        let (text, tokens, cost) = self.call_api(system, &user_msg).await
            .context("Anthropic turn generation failed")?;

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
        let system = Self::judge_system();
        let user_msg = Self::build_judge_prompt(proponent_message, skeptic_message);

        let (text, tokens, cost) = self.call_api(system, &user_msg).await
            .context("Anthropic judge call failed")?;

        let report = Self::parse_judge(&text)
            .context("Failed to parse judge response")?;

        info!(
            score = format!("{:.2}", report.agreement_score),
            agreements = report.agreements.len(),
            disagreements = report.disagreements.len(),
            tokens,
            cost = format!("${cost:.4}"),
            "Judge assessment complete"
        );

        Ok(report)
    }

    fn cost_per_call(&self) -> f64 {
        // Approximate cost for a typical turn: ~700 input + ~350 output tokens.
        (700.0 / 1000.0) * INPUT_COST_PER_1K + (350.0 / 1000.0) * OUTPUT_COST_PER_1K
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
