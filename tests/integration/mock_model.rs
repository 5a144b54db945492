//! Mock reasoning model for integration testing.
//!
//! Provides a deterministic `ReasoningModel` implementation that returns
//! grounded turns quoting the simulation's own figures, plays judge scores
//! back from a script, and can be forced into error states — all in-memory
//! with no external dependencies.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use counterfactual::llm::{JudgeReport, ReasoningModel, TurnContext};
use counterfactual::types::DebateRole;

/// A scripted reasoning backend for deterministic testing.
///
/// Turns quote the median NPV from the supplied context, so they always
/// pass grounding validation. Judge calls consume `judge_scores` in order;
/// once exhausted, further calls report 0.3 (no convergence).
pub struct MockReasoningModel {
    judge_scores: Vec<f64>,
    pub judge_calls: AtomicUsize,
    pub turn_calls: AtomicUsize,
    /// If set, all turn generations return this error.
    force_turn_error: Mutex<Option<String>>,
    /// If set, all judge calls return this error.
    force_judge_error: Mutex<Option<String>>,
}

impl MockReasoningModel {
    pub fn new(judge_scores: Vec<f64>) -> Self {
        Self {
            judge_scores,
            judge_calls: AtomicUsize::new(0),
            turn_calls: AtomicUsize::new(0),
            force_turn_error: Mutex::new(None),
            force_judge_error: Mutex::new(None),
        }
    }

    /// Force all subsequent turn generations to fail.
    pub fn set_turn_error(&self, msg: &str) {
        *self.force_turn_error.lock().unwrap() = Some(msg.to_string());
    }

    /// Force all subsequent judge calls to fail.
    pub fn set_judge_error(&self, msg: &str) {
        *self.force_judge_error.lock().unwrap() = Some(msg.to_string());
    }
}

#[async_trait]
impl ReasoningModel for MockReasoningModel {
    async fn generate_turn(&self, role: DebateRole, ctx: &TurnContext<'_>) -> Result<String> {
        self.turn_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(msg) = self.force_turn_error.lock().unwrap().clone() {
            anyhow::bail!(msg);
        }
        // Quote the engine's own median NPV so validation always passes.
        Ok(format!(
            "{role} view, round {}: the scenario's median NPV of ${:.1} anchors my case.",
            ctx.round,
            ctx.aggregated.npv.p50,
        ))
    }

    async fn judge(&self, _proponent: &str, _skeptic: &str) -> Result<JudgeReport> {
        if let Some(msg) = self.force_judge_error.lock().unwrap().clone() {
            anyhow::bail!(msg);
        }
        let i = self.judge_calls.fetch_add(1, Ordering::SeqCst);
        let score = self.judge_scores.get(i).copied().unwrap_or(0.3);
        Ok(JudgeReport {
            agreement_score: score,
            agreements: vec!["the median NPV is the right anchor".to_string()],
            disagreements: vec!["weight of the downside tail".to_string()],
            summary: format!("agreement at {score:.2}"),
        })
    }

    fn cost_per_call(&self) -> f64 {
        0.0
    }

    fn model_name(&self) -> &str {
        "mock-reasoning-model"
    }
}
