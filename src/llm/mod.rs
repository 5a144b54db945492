//! Reasoning-capability integration for the debate layer.
//!
//! Defines the `ReasoningModel` trait — role-conditioned turn generation and
//! convergence judging — and provides implementations for Claude (Anthropic)
//! and OpenRouter. The natural-language capability itself is opaque: the
//! engine depends only on this narrow contract, and the grounding rules must
//! hold regardless of which backend answers.

pub mod anthropic;
pub mod openrouter;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{AggregatedSimulation, DebateRole, FinancialFacts, ScenarioDelta, SolvencyFinding};

/// Structured context handed to a role for one turn: the only data the role
/// is allowed to argue from, plus optional validator feedback on a rejected
/// draft.
pub struct TurnContext<'a> {
    pub round: u32,
    pub facts: &'a FinancialFacts,
    pub aggregated: &'a AggregatedSimulation,
    pub solvency: &'a SolvencyFinding,
    pub delta: &'a ScenarioDelta,
    /// Latest accepted message from the opposing role, if any.
    pub opposing_message: Option<&'a str>,
    /// Compressed summary of this role's own prior turns (prevents amnesia
    /// across rounds without resending the full transcript).
    pub own_summary: String,
    /// Rejection reason from the grounding validator, set on regeneration.
    pub validator_feedback: Option<String>,
}

/// Judge output: agreement score plus extracted positions.
#[derive(Debug, Clone)]
pub struct JudgeReport {
    /// Agreement between the two latest turns, in [0, 1].
    pub agreement_score: f64,
    pub agreements: Vec<String>,
    pub disagreements: Vec<String>,
    pub summary: String,
}

/// Abstraction over debate reasoning backends.
///
/// Implementors send the structured context to a text-completion service and
/// return a natural-language turn, or compare two turns and report an
/// agreement score. Transient transport failures are retried internally with
/// bounded backoff; a returned error means retries are exhausted.
#[async_trait]
pub trait ReasoningModel: Send + Sync {
    /// Produce one grounded argument for the given role.
    async fn generate_turn(&self, role: DebateRole, ctx: &TurnContext<'_>) -> Result<String>;

    /// Compare the two latest opposing turns and report agreement.
    async fn judge(&self, proponent_message: &str, skeptic_message: &str) -> Result<JudgeReport>;

    /// Cost per individual API call in USD.
    fn cost_per_call(&self) -> f64;

    /// Model identifier string.
    fn model_name(&self) -> &str;
}
