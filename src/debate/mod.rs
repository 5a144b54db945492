//! Debate orchestrator — bounded adversarial rounds between the Proponent
//! and Skeptic roles, grounded in the simulation output and the solvency
//! finding.
//!
//! State machine: INIT → ROUND_OPEN(n) → ROUND_CLOSE(n) →
//! {ROUND_OPEN(n+1) | CONVERGED | EXHAUSTED}. The mutable state is owned
//! exclusively by one orchestrating routine per run, so concurrent scenario
//! runs cannot interfere. Both terminal phases freeze into a `DebateResult`;
//! exhaustion is a valid lower-confidence outcome, not an error.
//!
//! Every turn passes through the grounding validator before entering the
//! log. A rejected draft gets one bounded re-generation with the rejection
//! reason appended as feedback; a second failure accepts the turn flagged
//! `unverified` — never discarded, to preserve auditability.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use futures::join;
use tracing::{debug, info, warn};

use crate::config::DebateConfig;
use crate::grounding::GroundingValidator;
use crate::llm::{ReasoningModel, TurnContext};
use crate::types::{
    AggregatedSimulation, ConfidenceLevel, DebateResult, DebateRole, DebateTurn, FinancialFacts,
    ScenarioDelta, ScenarioError, SolvencyFinding,
};

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Orchestrator phases. Terminal: `Converged` or `Exhausted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebatePhase {
    Init,
    RoundOpen(u32),
    RoundClose(u32),
    Converged(u32),
    Exhausted,
}

/// Mutable per-run debate state. Created at debate start, mutated
/// round-by-round, frozen into a `DebateResult` at termination.
struct DebateState {
    phase: DebatePhase,
    log: Vec<DebateTurn>,
    // BTreeSet: deduplicates repeated judge extractions and keeps the
    // frozen output deterministically ordered.
    agreements: BTreeSet<String>,
    disagreements: BTreeSet<String>,
    last_score: Option<f64>,
    last_summary: Option<String>,
    rounds_executed: u32,
}

impl DebateState {
    fn new() -> Self {
        Self {
            phase: DebatePhase::Init,
            log: Vec::new(),
            agreements: BTreeSet::new(),
            disagreements: BTreeSet::new(),
            last_score: None,
            last_summary: None,
            rounds_executed: 0,
        }
    }

    /// Latest accepted message from the given role.
    fn last_message_of(&self, role: DebateRole) -> Option<String> {
        self.log
            .iter()
            .rev()
            .find(|t| t.role == role)
            .map(|t| t.message.clone())
    }

    /// Compressed summary of a role's prior turns (first 120 chars each),
    /// re-injected each round to prevent cross-round amnesia.
    fn summary_of(&self, role: DebateRole) -> String {
        self.log
            .iter()
            .filter(|t| t.role == role)
            .map(|t| t.message.chars().take(120).collect::<String>())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Freeze the state into the immutable result.
    fn freeze(self) -> DebateResult {
        let (converged, convergence_round) = match self.phase {
            DebatePhase::Converged(round) => (true, Some(round)),
            _ => (false, None),
        };
        let consensus_summary = self.last_summary.unwrap_or_else(|| {
            format!(
                "No consensus assessment was produced in {} round(s).",
                self.rounds_executed
            )
        });
        DebateResult {
            log: self.log,
            total_rounds: self.rounds_executed,
            converged,
            convergence_round,
            consensus_summary,
            key_agreements: self.agreements.into_iter().collect(),
            key_disagreements: self.disagreements.into_iter().collect(),
            confidence_level: ConfidenceLevel::from_score(self.last_score),
            final_agreement_score: self.last_score,
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct DebateOrchestrator {
    model: Arc<dyn ReasoningModel>,
    validator: GroundingValidator,
    cfg: DebateConfig,
}

impl DebateOrchestrator {
    pub fn new(model: Arc<dyn ReasoningModel>, validator: GroundingValidator, cfg: DebateConfig) -> Self {
        Self { model, validator, cfg }
    }

    /// Run the bounded debate.
    ///
    /// `on_round_complete` fires after each closed round with the round
    /// number (progress reporting). Convergence is checked from round 2
    /// onward; on convergence later rounds are never executed.
    pub async fn run(
        &self,
        facts: &FinancialFacts,
        aggregated: &AggregatedSimulation,
        solvency: &SolvencyFinding,
        delta: &ScenarioDelta,
        on_round_complete: &mut dyn FnMut(u32),
    ) -> Result<DebateResult, ScenarioError> {
        let mut state = DebateState::new();
        info!(max_rounds = self.cfg.max_rounds, "Debate starting");

        for round in 1..=self.cfg.max_rounds {
            state.phase = DebatePhase::RoundOpen(round);
            debug!(round, "Round open");

            // Within a round the two generations are independent — each role
            // argues against the opposing position from the previous round.
            let pro_opposing = state.last_message_of(DebateRole::Skeptic);
            let ske_opposing = state.last_message_of(DebateRole::Proponent);
            let pro_summary = state.summary_of(DebateRole::Proponent);
            let ske_summary = state.summary_of(DebateRole::Skeptic);

            let (pro_turn, ske_turn) = join!(
                self.produce_turn(
                    DebateRole::Proponent,
                    round,
                    facts,
                    aggregated,
                    solvency,
                    delta,
                    pro_opposing,
                    pro_summary,
                ),
                self.produce_turn(
                    DebateRole::Skeptic,
                    round,
                    facts,
                    aggregated,
                    solvency,
                    delta,
                    ske_opposing,
                    ske_summary,
                ),
            );
            let pro_turn = pro_turn?;
            let ske_turn = ske_turn?;

            state.log.push(pro_turn.clone());
            state.log.push(ske_turn.clone());
            state.rounds_executed = round;
            state.phase = DebatePhase::RoundClose(round);

            // Convergence is judged from round 2 onward, never in round 1.
            if round >= 2 {
                let report = self
                    .model
                    .judge(&pro_turn.message, &ske_turn.message)
                    .await
                    .map_err(|e| ScenarioError::AgentUnavailable {
                        capability: "judge".to_string(),
                        message: e.to_string(),
                    })?;

                state.agreements.extend(report.agreements);
                state.disagreements.extend(report.disagreements);
                state.last_score = Some(report.agreement_score);
                if !report.summary.is_empty() {
                    state.last_summary = Some(report.summary);
                }

                if report.agreement_score >= self.cfg.convergence_threshold {
                    state.phase = DebatePhase::Converged(round);
                    info!(
                        round,
                        score = format!("{:.2}", report.agreement_score),
                        "Debate converged"
                    );
                    on_round_complete(round);
                    break;
                }
                debug!(
                    round,
                    score = format!("{:.2}", report.agreement_score),
                    threshold = self.cfg.convergence_threshold,
                    "No convergence yet"
                );
            }

            on_round_complete(round);
        }

        if !matches!(state.phase, DebatePhase::Converged(_)) {
            state.phase = DebatePhase::Exhausted;
            info!(rounds = state.rounds_executed, "Debate exhausted without convergence");
        }

        Ok(state.freeze())
    }

    /// Generate one turn: draft → validate → at most `turn_retry_limit`
    /// feedback re-generations → accept (flagged unverified if the last
    /// draft still fails).
    #[allow(clippy::too_many_arguments)]
    async fn produce_turn(
        &self,
        role: DebateRole,
        round: u32,
        facts: &FinancialFacts,
        aggregated: &AggregatedSimulation,
        solvency: &SolvencyFinding,
        delta: &ScenarioDelta,
        opposing_message: Option<String>,
        own_summary: String,
    ) -> Result<DebateTurn, ScenarioError> {
        let mut feedback: Option<String> = None;
        let mut attempts = 0u32;

        loop {
            let ctx = TurnContext {
                round,
                facts,
                aggregated,
                solvency,
                delta,
                opposing_message: opposing_message.as_deref(),
                own_summary: own_summary.clone(),
                validator_feedback: feedback.clone(),
            };

            let message = self
                .model
                .generate_turn(role, &ctx)
                .await
                .map_err(|e| ScenarioError::AgentUnavailable {
                    capability: format!("{role} turn generation"),
                    message: e.to_string(),
                })?;

            let outcome = self.validator.validate(&message, aggregated, facts, solvency);
            if outcome.accepted {
                return Ok(DebateTurn {
                    round_number: round,
                    role,
                    message,
                    cited_facts: outcome.cited,
                    verified: true,
                    timestamp: Utc::now(),
                });
            }

            let reason = outcome.reason.unwrap_or_else(|| "validation failed".to_string());
            if attempts >= self.cfg.turn_retry_limit {
                // Never discard: the flagged turn stays in the log for audit.
                warn!(role = %role, round, reason = %reason, "Accepting unverified turn after failed retry");
                return Ok(DebateTurn {
                    round_number: round,
                    role,
                    message,
                    cited_facts: Vec::new(),
                    verified: false,
                    timestamp: Utc::now(),
                });
            }

            attempts += 1;
            debug!(role = %role, round, attempt = attempts, reason = %reason, "Turn rejected — regenerating with feedback");
            feedback = Some(reason);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidationConfig;
    use crate::llm::JudgeReport;
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::types::{AssumptionSummary, PercentileBand};

    /// Scripted reasoning backend: valid turns quote the fixture's NPV P50,
    /// bad turns quote a fabricated figure. Judge scores play back from a
    /// fixed list.
    struct MockModel {
        judge_scores: Vec<f64>,
        judge_calls: AtomicUsize,
        turn_calls: AtomicUsize,
        /// Produce an ungrounded draft on every first attempt.
        bad_first_drafts: bool,
        /// Produce ungrounded drafts on every attempt.
        always_bad: bool,
        fail_turns: bool,
        fail_judge: bool,
    }

    impl MockModel {
        fn scripted(judge_scores: Vec<f64>) -> Self {
            Self {
                judge_scores,
                judge_calls: AtomicUsize::new(0),
                turn_calls: AtomicUsize::new(0),
                bad_first_drafts: false,
                always_bad: false,
                fail_turns: false,
                fail_judge: false,
            }
        }
    }

    #[async_trait]
    impl ReasoningModel for MockModel {
        async fn generate_turn(&self, role: DebateRole, ctx: &TurnContext<'_>) -> AnyResult<String> {
            self.turn_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_turns {
                anyhow::bail!("HTTP 529: overloaded");
            }
            let first_attempt = ctx.validator_feedback.is_none();
            if self.always_bad || (self.bad_first_drafts && first_attempt) {
                return Ok("This hinges on an NPV of $999999.".to_string());
            }
            Ok(format!("{role} argues in round {} from an NPV of $230.", ctx.round))
        }

        async fn judge(&self, _p: &str, _s: &str) -> AnyResult<JudgeReport> {
            if self.fail_judge {
                anyhow::bail!("HTTP 500");
            }
            let i = self.judge_calls.fetch_add(1, Ordering::SeqCst);
            let score = self.judge_scores.get(i).copied().unwrap_or(0.3);
            Ok(JudgeReport {
                agreement_score: score,
                agreements: vec!["NPV is positive".to_string()],
                disagreements: vec!["tail risk weighting".to_string()],
                summary: format!("score {score}"),
            })
        }

        fn cost_per_call(&self) -> f64 {
            0.0
        }

        fn model_name(&self) -> &str {
            "mock"
        }
    }

    fn aggregated() -> AggregatedSimulation {
        let band = |p50: f64| PercentileBand { p10: p50 * 0.9, p50, p90: p50 * 1.1 };
        AggregatedSimulation {
            iterations: 1000,
            valid_trajectories: 1000,
            excluded_trajectories: 0,
            horizon_years: 5,
            npv: PercentileBand { p10: 180.0, p50: 230.0, p90: 280.0 },
            revenue_by_year: (1..=5).map(|y| band(100.0 * 1.05f64.powi(y))).collect(),
            ebitda_by_year: (1..=5).map(|y| band(30.0 * 1.05f64.powi(y))).collect(),
            fcf_by_year: (1..=5).map(|y| band(13.75 * 1.05f64.powi(y))).collect(),
            assumptions: AssumptionSummary {
                revenue_growth_mean: 0.05,
                opex_ratio_mean: 0.30,
                tax_rate_mean: 0.25,
                discount_rate_mean: 0.08,
                terminal_growth: 0.02,
            },
            assumption_log: vec![],
        }
    }

    fn solvency() -> SolvencyFinding {
        SolvencyFinding {
            is_solvent_per_model: true,
            cash_runway_years: f64::INFINITY,
            rationale: "P50 FCF non-negative in all forecast years".to_string(),
        }
    }

    fn orchestrator(model: MockModel, cfg: DebateConfig) -> (DebateOrchestrator, Arc<MockModel>) {
        let model = Arc::new(model);
        let orch = DebateOrchestrator::new(
            model.clone(),
            GroundingValidator::new(ValidationConfig::default()),
            cfg,
        );
        (orch, model)
    }

    async fn run(orch: &DebateOrchestrator) -> Result<(DebateResult, Vec<u32>), ScenarioError> {
        let facts = FinancialFacts::sample();
        let agg = aggregated();
        let sol = solvency();
        let delta = ScenarioDelta::default();
        let mut rounds = Vec::new();
        let result = orch
            .run(&facts, &agg, &sol, &delta, &mut |r| rounds.push(r))
            .await?;
        Ok((result, rounds))
    }

    #[tokio::test]
    async fn test_converges_at_round_two_and_stops() {
        let (orch, model) = orchestrator(
            MockModel::scripted(vec![0.85]),
            DebateConfig::default(),
        );
        let (result, rounds) = run(&orch).await.unwrap();

        assert!(result.converged);
        assert_eq!(result.convergence_round, Some(2));
        assert_eq!(result.total_rounds, 2);
        assert_eq!(result.confidence_level, ConfidenceLevel::High);
        // Rounds 3+ never execute: 2 rounds × 2 roles = 4 turn calls, 1 judge.
        assert_eq!(model.turn_calls.load(Ordering::SeqCst), 4);
        assert_eq!(model.judge_calls.load(Ordering::SeqCst), 1);
        assert_eq!(rounds, vec![1, 2]);
        assert_eq!(result.log.len(), 4);
    }

    #[tokio::test]
    async fn test_exhausts_at_max_rounds() {
        let (orch, model) = orchestrator(
            MockModel::scripted(vec![0.3, 0.4]),
            DebateConfig { max_rounds: 3, ..DebateConfig::default() },
        );
        let (result, rounds) = run(&orch).await.unwrap();

        assert!(!result.converged);
        assert!(result.convergence_round.is_none());
        assert_eq!(result.total_rounds, 3);
        // Judged in rounds 2 and 3 only.
        assert_eq!(model.judge_calls.load(Ordering::SeqCst), 2);
        assert_eq!(rounds, vec![1, 2, 3]);
        assert_eq!(result.confidence_level, ConfidenceLevel::Low);
        assert!(!result.key_disagreements.is_empty());
    }

    #[tokio::test]
    async fn test_never_judges_round_one() {
        let (orch, model) = orchestrator(
            MockModel::scripted(vec![]),
            DebateConfig { max_rounds: 1, ..DebateConfig::default() },
        );
        let (result, _) = run(&orch).await.unwrap();

        assert_eq!(model.judge_calls.load(Ordering::SeqCst), 0);
        assert!(!result.converged);
        assert_eq!(result.total_rounds, 1);
        assert!(result.final_agreement_score.is_none());
        assert!(result.consensus_summary.contains("No consensus"));
    }

    #[tokio::test]
    async fn test_medium_confidence_from_mid_score() {
        let (orch, _) = orchestrator(
            MockModel::scripted(vec![0.6]),
            DebateConfig { max_rounds: 2, ..DebateConfig::default() },
        );
        let (result, _) = run(&orch).await.unwrap();
        assert!(!result.converged);
        assert_eq!(result.confidence_level, ConfidenceLevel::Medium);
        assert_eq!(result.final_agreement_score, Some(0.6));
    }

    #[tokio::test]
    async fn test_rejected_draft_retried_with_feedback() {
        let mut model = MockModel::scripted(vec![0.85]);
        model.bad_first_drafts = true;
        let (orch, model) = orchestrator(model, DebateConfig::default());
        let (result, _) = run(&orch).await.unwrap();

        // Every accepted turn is the regenerated, grounded draft.
        assert!(result.log.iter().all(|t| t.verified));
        assert!(result.log.iter().all(|t| t.message.contains("$230")));
        // 2 rounds × 2 roles × 2 attempts each.
        assert_eq!(model.turn_calls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_double_rejection_accepts_unverified() {
        let mut model = MockModel::scripted(vec![0.85]);
        model.always_bad = true;
        let (orch, _) = orchestrator(model, DebateConfig::default());
        let (result, _) = run(&orch).await.unwrap();

        // Turns are kept, flagged, never discarded.
        assert!(result.log.iter().all(|t| !t.verified));
        assert!(result.log.iter().all(|t| t.cited_facts.is_empty()));
        assert!(!result.log.is_empty());
    }

    #[tokio::test]
    async fn test_turn_failure_is_agent_unavailable() {
        let mut model = MockModel::scripted(vec![]);
        model.fail_turns = true;
        let (orch, _) = orchestrator(model, DebateConfig::default());
        let err = run(&orch).await.unwrap_err();
        match err {
            ScenarioError::AgentUnavailable { capability, message } => {
                assert!(capability.contains("turn generation"));
                assert!(message.contains("529"));
            }
            other => panic!("expected AgentUnavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_judge_failure_is_agent_unavailable() {
        let mut model = MockModel::scripted(vec![]);
        model.fail_judge = true;
        let (orch, _) = orchestrator(model, DebateConfig::default());
        let err = run(&orch).await.unwrap_err();
        match err {
            ScenarioError::AgentUnavailable { capability, .. } => {
                assert_eq!(capability, "judge");
            }
            other => panic!("expected AgentUnavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_agreements_deduplicated_across_rounds() {
        // The judge repeats the same extractions every round; the frozen
        // result carries each once.
        let (orch, _) = orchestrator(
            MockModel::scripted(vec![0.3, 0.4, 0.5, 0.6]),
            DebateConfig { max_rounds: 5, ..DebateConfig::default() },
        );
        let (result, _) = run(&orch).await.unwrap();
        assert_eq!(result.key_agreements, vec!["NPV is positive".to_string()]);
        assert_eq!(result.key_disagreements, vec!["tail risk weighting".to_string()]);
    }

    #[tokio::test]
    async fn test_cited_facts_carried_onto_turns() {
        let (orch, _) = orchestrator(MockModel::scripted(vec![0.85]), DebateConfig::default());
        let (result, _) = run(&orch).await.unwrap();
        assert!(result.log.iter().all(|t| t.cited_facts.contains(&"NPV P50".to_string())));
    }
}
