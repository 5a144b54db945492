//! End-to-end pipeline tests: simulate → gate → debate → verdict against
//! the mock reasoning model.

use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use counterfactual::config::{DebateConfig, SimulationConfig, ValidationConfig};
use counterfactual::engine::ScenarioPipeline;
use counterfactual::storage::ScenarioStore;
use counterfactual::types::{
    BalanceSheet, CashFlowStatement, CriticVerdict, FinancialFacts, HistoricalSeries,
    IncomeStatement, ScenarioDelta, ScenarioError, ScenarioStatus,
};

use crate::mock_model::MockReasoningModel;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Base facts: revenue 100, flat 5% historical growth, 30% opex ratio,
/// 25% tax, 8% WACC, cash 20.
fn sample_facts() -> FinancialFacts {
    let mut kpis = BTreeMap::new();
    kpis.insert("wacc".to_string(), 0.08);
    FinancialFacts {
        period: "FY2025".to_string(),
        income_statement: IncomeStatement {
            revenue: 100.0,
            cogs: 40.0,
            gross_profit: 60.0,
            opex: 30.0,
            ebitda: 30.0,
            depreciation_amortization: 5.0,
            ebit: 25.0,
            interest_expense: 2.0,
            taxes: 6.25,
            net_income: 16.75,
        },
        balance_sheet: BalanceSheet {
            total_assets: 120.0,
            total_liabilities: 70.0,
            total_equity: 50.0,
            cash: 20.0,
        },
        cash_flow: CashFlowStatement {
            cash_from_operations: 20.0,
            capex: 8.0,
            change_in_working_capital: 2.0,
            net_change_in_cash: 5.0,
        },
        history: HistoricalSeries {
            revenue: vec![
                100.0 / 1.05f64.powi(3),
                100.0 / 1.05f64.powi(2),
                100.0 / 1.05,
                100.0,
            ],
            opex: vec![
                30.0 / 1.05f64.powi(3),
                30.0 / 1.05f64.powi(2),
                30.0 / 1.05,
                30.0,
            ],
            effective_tax_rate: vec![0.25, 0.25, 0.25, 0.25],
            discount_rate: vec![0.08, 0.08, 0.08],
        },
        kpis,
    }
}

fn temp_store() -> ScenarioStore {
    let mut dir = std::env::temp_dir();
    dir.push(format!("counterfactual_it_{}", Uuid::new_v4()));
    ScenarioStore::new(dir)
}

fn pipeline(
    model: Arc<MockReasoningModel>,
    iterations: usize,
    max_rounds: u32,
) -> ScenarioPipeline {
    ScenarioPipeline::new(
        SimulationConfig { iterations, ..SimulationConfig::default() },
        DebateConfig { max_rounds, ..DebateConfig::default() },
        ValidationConfig::default(),
        model,
        temp_store(),
    )
}

/// The deterministic baseline DCF for the sample facts: 5% growth, 0.1375
/// FCF margin, 8% discount, 2% terminal growth.
fn analytic_baseline_npv() -> f64 {
    let (g, r, g_lr): (f64, f64, f64) = (0.05, 0.08, 0.02);
    let fcf_margin = 0.25 * (1.0 - 0.25) + 0.05 - 0.08 - 0.02;
    let mut rev = 100.0;
    let mut npv = 0.0;
    let mut last_fcf = 0.0;
    for t in 1..=5 {
        rev *= 1.0 + g;
        last_fcf = rev * fcf_margin;
        npv += last_fcf / (1.0 + r).powi(t);
    }
    npv + last_fcf * (1.0 + g_lr) / (r - g_lr) / (1.0 + r).powi(5)
}

// ---------------------------------------------------------------------------
// Scenario A: no change — median NPV matches the pure baseline DCF
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_a_baseline_matches_dcf() {
    let model = Arc::new(MockReasoningModel::new(vec![0.85]));
    let pipeline = pipeline(model, 10_000, 5);
    let id = Uuid::new_v4();

    let verdict = pipeline
        .run_scenario_analysis(id, &sample_facts(), &ScenarioDelta::default(), 42)
        .await
        .unwrap();

    let record = pipeline.store().load(id).unwrap().unwrap();
    assert_eq!(record.status, ScenarioStatus::Completed);
    assert_eq!(record.progress, 100);

    let aggregated = record.aggregated.expect("aggregated persisted");
    let expected = analytic_baseline_npv();
    let rel_err = (aggregated.npv.p50 - expected).abs() / expected;
    assert!(
        rel_err < 0.02,
        "median NPV {} vs analytic baseline {expected}",
        aggregated.npv.p50
    );

    // Positive NPV, solvent, converged debate → approved Buy.
    assert_eq!(verdict.critic_verdict, CriticVerdict::Approve);
    assert_eq!(verdict.final_label, "Buy");

    let solvency = record.solvency.expect("solvency persisted");
    assert!(solvency.is_solvent_per_model);
    assert!(solvency.cash_runway_years.is_infinite());
}

// ---------------------------------------------------------------------------
// Scenario B: cost cutting raises median EBITDA
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_b_opex_cut_raises_median_ebitda() {
    let model = Arc::new(MockReasoningModel::new(vec![0.85, 0.85]));
    let pipeline = pipeline(model, 5_000, 5);
    let facts = sample_facts();

    let base_id = Uuid::new_v4();
    let cut_id = Uuid::new_v4();
    pipeline
        .run_scenario_analysis(base_id, &facts, &ScenarioDelta::default(), 42)
        .await
        .unwrap();
    pipeline
        .run_scenario_analysis(
            cut_id,
            &facts,
            &ScenarioDelta { opex_delta_bps: -500, ..Default::default() },
            42,
        )
        .await
        .unwrap();

    let base = pipeline.store().load(base_id).unwrap().unwrap().aggregated.unwrap();
    let cut = pipeline.store().load(cut_id).unwrap().unwrap().aggregated.unwrap();
    assert!(cut.median_ebitda() > base.median_ebitda());
}

// ---------------------------------------------------------------------------
// Scenario C: discount rate pushed under terminal growth → degenerate model
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_c_degenerate_discount_rate_fails() {
    let model = Arc::new(MockReasoningModel::new(vec![]));
    let pipeline = pipeline(model.clone(), 1_000, 5);
    let id = Uuid::new_v4();

    let err = pipeline
        .run_scenario_analysis(
            id,
            &sample_facts(),
            &ScenarioDelta { discount_rate_delta_bps: -700, ..Default::default() },
            42,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ScenarioError::DegenerateModel { .. }));

    // Failure is persisted with its kind; the debate never started.
    let record = pipeline.store().load(id).unwrap().unwrap();
    assert_eq!(record.status, ScenarioStatus::Failed);
    assert_eq!(record.error_kind.as_deref(), Some("degenerate_model"));
    assert!(record.aggregated.is_none());
    assert_eq!(model.turn_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// Scenario D: judge score 0.85 in round 2 → convergence, no round 3
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_d_converges_in_round_two() {
    let model = Arc::new(MockReasoningModel::new(vec![0.85]));
    let pipeline = pipeline(model.clone(), 1_000, 5);
    let id = Uuid::new_v4();

    pipeline
        .run_scenario_analysis(id, &sample_facts(), &ScenarioDelta::default(), 42)
        .await
        .unwrap();

    let debate = pipeline.store().load(id).unwrap().unwrap().debate.unwrap();
    assert!(debate.converged);
    assert_eq!(debate.convergence_round, Some(2));
    assert_eq!(debate.total_rounds, 2);
    // 2 rounds × 2 roles; rounds 3+ never executed.
    assert_eq!(model.turn_calls.load(std::sync::atomic::Ordering::SeqCst), 4);
    assert_eq!(model.judge_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Determinism
// ---------------------------------------------------------------------------

#[tokio::test]
async fn same_seed_produces_bit_identical_simulation() {
    let model = Arc::new(MockReasoningModel::new(vec![0.85, 0.85]));
    let pipeline = pipeline(model, 2_000, 5);
    let facts = sample_facts();

    let id_a = Uuid::new_v4();
    let id_b = Uuid::new_v4();
    pipeline
        .run_scenario_analysis(id_a, &facts, &ScenarioDelta::default(), 7)
        .await
        .unwrap();
    pipeline
        .run_scenario_analysis(id_b, &facts, &ScenarioDelta::default(), 7)
        .await
        .unwrap();

    let a = pipeline.store().load(id_a).unwrap().unwrap().aggregated.unwrap();
    let b = pipeline.store().load(id_b).unwrap().unwrap().aggregated.unwrap();
    assert_eq!(
        serde_json::to_string(&a).unwrap(),
        serde_json::to_string(&b).unwrap(),
    );
}

// ---------------------------------------------------------------------------
// Concurrency guard
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_in_flight_trigger_rejected() {
    let model = Arc::new(MockReasoningModel::new(vec![0.85, 0.85]));
    let pipeline = pipeline(model, 5_000, 5);
    let facts = sample_facts();
    let id = Uuid::new_v4();

    let delta = ScenarioDelta::default();
    let (first, second) = tokio::join!(
        pipeline.run_scenario_analysis(id, &facts, &delta, 42),
        pipeline.run_scenario_analysis(id, &facts, &delta, 42),
    );

    // Exactly one run proceeds; the other is rejected up front.
    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    let rejected = outcomes
        .iter()
        .find_map(|r| r.as_ref().err())
        .expect("one trigger rejected");
    assert!(matches!(rejected, ScenarioError::ScenarioInFlight(rid) if *rid == id));
    assert!(rejected.is_retriable());
}

#[tokio::test]
async fn same_id_can_rerun_after_completion() {
    let model = Arc::new(MockReasoningModel::new(vec![0.85, 0.85]));
    let pipeline = pipeline(model, 1_000, 5);
    let facts = sample_facts();
    let id = Uuid::new_v4();

    pipeline
        .run_scenario_analysis(id, &facts, &ScenarioDelta::default(), 42)
        .await
        .unwrap();
    // The in-flight slot was released; a rerun is allowed.
    pipeline
        .run_scenario_analysis(id, &facts, &ScenarioDelta::default(), 42)
        .await
        .unwrap();
}

// ---------------------------------------------------------------------------
// Partial results survive a failed debate phase
// ---------------------------------------------------------------------------

#[tokio::test]
async fn aggregated_retrievable_after_debate_failure() {
    let model = Arc::new(MockReasoningModel::new(vec![]));
    model.set_judge_error("HTTP 529: overloaded");
    let pipeline = pipeline(model, 1_000, 5);
    let id = Uuid::new_v4();

    let err = pipeline
        .run_scenario_analysis(id, &sample_facts(), &ScenarioDelta::default(), 42)
        .await
        .unwrap_err();
    assert!(matches!(err, ScenarioError::AgentUnavailable { .. }));
    assert!(err.is_retriable());

    // The simulation phase's output is still there for the caller.
    let record = pipeline.store().load(id).unwrap().unwrap();
    assert_eq!(record.status, ScenarioStatus::Failed);
    assert_eq!(record.error_kind.as_deref(), Some("agent_unavailable"));
    assert!(record.aggregated.is_some());
    assert!(record.solvency.is_some());
    assert!(record.verdict.is_none());
    // Simulation phase completed → progress reached its 50% share.
    assert!(record.progress >= 50);
}

#[tokio::test]
async fn turn_generation_failure_is_agent_unavailable() {
    let model = Arc::new(MockReasoningModel::new(vec![]));
    model.set_turn_error("connection reset");
    let pipeline = pipeline(model, 500, 5);
    let id = Uuid::new_v4();

    let err = pipeline
        .run_scenario_analysis(id, &sample_facts(), &ScenarioDelta::default(), 42)
        .await
        .unwrap_err();
    match err {
        ScenarioError::AgentUnavailable { capability, message } => {
            assert!(capability.contains("turn generation"));
            assert!(message.contains("connection reset"));
        }
        other => panic!("expected AgentUnavailable, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Exhaustion path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exhausted_debate_completes_with_low_confidence() {
    // Judge never reaches the threshold: the run still completes.
    let model = Arc::new(MockReasoningModel::new(vec![0.3, 0.3, 0.3, 0.3]));
    let pipeline = pipeline(model.clone(), 1_000, 3);
    let id = Uuid::new_v4();

    let verdict = pipeline
        .run_scenario_analysis(id, &sample_facts(), &ScenarioDelta::default(), 42)
        .await
        .unwrap();

    let record = pipeline.store().load(id).unwrap().unwrap();
    assert_eq!(record.status, ScenarioStatus::Completed);
    let debate = record.debate.unwrap();
    assert!(!debate.converged);
    assert_eq!(debate.total_rounds, 3);
    assert!(debate.convergence_round.is_none());
    // Unconverged but healthy numbers → cautious approval.
    assert_eq!(verdict.critic_verdict, CriticVerdict::Approve);
    assert_eq!(verdict.final_label, "Cautious Buy");
}
