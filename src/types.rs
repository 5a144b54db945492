//! Shared types for the COUNTERFACTUAL engine.
//!
//! These types form the data model used across all modules: the immutable
//! financial facts, scenario deltas, simulation output, solvency finding,
//! debate records, and the terminal verdict. They are designed to be stable
//! so that the model, simulator, debate, and engine modules can depend on
//! them without circular references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Financial facts
// ---------------------------------------------------------------------------

/// Income statement for the base period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomeStatement {
    pub revenue: f64,
    pub cogs: f64,
    pub gross_profit: f64,
    pub opex: f64,
    pub ebitda: f64,
    pub depreciation_amortization: f64,
    pub ebit: f64,
    pub interest_expense: f64,
    pub taxes: f64,
    pub net_income: f64,
}

impl IncomeStatement {
    /// Gross margin (0.0–1.0). Zero if revenue is non-positive.
    pub fn gross_margin(&self) -> f64 {
        if self.revenue > 0.0 {
            self.gross_profit / self.revenue
        } else {
            0.0
        }
    }

    /// EBITDA margin. Zero if revenue is non-positive.
    pub fn ebitda_margin(&self) -> f64 {
        if self.revenue > 0.0 {
            self.ebitda / self.revenue
        } else {
            0.0
        }
    }
}

/// Balance sheet snapshot (totals only — line items stay in the extraction
/// layer, which is outside this crate).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSheet {
    pub total_assets: f64,
    pub total_liabilities: f64,
    pub total_equity: f64,
    /// Cash and equivalents — the numerator of the solvency runway.
    pub cash: f64,
}

impl BalanceSheet {
    /// Accounting identity residual: Assets − (Liabilities + Equity).
    pub fn identity_gap(&self) -> f64 {
        self.total_assets - (self.total_liabilities + self.total_equity)
    }
}

/// Cash-flow statement for the base period. `capex` and
/// `change_in_working_capital` are outflow magnitudes (positive = cash out).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashFlowStatement {
    pub cash_from_operations: f64,
    pub capex: f64,
    pub change_in_working_capital: f64,
    pub net_change_in_cash: f64,
}

/// Per-period historical observations, oldest first, base period last.
/// Every distribution in the simulator is anchored to these series — the
/// volatility parameters are derived from their variance, never hand-picked.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HistoricalSeries {
    pub revenue: Vec<f64>,
    pub opex: Vec<f64>,
    pub effective_tax_rate: Vec<f64>,
    pub discount_rate: Vec<f64>,
}

/// Immutable snapshot of a company's reported statements for a base period.
/// Created once at ingestion (external); read-only to this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialFacts {
    /// Reporting period label, e.g. "FY2025".
    pub period: String,
    pub income_statement: IncomeStatement,
    pub balance_sheet: BalanceSheet,
    pub cash_flow: CashFlowStatement,
    pub history: HistoricalSeries,
    /// Named KPIs from the extraction layer (e.g. "wacc").
    /// BTreeMap keeps iteration and serialization order stable.
    pub kpis: BTreeMap<String, f64>,
}

impl fmt::Display for FinancialFacts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] revenue=${:.0} ebitda=${:.0} cash=${:.0} ({} historical periods)",
            self.period,
            self.income_statement.revenue,
            self.income_statement.ebitda,
            self.balance_sheet.cash,
            self.history.revenue.len(),
        )
    }
}

impl FinancialFacts {
    /// Helper to build consistent sample facts for unit tests: flat 5%
    /// historical revenue growth, 30% opex ratio, 25% tax, 8% WACC.
    #[cfg(test)]
    pub fn sample() -> Self {
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
}

// ---------------------------------------------------------------------------
// Scenario delta
// ---------------------------------------------------------------------------

/// A proposed what-if change, in signed basis points. Conventionally bounded
/// to ±500 bps by callers, but the engine enforces only the policy bound
/// (see `SimulationConfig::max_delta_bps`) and rejects anything beyond it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ScenarioDelta {
    pub revenue_growth_delta_bps: i32,
    pub opex_delta_bps: i32,
    pub discount_rate_delta_bps: i32,
}

impl fmt::Display for ScenarioDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "growth{:+}bps opex{:+}bps discount{:+}bps",
            self.revenue_growth_delta_bps, self.opex_delta_bps, self.discount_rate_delta_bps,
        )
    }
}

impl ScenarioDelta {
    /// Largest delta magnitude across all three axes.
    pub fn max_magnitude_bps(&self) -> i32 {
        self.revenue_growth_delta_bps
            .abs()
            .max(self.opex_delta_bps.abs())
            .max(self.discount_rate_delta_bps.abs())
    }
}

// ---------------------------------------------------------------------------
// Simulation output
// ---------------------------------------------------------------------------

/// P10/P50/P90 summary of one distribution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PercentileBand {
    pub p10: f64,
    pub p50: f64,
    pub p90: f64,
}

impl PercentileBand {
    /// Whether the band satisfies the ordering invariant P10 ≤ P50 ≤ P90.
    pub fn is_ordered(&self) -> bool {
        self.p10 <= self.p50 && self.p50 <= self.p90
    }
}

impl fmt::Display for PercentileBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P10={:.1} P50={:.1} P90={:.1}", self.p10, self.p50, self.p90)
    }
}

/// Resolved distribution means and structural assumptions, embedded in the
/// simulation output so downstream validators can check rate claims without
/// re-deriving the model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AssumptionSummary {
    pub revenue_growth_mean: f64,
    pub opex_ratio_mean: f64,
    pub tax_rate_mean: f64,
    pub discount_rate_mean: f64,
    pub terminal_growth: f64,
}

/// Reduction over all Monte Carlo trajectories: per-year percentile bands for
/// revenue/EBITDA/FCF, NPV percentiles, and the traceable assumption log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedSimulation {
    /// Trajectories requested at simulation start.
    pub iterations: usize,
    /// Trajectories that produced a valid NPV.
    pub valid_trajectories: usize,
    /// Trajectories excluded because discount rate ≤ terminal growth.
    pub excluded_trajectories: usize,
    pub horizon_years: usize,
    pub npv: PercentileBand,
    pub revenue_by_year: Vec<PercentileBand>,
    pub ebitda_by_year: Vec<PercentileBand>,
    pub fcf_by_year: Vec<PercentileBand>,
    pub assumptions: AssumptionSummary,
    /// Ordered parameter-derivation audit trail.
    pub assumption_log: Vec<String>,
}

impl AggregatedSimulation {
    pub fn median_npv(&self) -> f64 {
        self.npv.p50
    }

    /// Median revenue in the first forecast year.
    pub fn median_revenue(&self) -> f64 {
        self.revenue_by_year.first().map_or(0.0, |b| b.p50)
    }

    /// Median EBITDA in the first forecast year.
    pub fn median_ebitda(&self) -> f64 {
        self.ebitda_by_year.first().map_or(0.0, |b| b.p50)
    }

    /// Median FCF in the first forecast year.
    pub fn median_fcf(&self) -> f64 {
        self.fcf_by_year.first().map_or(0.0, |b| b.p50)
    }

    /// The P50 free-cash-flow path over the horizon.
    pub fn p50_fcf_path(&self) -> Vec<f64> {
        self.fcf_by_year.iter().map(|b| b.p50).collect()
    }
}

impl fmt::Display for AggregatedSimulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NPV {} | {} valid / {} excluded of {} trajectories over {}y",
            self.npv,
            self.valid_trajectories,
            self.excluded_trajectories,
            self.iterations,
            self.horizon_years,
        )
    }
}

// ---------------------------------------------------------------------------
// Solvency
// ---------------------------------------------------------------------------

/// Deterministic liquidity finding injected into the debate layer as a
/// grounding fact. Not a veto over the debate outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolvencyFinding {
    pub is_solvent_per_model: bool,
    /// Years of cash runway at the modeled P50 burn rate. Infinite when the
    /// P50 FCF path never goes negative (serialized as null).
    #[serde(with = "infinite_f64")]
    pub cash_runway_years: f64,
    pub rationale: String,
}

impl fmt::Display for SolvencyFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let runway = if self.cash_runway_years.is_infinite() {
            "unbounded".to_string()
        } else {
            format!("{:.1}y", self.cash_runway_years)
        };
        write!(
            f,
            "{} (runway {runway})",
            if self.is_solvent_per_model { "SOLVENT" } else { "LIQUIDITY RISK" },
        )
    }
}

/// JSON has no infinity literal — round-trip `f64::INFINITY` through null.
mod infinite_f64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
        if v.is_finite() {
            s.serialize_some(v)
        } else {
            s.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(d)?.unwrap_or(f64::INFINITY))
    }
}

// ---------------------------------------------------------------------------
// Debate
// ---------------------------------------------------------------------------

/// The two adversarial reasoning roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DebateRole {
    /// Argues the scenario's upside.
    Proponent,
    /// Argues the counter-case.
    Skeptic,
}

impl fmt::Display for DebateRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DebateRole::Proponent => write!(f, "Proponent"),
            DebateRole::Skeptic => write!(f, "Skeptic"),
        }
    }
}

/// A single validated turn in the debate. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateTurn {
    pub round_number: u32,
    pub role: DebateRole,
    pub message: String,
    /// References the grounding validator matched in the accepted message.
    pub cited_facts: Vec<String>,
    /// False when the turn failed validation twice and was accepted flagged
    /// rather than discarded (preserves auditability).
    pub verified: bool,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for DebateTurn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "R{} {}{}: {}",
            self.round_number,
            self.role,
            if self.verified { "" } else { " [unverified]" },
            self.message,
        )
    }
}

/// Confidence in the final consensus, derived from the last agreement score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

impl ConfidenceLevel {
    /// Score ≥ 0.8 → High, 0.5–0.8 → Medium, below (or no score) → Low.
    pub fn from_score(score: Option<f64>) -> Self {
        match score {
            Some(s) if s >= 0.8 => ConfidenceLevel::High,
            Some(s) if s >= 0.5 => ConfidenceLevel::Medium,
            _ => ConfidenceLevel::Low,
        }
    }
}

impl fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfidenceLevel::High => write!(f, "High"),
            ConfidenceLevel::Medium => write!(f, "Medium"),
            ConfidenceLevel::Low => write!(f, "Low"),
        }
    }
}

/// Frozen result of a debate run, converged or max-rounds-exhausted.
/// Exhaustion is not an error — it is a valid, lower-confidence outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateResult {
    pub log: Vec<DebateTurn>,
    pub total_rounds: u32,
    pub converged: bool,
    pub convergence_round: Option<u32>,
    pub consensus_summary: String,
    pub key_agreements: Vec<String>,
    pub key_disagreements: Vec<String>,
    pub confidence_level: ConfidenceLevel,
    /// Agreement score from the last judge call, if any was made.
    pub final_agreement_score: Option<f64>,
}

impl fmt::Display for DebateResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {} round(s), confidence {} ({} agreements, {} disagreements)",
            if self.converged { "CONVERGED" } else { "EXHAUSTED" },
            self.total_rounds,
            self.confidence_level,
            self.key_agreements.len(),
            self.key_disagreements.len(),
        )
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// Critic gate over the full analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CriticVerdict {
    Approve,
    Reject,
}

impl fmt::Display for CriticVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CriticVerdict::Approve => write!(f, "APPROVE"),
            CriticVerdict::Reject => write!(f, "REJECT"),
        }
    }
}

/// Terminal output of a scenario analysis. Produced once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub critic_verdict: CriticVerdict,
    pub comparative_analysis: Vec<String>,
    /// Investment label: Buy / Cautious Buy / Hold / Cautious Sell / Sell.
    pub final_label: String,
    pub confidence: ConfidenceLevel,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} — {} (confidence: {})",
            self.final_label, self.critic_verdict, self.confidence,
        )
    }
}

// ---------------------------------------------------------------------------
// Scenario lifecycle
// ---------------------------------------------------------------------------

/// Scenario lifecycle status, persisted for external polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScenarioStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for ScenarioStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioStatus::Pending => write!(f, "PENDING"),
            ScenarioStatus::Running => write!(f, "RUNNING"),
            ScenarioStatus::Completed => write!(f, "COMPLETED"),
            ScenarioStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Persisted per-scenario envelope. Partial results (e.g. the aggregated
/// simulation) stay retrievable even if a later phase fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioRecord {
    pub id: Uuid,
    pub status: ScenarioStatus,
    /// Monotonically non-decreasing 0–100.
    pub progress: u8,
    pub facts: FinancialFacts,
    pub delta: ScenarioDelta,
    pub aggregated: Option<AggregatedSimulation>,
    pub solvency: Option<SolvencyFinding>,
    pub debate: Option<DebateResult>,
    pub verdict: Option<Verdict>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScenarioRecord {
    pub fn new(id: Uuid, facts: FinancialFacts, delta: ScenarioDelta) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: ScenarioStatus::Pending,
            progress: 0,
            facts,
            delta,
            aggregated: None,
            solvency: None,
            debate: None,
            verdict: None,
            error_kind: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error taxonomy. Every error carries enough structure to
/// render a precise user-facing message; no kind is collapsed into a generic
/// failure.
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    /// Bad scenario or facts — user-correctable, surfaced verbatim.
    #[error("Invalid model input ({field}): {message}")]
    ModelInput { field: String, message: String },

    /// Simulation assumptions mathematically invalid (a configuration
    /// problem, not a bug).
    #[error("Degenerate model: {excluded} of {total} trajectories invalid — {message}")]
    DegenerateModel {
        excluded: usize,
        total: usize,
        message: String,
    },

    /// External reasoning capability exhausted its retries. Transient; the
    /// scenario is failed but retriable by the caller.
    #[error("Reasoning capability unavailable ({capability}): {message}")]
    AgentUnavailable { capability: String, message: String },

    /// Internal invariant violated (e.g. P10 > P50). Fatal — indicates a
    /// defect and must never be silently swallowed.
    #[error("Validation inconsistency in {context}: expected {expected}, got {actual}")]
    ValidationInconsistency {
        context: String,
        expected: String,
        actual: String,
    },

    /// A second trigger arrived for a scenario already in flight.
    #[error("Scenario {0} is already running")]
    ScenarioInFlight(Uuid),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ScenarioError {
    /// Stable kind discriminant, persisted alongside failure records.
    pub fn kind(&self) -> &'static str {
        match self {
            ScenarioError::ModelInput { .. } => "model_input",
            ScenarioError::DegenerateModel { .. } => "degenerate_model",
            ScenarioError::AgentUnavailable { .. } => "agent_unavailable",
            ScenarioError::ValidationInconsistency { .. } => "validation_inconsistency",
            ScenarioError::ScenarioInFlight(_) => "scenario_in_flight",
            ScenarioError::Storage(_) => "storage",
            ScenarioError::Config(_) => "config",
        }
    }

    /// Whether the caller may retry the same scenario unchanged.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ScenarioError::AgentUnavailable { .. } | ScenarioError::ScenarioInFlight(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
