//! Solvency gate — deterministic liquidity check over the simulated P50 path.
//!
//! Produces a grounding fact for the debate layer: an agent must not assert
//! insolvency when the numbers show multi-year runway, and conversely must
//! acknowledge real liquidity risk. The gate never vetoes the debate
//! outcome; the grounding validator checks claims against its finding.

use tracing::debug;

use crate::config::ValidationConfig;
use crate::types::{AggregatedSimulation, FinancialFacts, SolvencyFinding};

/// Deterministic rule engine over simulator output and balance-sheet cash.
pub struct SolvencyGate {
    cfg: ValidationConfig,
}

impl SolvencyGate {
    pub fn new(cfg: ValidationConfig) -> Self {
        Self { cfg }
    }

    /// Compute the runway finding from the P50 FCF path.
    ///
    /// A path that never goes negative means the model projects no burn:
    /// runway is infinite and the company is solvent per model. Otherwise
    /// runway = cash reserves / mean magnitude of the negative P50 years,
    /// and solvency requires the runway to reach the safety threshold.
    pub fn check(&self, aggregated: &AggregatedSimulation, facts: &FinancialFacts) -> SolvencyFinding {
        let p50_path = aggregated.p50_fcf_path();
        let cash = facts.balance_sheet.cash;

        let negative_years: Vec<f64> =
            p50_path.iter().copied().filter(|fcf| *fcf < 0.0).collect();

        if negative_years.is_empty() {
            let finding = SolvencyFinding {
                is_solvent_per_model: true,
                cash_runway_years: f64::INFINITY,
                rationale: format!(
                    "P50 FCF is non-negative in all {} forecast years (year-1 P50 FCF {:.1}); \
                     no modeled burn against cash reserves of {:.1}",
                    p50_path.len(),
                    aggregated.median_fcf(),
                    cash,
                ),
            };
            debug!(runway = "unbounded", "Solvency check complete");
            return finding;
        }

        let burn =
            negative_years.iter().map(|f| f.abs()).sum::<f64>() / negative_years.len() as f64;
        let runway = if burn > 0.0 { cash / burn } else { f64::INFINITY };
        let is_solvent = runway >= self.cfg.runway_safety_years;

        let finding = SolvencyFinding {
            is_solvent_per_model: is_solvent,
            cash_runway_years: runway,
            rationale: format!(
                "P50 FCF negative in {} of {} forecast years (mean burn {:.1}/yr); \
                 cash reserves {:.1} cover {:.1} years against the {:.1}-year safety threshold",
                negative_years.len(),
                p50_path.len(),
                burn,
                cash,
                runway,
                self.cfg.runway_safety_years,
            ),
        };
        debug!(
            runway = format!("{runway:.2}y"),
            solvent = is_solvent,
            "Solvency check complete"
        );
        finding
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
