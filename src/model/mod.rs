//! Scenario model — derives per-year simulation assumptions from the base
//! facts and a scenario delta.
//!
//! Every distribution parameter is anchored to a historical observed rate
//! plus the user's delta, with volatility taken from the historical variance
//! of the same series. Each derivation is appended to the assumption log so
//! the simulation output stays fully auditable.

use serde::{Deserialize, Serialize};

use crate::config::SimulationConfig;
use crate::types::{AssumptionSummary, FinancialFacts, ScenarioDelta, ScenarioError};

// ---------------------------------------------------------------------------
// Assumption types
// ---------------------------------------------------------------------------

/// One sampled parameter: a truncated normal described by mean, standard
/// deviation, and physical bounds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ParameterDistribution {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

impl ParameterDistribution {
    /// A distribution with zero variance collapses to its mean.
    pub fn is_deterministic(&self) -> bool {
        self.std_dev == 0.0
    }
}

/// Ratios held fixed over the horizon, derived from the base statements.
/// All scale with revenue during propagation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StructuralRatios {
    pub cogs_ratio: f64,
    pub da_ratio: f64,
    pub capex_ratio: f64,
    pub wc_ratio: f64,
}

/// Fully derived inputs for one simulation run. Immutable once built;
/// trajectories read it concurrently without synchronization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationAssumptions {
    pub horizon_years: usize,
    pub base_revenue: f64,
    pub revenue_growth: ParameterDistribution,
    pub opex_ratio: ParameterDistribution,
    pub tax_rate: ParameterDistribution,
    pub discount_rate: ParameterDistribution,
    pub ratios: StructuralRatios,
    pub terminal_growth: f64,
    /// Ordered derivation audit trail: historical anchor, applied delta,
    /// resulting parameter — one line per parameter.
    pub log: Vec<String>,
}

impl SimulationAssumptions {
    /// The resolved means, embedded into the simulation output contract.
    pub fn summary(&self) -> AssumptionSummary {
        AssumptionSummary {
            revenue_growth_mean: self.revenue_growth.mean,
            opex_ratio_mean: self.opex_ratio.mean,
            tax_rate_mean: self.tax_rate.mean,
            discount_rate_mean: self.discount_rate.mean,
            terminal_growth: self.terminal_growth,
        }
    }
}

// ---------------------------------------------------------------------------
// Series statistics
// ---------------------------------------------------------------------------

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Sample standard deviation (n−1 denominator). Fewer than two observations
/// carry no variance information and yield 0.
fn sample_std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Year-over-year growth rates from a revenue series.
fn growth_series(revenues: &[f64]) -> Vec<f64> {
    revenues
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect()
}

/// Opex/revenue ratios over the overlapping tail of the two series.
fn ratio_series(numerators: &[f64], denominators: &[f64]) -> Vec<f64> {
    let n = numerators.len().min(denominators.len());
    let num_tail = &numerators[numerators.len() - n..];
    let den_tail = &denominators[denominators.len() - n..];
    num_tail
        .iter()
        .zip(den_tail)
        .filter(|(_, d)| **d > 0.0)
        .map(|(n, d)| n / d)
        .collect()
}

fn bps_to_rate(bps: i32) -> f64 {
    bps as f64 / 10_000.0
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

/// Derive simulation assumptions. Rejects out-of-policy deltas and facts
/// missing the history required to anchor the model.
pub fn derive_assumptions(
    facts: &FinancialFacts,
    delta: &ScenarioDelta,
    cfg: &SimulationConfig,
) -> Result<SimulationAssumptions, ScenarioError> {
    validate_delta(delta, cfg.max_delta_bps)?;

    let inc = &facts.income_statement;
    if inc.revenue <= 0.0 {
        return Err(ScenarioError::ModelInput {
            field: "income_statement.revenue".to_string(),
            message: format!("base revenue must be positive, got {}", inc.revenue),
        });
    }

    let revenues = &facts.history.revenue;
    if revenues.len() < 2 {
        return Err(ScenarioError::ModelInput {
            field: "history.revenue".to_string(),
            message: format!(
                "need at least two historical periods to anchor growth, got {}",
                revenues.len()
            ),
        });
    }
    if revenues.iter().any(|r| *r <= 0.0) {
        return Err(ScenarioError::ModelInput {
            field: "history.revenue".to_string(),
            message: "historical revenue must be strictly positive".to_string(),
        });
    }

    let mut log = Vec::new();

    // Revenue growth: anchored to historical YoY mean, volatility from the
    // same series.
    let growths = growth_series(revenues);
    let growth_anchor = mean(&growths);
    let growth_sigma = sample_std_dev(&growths);
    let growth_delta = bps_to_rate(delta.revenue_growth_delta_bps);
    let revenue_growth = ParameterDistribution {
        mean: growth_anchor + growth_delta,
        std_dev: growth_sigma,
        min: -0.95,
        max: 5.0,
    };
    log.push(format!(
        "Revenue growth: historical mean {:.4} over {} obs (sigma {:.4}) + delta {:+} bps -> {:.4}",
        growth_anchor,
        growths.len(),
        growth_sigma,
        delta.revenue_growth_delta_bps,
        revenue_growth.mean,
    ));

    // Opex ratio: historical opex/revenue mean shifted by the delta in ratio
    // points. Falls back to the base-statement ratio when no history exists.
    let opex_ratios = ratio_series(&facts.history.opex, revenues);
    let (opex_anchor, opex_sigma) = if opex_ratios.is_empty() {
        let base = inc.opex / inc.revenue;
        log.push(format!(
            "Opex ratio: no historical series, anchoring to base statement ratio {base:.4}"
        ));
        (base, 0.0)
    } else {
        (mean(&opex_ratios), sample_std_dev(&opex_ratios))
    };
    let opex_delta = bps_to_rate(delta.opex_delta_bps);
    let opex_mean = opex_anchor + opex_delta;
    if opex_mean < 0.0 {
        return Err(ScenarioError::ModelInput {
            field: "opex_delta_bps".to_string(),
            message: format!(
                "delta {:+} bps pushes opex ratio below zero ({:.4})",
                delta.opex_delta_bps, opex_mean
            ),
        });
    }
    let opex_ratio = ParameterDistribution {
        mean: opex_mean,
        std_dev: opex_sigma,
        min: 0.0,
        max: 1.5,
    };
    log.push(format!(
        "Opex ratio: historical mean {:.4} over {} obs (sigma {:.4}) + delta {:+} bps -> {:.4}",
        opex_anchor,
        opex_ratios.len(),
        opex_sigma,
        delta.opex_delta_bps,
        opex_ratio.mean,
    ));

    // Effective tax rate: historical mean, base statement fallback.
    let tax_history = &facts.history.effective_tax_rate;
    let (tax_anchor, tax_sigma) = if tax_history.is_empty() {
        let base = if inc.ebit > 0.0 {
            (inc.taxes / inc.ebit).clamp(0.0, 0.6)
        } else {
            0.0
        };
        log.push(format!(
            "Tax rate: no historical series, anchoring to base effective rate {base:.4}"
        ));
        (base, 0.0)
    } else {
        (mean(tax_history), sample_std_dev(tax_history))
    };
    let tax_rate = ParameterDistribution {
        mean: tax_anchor,
        std_dev: tax_sigma,
        min: 0.0,
        max: 0.6,
    };
    log.push(format!(
        "Tax rate: historical mean {:.4} over {} obs (sigma {:.4}) -> {:.4}",
        tax_anchor,
        tax_history.len(),
        tax_sigma,
        tax_rate.mean,
    ));

    // Discount rate: historical WACC series, then the "wacc" KPI, then the
    // configured default — each fallback logged.
    let wacc_history = &facts.history.discount_rate;
    let (wacc_anchor, wacc_sigma) = if !wacc_history.is_empty() {
        (mean(wacc_history), sample_std_dev(wacc_history))
    } else if let Some(w) = facts.kpis.get("wacc") {
        log.push(format!("Discount rate: no historical series, anchoring to wacc KPI {w:.4}"));
        (*w, 0.0)
    } else {
        log.push(format!(
            "Discount rate: no history or KPI, anchoring to configured default {:.4}",
            cfg.default_discount_rate
        ));
        (cfg.default_discount_rate, 0.0)
    };
    let discount_delta = bps_to_rate(delta.discount_rate_delta_bps);
    let discount_mean = wacc_anchor + discount_delta;
    if discount_mean <= 0.0 {
        return Err(ScenarioError::ModelInput {
            field: "discount_rate_delta_bps".to_string(),
            message: format!(
                "delta {:+} bps makes the discount rate non-positive ({:.4})",
                delta.discount_rate_delta_bps, discount_mean
            ),
        });
    }
    let discount_rate = ParameterDistribution {
        mean: discount_mean,
        std_dev: wacc_sigma,
        min: 0.001,
        max: 1.0,
    };
    log.push(format!(
        "Discount rate: historical mean {:.4} over {} obs (sigma {:.4}) + delta {:+} bps -> {:.4}",
        wacc_anchor,
        wacc_history.len(),
        wacc_sigma,
        delta.discount_rate_delta_bps,
        discount_rate.mean,
    ));

    // Structural ratios scale with revenue over the horizon.
    let ratios = StructuralRatios {
        cogs_ratio: inc.cogs / inc.revenue,
        da_ratio: inc.depreciation_amortization / inc.revenue,
        capex_ratio: facts.cash_flow.capex / inc.revenue,
        wc_ratio: facts.cash_flow.change_in_working_capital / inc.revenue,
    };
    log.push(format!(
        "Structural ratios (of revenue): COGS {:.4}, D&A {:.4}, CapEx {:.4}, dWC {:.4}",
        ratios.cogs_ratio, ratios.da_ratio, ratios.capex_ratio, ratios.wc_ratio,
    ));
    log.push(format!(
        "Terminal value: Gordon growth at g = {:.4} beyond year {}",
        cfg.long_run_growth, cfg.horizon_years,
    ));

    Ok(SimulationAssumptions {
        horizon_years: cfg.horizon_years,
        base_revenue: inc.revenue,
        revenue_growth,
        opex_ratio,
        tax_rate,
        discount_rate,
        ratios,
        terminal_growth: cfg.long_run_growth,
        log,
    })
}

/// Reject any delta whose magnitude exceeds the policy bound, naming the
/// offending axis.
fn validate_delta(delta: &ScenarioDelta, max_bps: i32) -> Result<(), ScenarioError> {
    let axes = [
        ("revenue_growth_delta_bps", delta.revenue_growth_delta_bps),
        ("opex_delta_bps", delta.opex_delta_bps),
        ("discount_rate_delta_bps", delta.discount_rate_delta_bps),
    ];
    for (field, value) in axes {
        if value.abs() > max_bps {
            return Err(ScenarioError::ModelInput {
                field: field.to_string(),
                message: format!("magnitude {} exceeds policy bound {max_bps} bps", value.abs()),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
