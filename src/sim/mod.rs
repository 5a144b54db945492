//! Monte Carlo valuation simulator.
//!
//! Draws N independent trajectories under the scenario model's assumptions,
//! computes per-trajectory revenue/EBITDA/FCF streams and a DCF NPV with a
//! Gordon-growth terminal value, and aggregates the distributions into
//! per-year P10/P50/P90 bands.
//!
//! Determinism: the simulator holds no mutable cross-call state. Each
//! trajectory derives its own RNG from the explicit run seed and its global
//! index, so results are bit-identical for a given seed regardless of how
//! many worker threads execute the draw.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use crate::config::SimulationConfig;
use crate::model::{self, ParameterDistribution, SimulationAssumptions};
use crate::types::{
    AggregatedSimulation, FinancialFacts, PercentileBand, ScenarioDelta, ScenarioError,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Upper bound on simulation worker threads.
const MAX_WORKERS: usize = 16;

// ---------------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------------

/// splitmix64-style finalizer: decorrelates per-trajectory seeds derived
/// from (run seed, trajectory index).
fn mix_seed(seed: u64, index: u64) -> u64 {
    let mut z = seed ^ index.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Per-trajectory sampler: seeded ChaCha8 generator with Box–Muller
/// standard-normal draws (the second variate is cached).
struct TrajectorySampler {
    rng: ChaCha8Rng,
    spare_normal: Option<f64>,
}

impl TrajectorySampler {
    fn new(seed: u64, trajectory_index: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(mix_seed(seed, trajectory_index)),
            spare_normal: None,
        }
    }

    fn standard_normal(&mut self) -> f64 {
        if let Some(z) = self.spare_normal.take() {
            return z;
        }
        let u1: f64 = self.rng.gen::<f64>().max(1e-12);
        let u2: f64 = self.rng.gen();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f64::consts::PI * u2;
        self.spare_normal = Some(r * theta.sin());
        r * theta.cos()
    }

    /// Draw from a truncated normal: N(mean, std_dev) clamped to the
    /// distribution's physical bounds. Zero variance collapses to the mean.
    fn sample(&mut self, dist: &ParameterDistribution) -> f64 {
        if dist.is_deterministic() {
            return dist.mean.clamp(dist.min, dist.max);
        }
        (dist.mean + dist.std_dev * self.standard_normal()).clamp(dist.min, dist.max)
    }
}

// ---------------------------------------------------------------------------
// Percentiles
// ---------------------------------------------------------------------------

/// Quantile of a sorted slice via linear interpolation between order
/// statistics. Ties resolve by stable index order (the sort is stable and
/// equal values interpolate to themselves).
fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let idx = p.clamp(0.0, 1.0) * (n - 1) as f64;
    let lo = idx.floor() as usize;
    let hi = idx.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let w = idx - lo as f64;
    sorted[lo] * (1.0 - w) + sorted[hi] * w
}

/// P10/P50/P90 band over an unsorted sample.
fn band_of(mut values: Vec<f64>) -> PercentileBand {
    values.sort_by(|a, b| a.total_cmp(b));
    PercentileBand {
        p10: quantile_sorted(&values, 0.10),
        p50: quantile_sorted(&values, 0.50),
        p90: quantile_sorted(&values, 0.90),
    }
}

// ---------------------------------------------------------------------------
// Trajectory
// ---------------------------------------------------------------------------

/// One Monte Carlo draw. Ephemeral — reduced away during aggregation.
struct Trajectory {
    revenue: Vec<f64>,
    ebitda: Vec<f64>,
    fcf: Vec<f64>,
    npv: f64,
}

/// Run a single trajectory. Returns None when the drawn discount rate does
/// not exceed the terminal growth rate (Gordon growth undefined) — the
/// trajectory is excluded, never silently patched.
fn run_trajectory(a: &SimulationAssumptions, mut sampler: TrajectorySampler) -> Option<Trajectory> {
    let discount = sampler.sample(&a.discount_rate);
    if discount <= a.terminal_growth {
        return None;
    }

    let horizon = a.horizon_years;
    let mut revenue = Vec::with_capacity(horizon);
    let mut ebitda = Vec::with_capacity(horizon);
    let mut fcf = Vec::with_capacity(horizon);

    let mut rev = a.base_revenue;
    let mut npv = 0.0;

    for t in 1..=horizon {
        // Growth, opex ratio, and tax rate are drawn fresh every year.
        let growth = sampler.sample(&a.revenue_growth);
        let opex_ratio = sampler.sample(&a.opex_ratio);
        let tax_rate = sampler.sample(&a.tax_rate);

        rev *= 1.0 + growth;
        let year_ebitda = rev * (1.0 - a.ratios.cogs_ratio - opex_ratio);
        let da = rev * a.ratios.da_ratio;
        let ebit = year_ebitda - da;
        let taxes = if ebit > 0.0 { ebit * tax_rate } else { 0.0 };
        let year_fcf =
            (ebit - taxes) + da - rev * a.ratios.capex_ratio - rev * a.ratios.wc_ratio;

        npv += year_fcf / (1.0 + discount).powi(t as i32);

        revenue.push(rev);
        ebitda.push(year_ebitda);
        fcf.push(year_fcf);
    }

    // Gordon-growth perpetuity beyond the explicit horizon, discounted back.
    let last_fcf = *fcf.last()?;
    let terminal = last_fcf * (1.0 + a.terminal_growth) / (discount - a.terminal_growth);
    npv += terminal / (1.0 + discount).powi(horizon as i32);

    Some(Trajectory { revenue, ebitda, fcf, npv })
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

/// Stateless Monte Carlo simulator. Every call is independent and
/// deterministic given an explicit seed.
pub struct MonteCarloSimulator {
    cfg: SimulationConfig,
}

impl MonteCarloSimulator {
    pub fn new(cfg: SimulationConfig) -> Self {
        Self { cfg }
    }

    /// Access the simulation configuration.
    pub fn config(&self) -> &SimulationConfig {
        &self.cfg
    }

    /// Run the full simulation: derive assumptions, draw all trajectories
    /// across worker threads, and aggregate percentile bands.
    pub fn simulate(
        &self,
        facts: &FinancialFacts,
        delta: &ScenarioDelta,
        seed: u64,
    ) -> Result<AggregatedSimulation, ScenarioError> {
        let iterations = self.cfg.iterations;
        if iterations == 0 {
            return Err(ScenarioError::ModelInput {
                field: "simulation.iterations".to_string(),
                message: "trajectory count must be positive".to_string(),
            });
        }

        let assumptions = model::derive_assumptions(facts, delta, &self.cfg)?;

        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(MAX_WORKERS)
            .min(iterations);
        let chunk = iterations.div_ceil(workers);
        debug!(iterations, workers, chunk, seed, "Starting Monte Carlo draw");

        // Trajectories are embarrassingly parallel: each reads only the
        // immutable assumptions and its own RNG. Aggregation is the barrier.
        let outcomes: Vec<Option<Trajectory>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|w| {
                    let a = &assumptions;
                    let start = w * chunk;
                    let end = ((w + 1) * chunk).min(iterations);
                    s.spawn(move || {
                        (start..end)
                            .map(|i| run_trajectory(a, TrajectorySampler::new(seed, i as u64)))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().expect("simulation worker panicked"))
                .collect()
        });

        self.aggregate(outcomes, assumptions, seed)
    }

    fn aggregate(
        &self,
        outcomes: Vec<Option<Trajectory>>,
        assumptions: SimulationAssumptions,
        seed: u64,
    ) -> Result<AggregatedSimulation, ScenarioError> {
        let iterations = outcomes.len();
        let valid: Vec<Trajectory> = outcomes.into_iter().flatten().collect();
        let excluded = iterations - valid.len();

        let invalid_fraction = excluded as f64 / iterations as f64;
        if invalid_fraction > self.cfg.max_invalid_fraction || valid.is_empty() {
            return Err(ScenarioError::DegenerateModel {
                excluded,
                total: iterations,
                message: format!(
                    "discount rate ≤ terminal growth {:.4} in {:.1}% of trajectories (limit {:.1}%)",
                    assumptions.terminal_growth,
                    invalid_fraction * 100.0,
                    self.cfg.max_invalid_fraction * 100.0,
                ),
            });
        }

        let horizon = assumptions.horizon_years;
        let npv = band_of(valid.iter().map(|t| t.npv).collect());

        // Percentile-per-year: each year's distribution is reduced
        // independently, not a percentile of a summary statistic.
        let per_year = |extract: fn(&Trajectory) -> &Vec<f64>| -> Vec<PercentileBand> {
            (0..horizon)
                .map(|y| band_of(valid.iter().map(|t| extract(t)[y]).collect()))
                .collect()
        };
        let revenue_by_year = per_year(|t| &t.revenue);
        let ebitda_by_year = per_year(|t| &t.ebitda);
        let fcf_by_year = per_year(|t| &t.fcf);

        let mut assumption_log = assumptions.log.clone();
        assumption_log.push(format!(
            "Monte Carlo: {} iterations (seed {seed}), {} valid, {} excluded",
            iterations,
            valid.len(),
            excluded,
        ));

        let aggregated = AggregatedSimulation {
            iterations,
            valid_trajectories: valid.len(),
            excluded_trajectories: excluded,
            horizon_years: horizon,
            npv,
            revenue_by_year,
            ebitda_by_year,
            fcf_by_year,
            assumptions: assumptions.summary(),
            assumption_log,
        };

        check_ordering(&aggregated)?;

        info!(
            iterations,
            valid = aggregated.valid_trajectories,
            excluded,
            npv_p50 = format!("{:.1}", aggregated.npv.p50),
            "Simulation complete"
        );

        Ok(aggregated)
    }
}

/// Enforce P10 ≤ P50 ≤ P90 on every aggregated quantity. A violation is a
/// defect, not a data problem, and must never be swallowed.
fn check_ordering(agg: &AggregatedSimulation) -> Result<(), ScenarioError> {
    let mut bands: Vec<(String, &PercentileBand)> = vec![("npv".to_string(), &agg.npv)];
    for (name, series) in [
        ("revenue", &agg.revenue_by_year),
        ("ebitda", &agg.ebitda_by_year),
        ("fcf", &agg.fcf_by_year),
    ] {
        for (y, band) in series.iter().enumerate() {
            bands.push((format!("{name}[year {}]", y + 1), band));
        }
    }
    for (context, band) in bands {
        if !band.is_ordered() {
            return Err(ScenarioError::ValidationInconsistency {
                context,
                expected: "P10 ≤ P50 ≤ P90".to_string(),
                actual: format!("{band}"),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
