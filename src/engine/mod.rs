//! Scenario pipeline — the single entry point tying the engine together:
//! simulate → solvency gate → debate → critique.
//!
//! One long-lived unit of work per scenario. A second trigger for the same
//! scenario id while one is in flight is rejected, never run in parallel.
//! Progress is observable externally as a monotonically non-decreasing
//! percentage: the simulation phase contributes 0–50, each debate round an
//! even share of 50–100. The aggregated simulation is persisted before the
//! debate phase starts, so it stays retrievable even if the debate fails.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{DebateConfig, SimulationConfig, ValidationConfig};
use crate::critic::CriticAgent;
use crate::debate::DebateOrchestrator;
use crate::grounding::GroundingValidator;
use crate::llm::ReasoningModel;
use crate::sim::MonteCarloSimulator;
use crate::solvency::SolvencyGate;
use crate::storage::ScenarioStore;
use crate::types::{
    FinancialFacts, ScenarioDelta, ScenarioError, ScenarioRecord, ScenarioStatus, Verdict,
};

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Share of total progress owned by the simulation phase.
const SIMULATION_SHARE: u8 = 50;

/// Monotonically non-decreasing progress percentage for one run.
pub struct ProgressTracker {
    pct: AtomicU8,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self { pct: AtomicU8::new(0) }
    }

    /// Raise progress to `pct`; lower values are ignored.
    pub fn advance_to(&self, pct: u8) {
        self.pct.fetch_max(pct.min(100), Ordering::SeqCst);
    }

    pub fn current(&self) -> u8 {
        self.pct.load(Ordering::SeqCst)
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress after a closed debate round: an even share of 50–100.
fn round_progress(round: u32, max_rounds: u32) -> u8 {
    let span = (100 - SIMULATION_SHARE) as u64;
    SIMULATION_SHARE + ((round as u64 * span) / max_rounds.max(1) as u64) as u8
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Releases the in-flight slot when the run ends, even on the error path.
struct FlightGuard<'a> {
    set: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.id);
        }
    }
}

pub struct ScenarioPipeline {
    simulator: Arc<MonteCarloSimulator>,
    model: Arc<dyn ReasoningModel>,
    debate_cfg: DebateConfig,
    validation_cfg: ValidationConfig,
    store: ScenarioStore,
    in_flight: Mutex<HashSet<Uuid>>,
}

impl ScenarioPipeline {
    pub fn new(
        simulation_cfg: SimulationConfig,
        debate_cfg: DebateConfig,
        validation_cfg: ValidationConfig,
        model: Arc<dyn ReasoningModel>,
        store: ScenarioStore,
    ) -> Self {
        Self {
            simulator: Arc::new(MonteCarloSimulator::new(simulation_cfg)),
            model,
            debate_cfg,
            validation_cfg,
            store,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// The persisted records, for status polling and partial-result reads.
    pub fn store(&self) -> &ScenarioStore {
        &self.store
    }

    /// Run the full analysis for one scenario id.
    pub async fn run_scenario_analysis(
        &self,
        id: Uuid,
        facts: &FinancialFacts,
        delta: &ScenarioDelta,
        seed: u64,
    ) -> Result<Verdict, ScenarioError> {
        {
            let mut set = self
                .in_flight
                .lock()
                .map_err(|_| ScenarioError::Storage("in-flight set poisoned".to_string()))?;
            if !set.insert(id) {
                warn!(%id, "Rejecting duplicate trigger for in-flight scenario");
                return Err(ScenarioError::ScenarioInFlight(id));
            }
        }
        let _guard = FlightGuard { set: &self.in_flight, id };

        self.execute(id, facts, delta, seed).await
    }

    async fn execute(
        &self,
        id: Uuid,
        facts: &FinancialFacts,
        delta: &ScenarioDelta,
        seed: u64,
    ) -> Result<Verdict, ScenarioError> {
        info!(%id, %delta, seed, "Scenario analysis starting");

        let mut record = ScenarioRecord::new(id, facts.clone(), *delta);
        record.status = ScenarioStatus::Running;
        self.store.save(&record)?;

        let progress = ProgressTracker::new();

        // -- Phase 1: Monte Carlo simulation (CPU-bound) ------------------
        let simulator = Arc::clone(&self.simulator);
        let facts_for_sim = facts.clone();
        let delta_for_sim = *delta;
        let sim_result = tokio::task::spawn_blocking(move || {
            simulator.simulate(&facts_for_sim, &delta_for_sim, seed)
        })
        .await
        .map_err(|e| ScenarioError::ValidationInconsistency {
            context: "simulation task".to_string(),
            expected: "completion".to_string(),
            actual: e.to_string(),
        })?;

        let aggregated = match sim_result {
            Ok(agg) => agg,
            Err(e) => return Err(self.fail(record, e)),
        };
        progress.advance_to(SIMULATION_SHARE);

        // Persist the partial result before the fallible debate phase.
        let solvency = SolvencyGate::new(self.validation_cfg.clone()).check(&aggregated, facts);
        record.aggregated = Some(aggregated.clone());
        record.solvency = Some(solvency.clone());
        record.progress = progress.current();
        record.updated_at = Utc::now();
        self.store.save(&record)?;
        info!(%id, npv_p50 = format!("{:.1}", aggregated.npv.p50), solvency = %solvency, "Simulation phase complete");

        // -- Phase 2: adversarial debate ----------------------------------
        let orchestrator = DebateOrchestrator::new(
            Arc::clone(&self.model),
            GroundingValidator::new(self.validation_cfg.clone()),
            self.debate_cfg.clone(),
        );
        let max_rounds = self.debate_cfg.max_rounds;
        let mut on_round = |round: u32| {
            progress.advance_to(round_progress(round, max_rounds));
            let mut snapshot = record.clone();
            snapshot.progress = progress.current();
            snapshot.updated_at = Utc::now();
            if let Err(e) = self.store.save(&snapshot) {
                warn!(%id, error = %e, "Failed to persist round progress");
            }
        };

        let debate = match orchestrator
            .run(facts, &aggregated, &solvency, delta, &mut on_round)
            .await
        {
            Ok(result) => result,
            Err(e) => return Err(self.fail(record, e)),
        };
        info!(%id, debate = %debate, "Debate phase complete");

        // -- Phase 3: critique --------------------------------------------
        let verdict = CriticAgent::critique(facts, &aggregated, &solvency, &debate);

        progress.advance_to(100);
        record.debate = Some(debate);
        record.verdict = Some(verdict.clone());
        record.status = ScenarioStatus::Completed;
        record.progress = 100;
        record.updated_at = Utc::now();
        self.store.save(&record)?;

        info!(%id, verdict = %verdict, "Scenario analysis complete");
        Ok(verdict)
    }

    /// Persist the failure with its kind preserved, keeping any partial
    /// results already attached to the record.
    fn fail(&self, mut record: ScenarioRecord, err: ScenarioError) -> ScenarioError {
        record.status = ScenarioStatus::Failed;
        record.error_kind = Some(err.kind().to_string());
        record.error_message = Some(err.to_string());
        record.updated_at = Utc::now();
        if let Err(save_err) = self.store.save(&record) {
            error!(id = %record.id, error = %save_err, "Failed to persist failure record");
        }
        error!(id = %record.id, kind = err.kind(), error = %err, "Scenario analysis failed");
        err
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
