//! Critic — assembles the terminal verdict from the simulation, the solvency
//! finding, and the frozen debate.
//!
//! Deterministic rule engine: balance-sheet identity, margin banding, NPV
//! and liquidity rules, and an unsupported-assumption count from turns that
//! failed grounding validation. The debate supplies the adversarial text
//! layer; the critic only has to gate and label it.

use tracing::{debug, info};

use crate::types::{
    AggregatedSimulation, CriticVerdict, DebateResult, FinancialFacts, SolvencyFinding, Verdict,
};

pub struct CriticAgent;

impl CriticAgent {
    /// Produce the terminal verdict. Called once per scenario.
    pub fn critique(
        facts: &FinancialFacts,
        aggregated: &AggregatedSimulation,
        solvency: &SolvencyFinding,
        debate: &DebateResult,
    ) -> Verdict {
        let mut analysis = Vec::new();
        let mut reject = false;

        // Accounting identity: Assets = Liabilities + Equity, within 1% of
        // assets or $1, whichever is larger.
        let gap = facts.balance_sheet.identity_gap();
        let tolerance = (facts.balance_sheet.total_assets * 0.01).max(1.0);
        if gap.abs() > tolerance {
            reject = true;
            analysis.push(format!(
                "Balance sheet does not balance: assets {:.1} vs liabilities + equity {:.1} \
                 (gap {:.1})",
                facts.balance_sheet.total_assets,
                facts.balance_sheet.total_liabilities + facts.balance_sheet.total_equity,
                gap,
            ));
        } else {
            analysis.push("Balance sheet identity holds within tolerance".to_string());
        }

        // Margin banding on the modeled year-1 medians.
        let median_revenue = aggregated.median_revenue();
        if median_revenue > 0.0 {
            let margin = aggregated.median_ebitda() / median_revenue;
            let band = if margin > 0.40 {
                "very strong (above 40%)"
            } else if margin < 0.10 {
                "concerning (below 10%)"
            } else {
                "reasonable"
            };
            analysis.push(format!("Modeled EBITDA margin of {:.1}% is {band}", margin * 100.0));
        }

        // Valuation and tail.
        let median_npv = aggregated.median_npv();
        if median_npv <= 0.0 {
            analysis.push(format!(
                "Negative median NPV ({median_npv:.1}) suggests the scenario destroys value"
            ));
        } else if aggregated.npv.p10 < 0.0 {
            analysis.push(format!(
                "Median NPV {median_npv:.1} is positive but the P10 tail ({:.1}) includes \
                 value destruction",
                aggregated.npv.p10,
            ));
        } else {
            analysis.push(format!(
                "NPV distribution is positive across the P10–P90 range ({:.1} to {:.1})",
                aggregated.npv.p10, aggregated.npv.p90,
            ));
        }

        // Liquidity.
        analysis.push(format!("Solvency gate: {} — {}", solvency, solvency.rationale));
        if median_npv <= 0.0 && !solvency.is_solvent_per_model {
            reject = true;
        }

        // Unsupported assumptions surfaced by the grounding validator.
        let unverified = debate.log.iter().filter(|t| !t.verified).count();
        if unverified > 0 {
            analysis.push(format!(
                "{unverified} debate turn(s) failed grounding validation and are flagged \
                 unverified in the transcript"
            ));
        }

        let final_label = Self::label(median_npv, solvency.is_solvent_per_model, debate.converged);
        let critic_verdict = if reject { CriticVerdict::Reject } else { CriticVerdict::Approve };

        debug!(points = analysis.len(), unverified, "Critique assembled");
        info!(
            verdict = %critic_verdict,
            label = %final_label,
            confidence = %debate.confidence_level,
            "Verdict produced"
        );

        Verdict {
            critic_verdict,
            comparative_analysis: analysis,
            final_label,
            confidence: debate.confidence_level,
        }
    }

    /// Investment label from the modeled value, liquidity, and whether the
    /// analysts actually agreed.
    fn label(median_npv: f64, solvent: bool, converged: bool) -> String {
        match (median_npv > 0.0, solvent) {
            (true, true) => {
                if converged {
                    "Buy".to_string()
                } else {
                    "Cautious Buy".to_string()
                }
            }
            (true, false) => "Hold".to_string(),
            (false, true) => "Cautious Sell".to_string(),
            (false, false) => {
                if converged {
                    "Sell".to_string()
                } else {
                    "Cautious Sell".to_string()
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
