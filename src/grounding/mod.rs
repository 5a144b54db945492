//! Grounding validator — the hallucination gate for debate turns.
//!
//! Extracts every falsifiable numeric assertion from a draft turn (dollar
//! figures, runway claims, named rates) and checks it against the simulation
//! output, the source facts, and the solvency finding within a relative
//! tolerance. Qualitative content is never policed: opinions and
//! interpretations always pass, only checkable numbers and insolvency
//! claims can be rejected.

use regex::Regex;
use tracing::debug;

use crate::config::ValidationConfig;
use crate::types::{AggregatedSimulation, FinancialFacts, SolvencyFinding};

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result of validating one draft turn.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub accepted: bool,
    /// Rejection reason naming the specific mismatched figure, fed back to
    /// the role for regeneration.
    pub reason: Option<String>,
    /// Labels of the references matched by the draft's accepted claims.
    pub cited: Vec<String>,
}

impl ValidationOutcome {
    fn accept(cited: Vec<String>) -> Self {
        Self { accepted: true, reason: None, cited }
    }

    fn reject(reason: String) -> Self {
        Self { accepted: false, reason: Some(reason), cited: Vec::new() }
    }
}

/// A checkable reference value with a human-readable label.
struct Reference {
    label: String,
    value: f64,
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

/// Phrases for drivers that cannot exist in the supplied data. A turn citing
/// any of them is fabricating evidence and is rejected outright.
const FABRICATED_DRIVERS: &[&str] = &[
    "new product",
    "product launch",
    "market expansion",
    "pre-order",
    "internal projection",
    "market research",
    "partner demand",
    "customer retention program",
    "marketing efficiency",
    "unspecified cost savings",
];

/// Phrases asserting insolvency. Rejected regardless of numeric tolerance
/// when the model shows runway beyond the safety threshold.
const INSOLVENCY_CLAIMS: &[&str] = &[
    "insolvent",
    "insolvency",
    "bankrupt",
    "bankruptcy",
    "run out of cash",
    "runs out of cash",
    "running out of cash",
    "liquidity crisis",
    "cannot meet its obligations",
    "unable to pay",
];

pub struct GroundingValidator {
    cfg: ValidationConfig,
    money_re: Regex,
    years_re: Regex,
    percent_re: Regex,
    /// Sentence boundary: terminator followed by whitespace/end, so decimal
    /// points inside figures ("1.5 years") survive.
    sentence_re: Regex,
}

impl GroundingValidator {
    pub fn new(cfg: ValidationConfig) -> Self {
        Self {
            cfg,
            money_re: Regex::new(
                r"(?i)\$\s*([0-9][0-9,]*(?:\.[0-9]+)?)\s*(billion|million|thousand|bn|mm|[bmk])?\b",
            )
            .expect("money pattern is valid"),
            years_re: Regex::new(r"([0-9]+(?:\.[0-9]+)?)\s*(?:years?|yrs?)\b")
                .expect("years pattern is valid"),
            percent_re: Regex::new(r"([0-9]+(?:\.[0-9]+)?)\s*%").expect("percent pattern is valid"),
            sentence_re: Regex::new(r"[.!?](?:\s+|$)|\n+").expect("sentence pattern is valid"),
        }
    }

    /// Validate a draft turn against the computed model outputs.
    pub fn validate(
        &self,
        draft: &str,
        aggregated: &AggregatedSimulation,
        facts: &FinancialFacts,
        solvency: &SolvencyFinding,
    ) -> ValidationOutcome {
        let lower = draft.to_lowercase();

        // Fast fail: fabricated drivers (the data cannot contain them).
        if let Some(term) = FABRICATED_DRIVERS.iter().find(|t| lower.contains(*t)) {
            debug!(term = %term, "Draft rejected: fabricated driver");
            return ValidationOutcome::reject(format!(
                "cited \"{term}\", which does not exist in the supplied data; \
                 remove it and argue from the provided figures"
            ));
        }

        // Hallucination-prevention rule: insolvency claims against a model
        // showing runway beyond the safety threshold.
        if solvency.is_solvent_per_model
            && solvency.cash_runway_years > self.cfg.runway_safety_years
        {
            if let Some(term) = INSOLVENCY_CLAIMS.iter().find(|t| lower.contains(*t)) {
                debug!(term = %term, "Draft rejected: insolvency claim contradicts solvency finding");
                return ValidationOutcome::reject(format!(
                    "claimed \"{term}\" but the model shows {}: {}",
                    solvency, solvency.rationale
                ));
            }
        }

        let references = build_references(aggregated, facts);
        let mut cited: Vec<String> = Vec::new();

        // Dollar figures: every one must be within tolerance of some
        // computed or reported reference.
        for cap in self.money_re.captures_iter(draft) {
            let Some(value) = parse_money(&cap[1], cap.get(2).map(|m| m.as_str())) else {
                continue;
            };
            match self.closest_match(value, &references) {
                Ok(label) => {
                    if !cited.contains(&label) {
                        cited.push(label);
                    }
                }
                Err(nearest) => {
                    debug!(figure = value, "Draft rejected: unsupported dollar figure");
                    return ValidationOutcome::reject(format!(
                        "asserted ${value:.1}, which matches no computed figure within \
                         {:.0}% tolerance (nearest: {nearest})",
                        self.cfg.relative_tolerance * 100.0,
                    ));
                }
            }
        }

        // Per-sentence claims that need keyword scoping.
        for sentence in self.sentence_re.split(&lower) {
            if let Some(outcome) = self.check_runway_claim(sentence, solvency, &mut cited) {
                return outcome;
            }
            if let Some(outcome) = self.check_rate_claims(sentence, aggregated, facts, &mut cited) {
                return outcome;
            }
        }

        ValidationOutcome::accept(cited)
    }

    /// "runway of N years" claims compare against the solvency finding.
    fn check_runway_claim(
        &self,
        sentence: &str,
        solvency: &SolvencyFinding,
        cited: &mut Vec<String>,
    ) -> Option<ValidationOutcome> {
        if !sentence.contains("runway") {
            return None;
        }
        let cap = self.years_re.captures(sentence)?;
        let claim: f64 = cap[1].parse().ok()?;

        if solvency.cash_runway_years.is_infinite() {
            return Some(ValidationOutcome::reject(format!(
                "claimed a runway of {claim:.1} years but the model shows no burn \
                 (unbounded runway): {}",
                solvency.rationale
            )));
        }
        if !self.within_tolerance(claim, solvency.cash_runway_years) {
            return Some(ValidationOutcome::reject(format!(
                "claimed a runway of {claim:.1} years vs the modeled {:.1} years",
                solvency.cash_runway_years
            )));
        }
        let label = "cash runway".to_string();
        if !cited.contains(&label) {
            cited.push(label);
        }
        None
    }

    /// Percentage claims are falsifiable only when the sentence names a rate
    /// the engine models; everything else is treated as qualitative.
    fn check_rate_claims(
        &self,
        sentence: &str,
        aggregated: &AggregatedSimulation,
        facts: &FinancialFacts,
        cited: &mut Vec<String>,
    ) -> Option<ValidationOutcome> {
        let a = &aggregated.assumptions;
        let rate_refs: Vec<(&str, Vec<f64>)> = vec![
            ("growth", vec![a.revenue_growth_mean * 100.0]),
            ("discount", vec![a.discount_rate_mean * 100.0]),
            ("wacc", vec![a.discount_rate_mean * 100.0]),
            ("tax", vec![a.tax_rate_mean * 100.0]),
            ("opex", vec![a.opex_ratio_mean * 100.0]),
            (
                "margin",
                vec![
                    facts.income_statement.gross_margin() * 100.0,
                    facts.income_statement.ebitda_margin() * 100.0,
                ],
            ),
        ];

        // A sentence may name several rates; a claim is good if it matches
        // any rate the sentence names.
        let present: Vec<(&str, Vec<f64>)> = rate_refs
            .into_iter()
            .filter(|(kw, _)| sentence.contains(kw))
            .collect();
        if present.is_empty() {
            return None;
        }

        for cap in self.percent_re.captures_iter(sentence) {
            let Ok(claim) = cap[1].parse::<f64>() else { continue };
            let matched = present.iter().find(|(_, targets)| {
                targets.iter().any(|t| self.within_tolerance(claim, *t))
            });
            match matched {
                Some((keyword, _)) => {
                    let label = format!("{keyword} rate");
                    if !cited.contains(&label) {
                        cited.push(label);
                    }
                }
                None => {
                    let (keyword, targets) = &present[0];
                    return Some(ValidationOutcome::reject(format!(
                        "asserted {claim:.1}% for {keyword}, vs the modeled {:.1}%",
                        targets[0]
                    )));
                }
            }
        }
        None
    }

    /// Find a reference within tolerance, or return the nearest one's
    /// description for the rejection reason.
    fn closest_match(&self, value: f64, references: &[Reference]) -> Result<String, String> {
        let mut nearest: Option<&Reference> = None;
        for r in references {
            if self.within_tolerance(value, r.value) {
                return Ok(r.label.clone());
            }
            let better = match nearest {
                Some(n) => (value - r.value).abs() < (value - n.value).abs(),
                None => true,
            };
            if better {
                nearest = Some(r);
            }
        }
        Err(nearest
            .map(|r| format!("{} = {:.1}", r.label, r.value))
            .unwrap_or_else(|| "no references available".to_string()))
    }

    fn within_tolerance(&self, claim: f64, reference: f64) -> bool {
        (claim - reference).abs() <= self.cfg.relative_tolerance * reference.abs().max(1.0)
    }
}

/// All dollar references a turn may legitimately cite.
fn build_references(aggregated: &AggregatedSimulation, facts: &FinancialFacts) -> Vec<Reference> {
    let mut refs = vec![
        Reference { label: "NPV P10".into(), value: aggregated.npv.p10 },
        Reference { label: "NPV P50".into(), value: aggregated.npv.p50 },
        Reference { label: "NPV P90".into(), value: aggregated.npv.p90 },
        Reference { label: "base revenue".into(), value: facts.income_statement.revenue },
        Reference { label: "base OpEx".into(), value: facts.income_statement.opex },
        Reference { label: "base EBITDA".into(), value: facts.income_statement.ebitda },
        Reference { label: "base net income".into(), value: facts.income_statement.net_income },
        Reference { label: "cash reserves".into(), value: facts.balance_sheet.cash },
        Reference { label: "total assets".into(), value: facts.balance_sheet.total_assets },
    ];
    for (name, series) in [
        ("revenue", &aggregated.revenue_by_year),
        ("EBITDA", &aggregated.ebitda_by_year),
        ("FCF", &aggregated.fcf_by_year),
    ] {
        for (y, band) in series.iter().enumerate() {
            refs.push(Reference {
                label: format!("year-{} median {name}", y + 1),
                value: band.p50,
            });
        }
    }
    refs
}

/// Parse a captured dollar amount with an optional scale suffix.
fn parse_money(number: &str, suffix: Option<&str>) -> Option<f64> {
    let base: f64 = number.replace(',', "").parse().ok()?;
    let scale = match suffix.map(|s| s.to_lowercase()) {
        Some(s) if s == "billion" || s == "bn" || s == "b" => 1e9,
        Some(s) if s == "million" || s == "mm" || s == "m" => 1e6,
        Some(s) if s == "thousand" || s == "k" => 1e3,
        _ => 1.0,
    };
    Some(base * scale)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssumptionSummary, PercentileBand};

    fn validator() -> GroundingValidator {
        GroundingValidator::new(ValidationConfig::default())
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

    fn solvent() -> SolvencyFinding {
        SolvencyFinding {
            is_solvent_per_model: true,
            cash_runway_years: f64::INFINITY,
            rationale: "P50 FCF non-negative in all forecast years".to_string(),
        }
    }

    fn at_risk(runway: f64) -> SolvencyFinding {
        SolvencyFinding {
            is_solvent_per_model: false,
            cash_runway_years: runway,
            rationale: format!("runway {runway:.1} years"),
        }
    }

    // -- Dollar figure checks --

    #[test]
    fn test_accepts_npv_within_tolerance() {
        let outcome = validator().validate(
            "The scenario is attractive: an NPV of $230 against base revenue of $100.",
            &aggregated(),
            &FinancialFacts::sample(),
            &solvent(),
        );
        assert!(outcome.accepted);
        assert!(outcome.cited.contains(&"NPV P50".to_string()));
        assert!(outcome.cited.contains(&"base revenue".to_string()));
    }

    #[test]
    fn test_accepts_npv_at_tolerance_edge() {
        // 230 * 1.019 within the 2% band.
        let outcome = validator().validate(
            "NPV of $234 supports the case.",
            &aggregated(),
            &FinancialFacts::sample(),
            &solvent(),
        );
        assert!(outcome.accepted);
    }

    #[test]
    fn test_rejects_npv_outside_tolerance() {
        let outcome = validator().validate(
            "This yields an NPV of $500, a compelling uplift.",
            &aggregated(),
            &FinancialFacts::sample(),
            &solvent(),
        );
        assert!(!outcome.accepted);
        let reason = outcome.reason.unwrap();
        assert!(reason.contains("$500"));
        assert!(reason.contains("nearest"));
    }

    #[test]
    fn test_money_with_commas_and_suffix() {
        assert_eq!(parse_money("1,250", None), Some(1250.0));
        assert_eq!(parse_money("1.5", Some("billion")), Some(1.5e9));
        assert_eq!(parse_money("20", Some("m")), Some(20e6));
        assert_eq!(parse_money("3", Some("k")), Some(3000.0));
    }

    // -- Insolvency override --

    #[test]
    fn test_rejects_insolvency_claim_against_solvent_model() {
        let outcome = validator().validate(
            "The company faces a liquidity crisis and will be insolvent within a year.",
            &aggregated(),
            &FinancialFacts::sample(),
            &solvent(),
        );
        assert!(!outcome.accepted);
        assert!(outcome.reason.unwrap().contains("SOLVENT"));
    }

    #[test]
    fn test_allows_insolvency_claim_when_model_shows_risk() {
        let outcome = validator().validate(
            "At this burn the company risks insolvency.",
            &aggregated(),
            &FinancialFacts::sample(),
            &at_risk(1.0),
        );
        assert!(outcome.accepted);
    }

    #[test]
    fn test_rejects_insolvency_claim_above_safety_threshold_even_if_finite() {
        let finding = SolvencyFinding {
            is_solvent_per_model: true,
            cash_runway_years: 4.0,
            rationale: "4 years of runway".to_string(),
        };
        let outcome = validator().validate(
            "Bankruptcy looms.",
            &aggregated(),
            &FinancialFacts::sample(),
            &finding,
        );
        assert!(!outcome.accepted);
    }

    // -- Runway claims --

    #[test]
    fn test_rejects_finite_runway_claim_against_unbounded() {
        let outcome = validator().validate(
            "There is a runway of only 1.5 years left.",
            &aggregated(),
            &FinancialFacts::sample(),
            &solvent(),
        );
        assert!(!outcome.accepted);
        assert!(outcome.reason.unwrap().contains("unbounded"));
    }

    #[test]
    fn test_accepts_matching_runway_claim() {
        let outcome = validator().validate(
            "The runway of 1.5 years demands attention.",
            &aggregated(),
            &FinancialFacts::sample(),
            &at_risk(1.5),
        );
        assert!(outcome.accepted);
        assert!(outcome.cited.contains(&"cash runway".to_string()));
    }

    #[test]
    fn test_rejects_mismatched_runway_claim() {
        let outcome = validator().validate(
            "A runway of 6 years gives ample time.",
            &aggregated(),
            &FinancialFacts::sample(),
            &at_risk(1.5),
        );
        assert!(!outcome.accepted);
        assert!(outcome.reason.unwrap().contains("1.5"));
    }

    // -- Rate claims --

    #[test]
    fn test_accepts_correct_growth_rate() {
        let outcome = validator().validate(
            "Modeled revenue growth of 5% compounds favourably.",
            &aggregated(),
            &FinancialFacts::sample(),
            &solvent(),
        );
        assert!(outcome.accepted);
        assert!(outcome.cited.contains(&"growth rate".to_string()));
    }

    #[test]
    fn test_rejects_wrong_growth_rate() {
        let outcome = validator().validate(
            "Revenue growth of 12% justifies the premium.",
            &aggregated(),
            &FinancialFacts::sample(),
            &solvent(),
        );
        assert!(!outcome.accepted);
        let reason = outcome.reason.unwrap();
        assert!(reason.contains("12.0%"));
        assert!(reason.contains("growth"));
    }

    #[test]
    fn test_percentage_without_known_keyword_is_qualitative() {
        let outcome = validator().validate(
            "I am 90% certain this management team executes well.",
            &aggregated(),
            &FinancialFacts::sample(),
            &solvent(),
        );
        assert!(outcome.accepted);
    }

    #[test]
    fn test_accepts_margin_claim_matching_either_margin() {
        // Gross margin 60%, EBITDA margin 30%.
        let outcome = validator().validate(
            "A gross margin of 60% leaves room to absorb shocks.",
            &aggregated(),
            &FinancialFacts::sample(),
            &solvent(),
        );
        assert!(outcome.accepted);
    }

    // -- Qualitative content --

    #[test]
    fn test_pure_qualitative_always_accepted() {
        let outcome = validator().validate(
            "The distribution looks resilient and the downside appears contained; \
             I would characterise the scenario as constructive.",
            &aggregated(),
            &FinancialFacts::sample(),
            &solvent(),
        );
        assert!(outcome.accepted);
        assert!(outcome.cited.is_empty());
    }

    // -- Fabricated drivers --

    #[test]
    fn test_rejects_fabricated_driver() {
        let outcome = validator().validate(
            "Strong pre-order volumes for the new product will lift revenue.",
            &aggregated(),
            &FinancialFacts::sample(),
            &solvent(),
        );
        assert!(!outcome.accepted);
        assert!(outcome.reason.unwrap().contains("does not exist in the supplied data"));
    }
}
