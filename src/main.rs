//! COUNTERFACTUAL — What-If Financial Scenario Analysis Engine
//!
//! Entry point. Loads configuration, initialises structured logging, reads
//! the base financial facts, and runs one scenario analysis end-to-end:
//! Monte Carlo simulation → solvency gate → adversarial debate → verdict.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use counterfactual::config::{self, AppConfig};
use counterfactual::engine::ScenarioPipeline;
use counterfactual::llm::anthropic::AnthropicClient;
use counterfactual::llm::openrouter::OpenRouterClient;
use counterfactual::llm::ReasoningModel;
use counterfactual::storage::ScenarioStore;
use counterfactual::types::{FinancialFacts, ScenarioDelta};

const BANNER: &str = r#"
  ____ ___  _   _ _   _ _____ _____ ____  _____ _    ____ _____ _   _   _    _
 / ___/ _ \| | | | \ | |_   _| ____|  _ \|  ___/ \  / ___|_   _| | | | / \  | |
| |  | | | | | | |  \| | | | |  _| | |_) | |_ / _ \| |     | | | | | |/ _ \ | |
| |__| |_| | |_| | |\  | | | | |___|  _ <|  _/ ___ \ |___  | | | |_| / ___ \| |___
 \____\___/ \___/|_| \_| |_| |_____|_| \_\_|/_/   \_\____| |_|  \___/_/   \_\_____|

  What-If Financial Scenario Analysis Engine
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    // Load configuration from TOML
    let cfg = AppConfig::load("config.toml")?;

    // Initialise structured logging
    init_logging();

    println!("{BANNER}");
    info!(
        engine_name = %cfg.engine.name,
        iterations = cfg.simulation.iterations,
        horizon_years = cfg.simulation.horizon_years,
        max_rounds = cfg.debate.max_rounds,
        "COUNTERFACTUAL starting up"
    );

    // -- Load the base facts ----------------------------------------------

    let facts_json = std::fs::read_to_string(&cfg.scenario.facts_path)
        .with_context(|| format!("Failed to read facts file: {}", cfg.scenario.facts_path))?;
    let facts: FinancialFacts = serde_json::from_str(&facts_json)
        .with_context(|| format!("Failed to parse facts file: {}", cfg.scenario.facts_path))?;
    info!(facts = %facts, "Base financial facts loaded");

    let delta = ScenarioDelta {
        revenue_growth_delta_bps: cfg.scenario.revenue_growth_delta_bps,
        opex_delta_bps: cfg.scenario.opex_delta_bps,
        discount_rate_delta_bps: cfg.scenario.discount_rate_delta_bps,
    };

    // -- Initialise the reasoning backend ---------------------------------

    let api_key = config::AppConfig::resolve_env(&cfg.llm.api_key_env)
        .with_context(|| "Reasoning backend API key missing")?;

    let model: Arc<dyn ReasoningModel> = match cfg.llm.provider.as_str() {
        "anthropic" => {
            info!(model = %cfg.llm.model, "Using Anthropic reasoning backend");
            Arc::new(AnthropicClient::new(
                api_key,
                Some(cfg.llm.model.clone()),
                Some(cfg.llm.max_tokens),
            )?)
        }
        "openrouter" => {
            info!(
                model = %cfg.llm.model,
                fallback = ?cfg.llm.fallback_model,
                "Using OpenRouter reasoning backend"
            );
            Arc::new(OpenRouterClient::new(
                api_key,
                Some(cfg.llm.model.clone()),
                cfg.llm.fallback_model.clone(),
                Some(cfg.llm.max_tokens),
            )?)
        }
        other => {
            warn!(provider = other, "Unknown reasoning provider, defaulting to OpenRouter");
            Arc::new(OpenRouterClient::new(
                api_key,
                Some(cfg.llm.model.clone()),
                cfg.llm.fallback_model.clone(),
                Some(cfg.llm.max_tokens),
            )?)
        }
    };

    // -- Run the pipeline --------------------------------------------------

    let pipeline = ScenarioPipeline::new(
        cfg.simulation.clone(),
        cfg.debate.clone(),
        cfg.validation.clone(),
        model,
        ScenarioStore::new(cfg.storage.dir.clone()),
    );

    let scenario_id = Uuid::new_v4();
    info!(%scenario_id, %delta, seed = cfg.scenario.seed, "Running scenario analysis");

    let verdict = pipeline
        .run_scenario_analysis(scenario_id, &facts, &delta, cfg.scenario.seed)
        .await?;

    info!(%scenario_id, verdict = %verdict, "Analysis finished");
    for line in &verdict.comparative_analysis {
        info!(point = %line, "Comparative analysis");
    }

    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("counterfactual=info"));

    let json_logging = std::env::var("COUNTERFACTUAL_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
