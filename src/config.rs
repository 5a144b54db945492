//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (API keys) are referenced by env-var name in the config and
//! resolved at runtime via `std::env::var`. Every component receives its
//! sub-config as an immutable value — nothing reads global state, so the
//! simulator and validators stay independently testable.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub engine: EngineConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub debate: DebateConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub scenario: ScenarioInput,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    pub name: String,
}

/// Monte Carlo simulation parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct SimulationConfig {
    /// Trajectory count, fixed at simulation start.
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    /// Explicit forecast horizon in years.
    #[serde(default = "default_horizon")]
    pub horizon_years: usize,
    /// Gordon-growth perpetuity rate beyond the horizon.
    #[serde(default = "default_long_run_growth")]
    pub long_run_growth: f64,
    /// Policy bound: deltas with magnitude above this are rejected.
    #[serde(default = "default_max_delta_bps")]
    pub max_delta_bps: i32,
    /// Fail the whole simulation when more than this fraction of
    /// trajectories is invalid (discount rate ≤ terminal growth).
    #[serde(default = "default_max_invalid_fraction")]
    pub max_invalid_fraction: f64,
    /// WACC fallback when neither history nor KPIs provide one.
    #[serde(default = "default_discount_rate")]
    pub default_discount_rate: f64,
}

fn default_iterations() -> usize {
    10_000
}
fn default_horizon() -> usize {
    5
}
fn default_long_run_growth() -> f64 {
    0.02
}
fn default_max_delta_bps() -> i32 {
    2_000
}
fn default_max_invalid_fraction() -> f64 {
    0.05
}
fn default_discount_rate() -> f64 {
    0.08
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            horizon_years: default_horizon(),
            long_run_growth: default_long_run_growth(),
            max_delta_bps: default_max_delta_bps(),
            max_invalid_fraction: default_max_invalid_fraction(),
            default_discount_rate: default_discount_rate(),
        }
    }
}

/// Debate orchestration parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct DebateConfig {
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    /// Judge agreement score at or above which the debate converges.
    #[serde(default = "default_convergence_threshold")]
    pub convergence_threshold: f64,
    /// Re-generations allowed per turn after a validator rejection.
    #[serde(default = "default_turn_retry_limit")]
    pub turn_retry_limit: u32,
}

fn default_max_rounds() -> u32 {
    5
}
fn default_convergence_threshold() -> f64 {
    0.8
}
fn default_turn_retry_limit() -> u32 {
    1
}

impl Default for DebateConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            convergence_threshold: default_convergence_threshold(),
            turn_retry_limit: default_turn_retry_limit(),
        }
    }
}

/// Grounding validation parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct ValidationConfig {
    /// Relative tolerance for numeric claims vs. computed references.
    #[serde(default = "default_relative_tolerance")]
    pub relative_tolerance: f64,
    /// Insolvency claims are rejected outright when the modeled runway
    /// exceeds this many years.
    #[serde(default = "default_runway_safety_years")]
    pub runway_safety_years: f64,
}

fn default_relative_tolerance() -> f64 {
    0.02
}
fn default_runway_safety_years() -> f64 {
    2.0
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            relative_tolerance: default_relative_tolerance(),
            runway_safety_years: default_runway_safety_years(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub api_key_env: String,
    pub max_tokens: u32,
    /// Fallback model for OpenRouter (used when primary model fails).
    #[serde(default)]
    pub fallback_model: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_dir")]
    pub dir: String,
}

fn default_storage_dir() -> String {
    "scenarios".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { dir: default_storage_dir() }
    }
}

/// The scenario the binary runs: facts file plus the what-if deltas.
#[derive(Debug, Deserialize, Clone)]
pub struct ScenarioInput {
    pub facts_path: String,
    #[serde(default)]
    pub revenue_growth_delta_bps: i32,
    #[serde(default)]
    pub opex_delta_bps: i32,
    #[serde(default)]
    pub discount_rate_delta_bps: i32,
    /// Explicit Monte Carlo seed for reproducible runs.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_seed() -> u64 {
    42
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}
