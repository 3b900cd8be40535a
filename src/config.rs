//! Configuration data shapes (§6, §3 "Configuration (expansion)").
//!
//! These mirror `config.py`/`config_loader.py`'s YAML shapes field-for-field
//! so a caller can deserialize the same documents. The loader and
//! file-watcher that turn YAML/JSON into these snapshots are out of scope
//! (§1); only the shapes and their defaults live here.

use serde::{Deserialize, Serialize};

use crate::council::{Advisor, RubricCriterion, RoutingPolicy};

/// One entry in the global model roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Backend id, e.g. `"anthropic/claude-opus-4"`.
    pub id: String,
    /// Human-readable display name.
    pub name: String,
}

/// Per-stage sampling temperatures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StageTemperatures {
    pub stage1: f32,
    pub stage2: f32,
    pub stage3: f32,
}

impl Default for StageTemperatures {
    fn default() -> Self {
        StageTemperatures { stage1: 0.5, stage2: 0.3, stage3: 0.7 }
    }
}

/// Deliberation round configuration.
///
/// `max_rounds` is kept for forward compatibility (§9 open question); this
/// implementation always runs exactly one Stage-2 round regardless of its
/// value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeliberationConfig {
    pub rounds: u32,
    pub max_rounds: u32,
    pub temperatures: StageTemperatures,
}

impl Default for DeliberationConfig {
    fn default() -> Self {
        DeliberationConfig { rounds: 2, max_rounds: 5, temperatures: StageTemperatures::default() }
    }
}

/// Response formatting style.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseConfig {
    /// `"standard"` or `"concise"`; `"concise"` prefixes the Stage-1 user
    /// prompt with an explicit brevity instruction (mirrors
    /// `stage1.py::response_style`).
    pub response_style: String,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        ResponseConfig { response_style: "standard".into() }
    }
}

/// Backend call timeout/retry policy (§5, §7).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub default_timeout_secs: u64,
    pub streaming_chunk_timeout_secs: u64,
    pub connection_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_factor: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            default_timeout_secs: 120,
            streaming_chunk_timeout_secs: 120,
            connection_timeout_secs: 30,
            max_retries: 1,
            retry_backoff_factor: 2,
        }
    }
}

/// Global, process-wide model configuration. Read-mostly: reloads replace
/// the in-memory snapshot atomically (§5 "Shared-resource policy").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// The full roster of models available to any council.
    pub models: Vec<ModelInfo>,
    /// Backend id used for Stage-3 synthesis and direct answers.
    pub chairman: String,
    /// Backend id used for classification, routing, and titling (cheap/fast).
    pub title_model: String,
    pub deliberation: DeliberationConfig,
    pub response_config: ResponseConfig,
    pub timeout_config: TimeoutConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            models: vec![
                ModelInfo { id: "anthropic/claude-opus-4".into(), name: "Claude Opus 4".into() },
                ModelInfo { id: "openai/gpt-5.1".into(), name: "GPT-5.1".into() },
                ModelInfo { id: "google/gemini-3-pro-preview".into(), name: "Gemini 3 Pro".into() },
            ],
            chairman: "anthropic/claude-opus-4".into(),
            title_model: "google/gemini-2.5-flash".into(),
            deliberation: DeliberationConfig::default(),
            response_config: ResponseConfig::default(),
            timeout_config: TimeoutConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// The ids of every configured model, in declaration order.
    pub fn model_ids(&self) -> Vec<String> {
        self.models.iter().map(|m| m.id.clone()).collect()
    }
}

/// Per-council configuration document, as loaded from `config/councils/*.yaml`.
///
/// This is the on-disk shape; [`crate::council::Council`] is the validated,
/// in-memory form the rest of the pipeline consumes. `CouncilConfig::into_council`
/// performs that conversion given the global model roster as the council's
/// available backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilConfig {
    pub id: String,
    pub name: String,
    pub description: String,
    pub personas: Vec<Advisor>,
    pub rubric: Vec<RubricCriterion>,
    pub routing: RoutingPolicyConfig,
}

/// On-disk routing policy field names (`min_advisors`/`max_advisors`/
/// `default_advisors`), matching `config_loader.py::get_routing_config`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RoutingPolicyConfig {
    pub min_advisors: usize,
    pub max_advisors: usize,
    pub default_advisors: usize,
}

impl From<RoutingPolicyConfig> for RoutingPolicy {
    fn from(c: RoutingPolicyConfig) -> Self {
        RoutingPolicy { min: c.min_advisors, max: c.max_advisors, default: c.default_advisors }
    }
}

impl CouncilConfig {
    /// Build a validated [`crate::council::Council`] from this document,
    /// using `available_backends` (normally the global model roster) as the
    /// set of backends this council may route to.
    pub fn into_council(self, available_backends: Vec<String>) -> crate::council::Council {
        crate::council::Council {
            id: self.id,
            name: self.name,
            personas: self.personas,
            rubric: self.rubric,
            routing: self.routing.into(),
            available_backends,
        }
    }
}
