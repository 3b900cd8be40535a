//! The Council data model: advisor personas, rubric, routing policy, and the
//! ephemeral [`Panel`] the [`crate::router::Router`] assembles for a single
//! question.
//!
//! Grounded in `council_session.rs`'s `ParticipantConfig` shape, generalized
//! from a single collaboration session to the deliberation engine's
//! classify/route/generate/rank/synthesize pipeline (§3).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// A fixed persona belonging to a [`Council`].
///
/// Identity (`id`) is stable across requests; it is what the Router
/// selects and what Stage-1/2 key their outputs on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Advisor {
    /// Stable identifier, unique within the owning council.
    pub id: String,
    /// Human-readable display name.
    pub name: String,
    /// Short role description shown to the router and in prompts.
    pub role: String,
    /// System-prompt instructions that prime this advisor's persona.
    pub instruction_prompt: String,
    /// Free-form tags used by the router to match advisors to questions.
    pub tags: Vec<String>,
}

/// One weighted criterion in a council's evaluation rubric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RubricCriterion {
    /// Criterion name, unique within the rubric (e.g. `"accuracy"`).
    pub name: String,
    /// Relative weight in `(0, 1]`. Not consumed by Borda scoring (§9); kept
    /// on the record for a future weighted-aggregator variant.
    pub weight: f32,
    /// Short description shown to Stage-2 evaluators.
    pub description: String,
}

/// `{min, max, default}` advisor counts for panel selection.
///
/// Invariant: `1 <= min <= default <= max <= |personas|`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RoutingPolicy {
    /// Minimum panel size. Fewer valid entries triggers the deterministic
    /// fallback (§4.3).
    pub min: usize,
    /// Maximum panel size; the router trims to this after validation.
    pub max: usize,
    /// Panel size used by the deterministic fallback.
    pub default: usize,
}

/// Errors that can occur validating a [`Council`]'s static shape.
#[derive(Debug, Clone)]
pub enum CouncilConfigError {
    /// Two personas share an `id`.
    DuplicateAdvisorId(String),
    /// Two rubric criteria share a `name`.
    DuplicateRubricName(String),
    /// `routing` does not satisfy `1 <= min <= default <= max <= |personas|`.
    InvalidRoutingPolicy(String),
}

impl std::fmt::Display for CouncilConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CouncilConfigError::DuplicateAdvisorId(id) => {
                write!(f, "duplicate advisor id: {}", id)
            }
            CouncilConfigError::DuplicateRubricName(name) => {
                write!(f, "duplicate rubric criterion name: {}", name)
            }
            CouncilConfigError::InvalidRoutingPolicy(msg) => {
                write!(f, "invalid routing policy: {}", msg)
            }
        }
    }
}

impl std::error::Error for CouncilConfigError {}

/// A named council: a roster of advisors, a rubric, a routing policy, and
/// the backend ids available to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Council {
    /// Stable council identifier (e.g. `"personal"`, `"protocol"`).
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Advisor roster, in the order used by the router's deterministic
    /// fallback (§4.3 step 4).
    pub personas: Vec<Advisor>,
    /// Ordered rubric criteria; order is preserved into prompts and records.
    pub rubric: Vec<RubricCriterion>,
    /// `{min, max, default}` panel-size policy.
    pub routing: RoutingPolicy,
    /// Backend ids this council may draw on, in insertion order (the order
    /// used for round-robin substitution).
    pub available_backends: Vec<String>,
}

impl Council {
    /// Validate the invariants in §3: unique persona ids, unique rubric
    /// names, and a routing policy consistent with the roster size.
    pub fn validate(&self) -> Result<(), CouncilConfigError> {
        let mut seen_ids = HashSet::new();
        for advisor in &self.personas {
            if !seen_ids.insert(advisor.id.as_str()) {
                return Err(CouncilConfigError::DuplicateAdvisorId(advisor.id.clone()));
            }
        }

        let mut seen_names = HashSet::new();
        for criterion in &self.rubric {
            if !seen_names.insert(criterion.name.as_str()) {
                return Err(CouncilConfigError::DuplicateRubricName(criterion.name.clone()));
            }
        }

        let routing = self.routing;
        if routing.min < 1
            || routing.min > routing.default
            || routing.default > routing.max
            || routing.max > self.personas.len()
        {
            return Err(CouncilConfigError::InvalidRoutingPolicy(format!(
                "expected 1 <= min({}) <= default({}) <= max({}) <= personas({})",
                routing.min,
                routing.default,
                routing.max,
                self.personas.len()
            )));
        }

        Ok(())
    }

    /// Look up a persona by id.
    pub fn advisor(&self, id: &str) -> Option<&Advisor> {
        self.personas.iter().find(|a| a.id == id)
    }
}

/// One assignment in a [`Panel`]: an advisor bound to a backend for a
/// single question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelMember {
    /// Advisor id; must exist in the owning council.
    pub advisor_id: String,
    /// Backend id; must be a member of the council's `available_backends`.
    pub backend_id: String,
    /// One-line reason the router recorded for this assignment.
    pub reasoning: String,
}

/// The per-question subset of advisors selected and bound to backends by
/// the [`crate::router::Router`]. Ephemeral: created per request, consumed
/// unchanged by Stages 1-3.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Panel {
    /// Selected members, in the order Stage-1 assigns response labels
    /// (`A, B, C, ...`).
    pub members: Vec<PanelMember>,
}

impl Panel {
    /// Number of members in the panel.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the panel has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
