//! The Router (Stage 0b, §4.3): assembles a [`Panel`] for a single question
//! from a council's roster, with a deterministic fallback when the LLM's
//! selection can't be validated into a usable panel.
//!
//! Grounded in `original_source/backend/council/routing.py::stage0_route_question`
//! and `_fallback_panel`.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::backend::{Backend, Message};
use crate::council::{Council, Panel, PanelMember};

#[derive(Debug, Deserialize)]
struct RawSelection {
    advisor_id: String,
    #[serde(default)]
    backend_id: Option<String>,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Deserialize)]
struct RoutingReply {
    #[serde(default)]
    selections: Vec<RawSelection>,
}

fn build_prompt(q: &str, council: &Council) -> Vec<Message> {
    let roster: String = council
        .personas
        .iter()
        .map(|a| format!("- {} ({}): {}\n", a.id, a.role, a.tags.join(", ")))
        .collect();
    vec![
        Message::system(format!(
            "Select between {} and {} advisors from this roster to answer the question, \
             assigning each a backend id from {:?}. Respond with strict JSON: \
             {{\"selections\": [{{\"advisor_id\": ..., \"backend_id\": ..., \"reasoning\": ...}}]}}.\n\nRoster:\n{}",
            council.routing.min, council.routing.max, council.available_backends, roster
        )),
        Message::user(q.to_string()),
    ]
}

/// The deterministic fallback panel: the first `default` advisors in
/// council order, each assigned `available[i mod |available|]` (§4.3 step 4).
pub fn fallback_panel(council: &Council) -> Panel {
    let members = council
        .personas
        .iter()
        .take(council.routing.default)
        .enumerate()
        .map(|(i, advisor)| PanelMember {
            advisor_id: advisor.id.clone(),
            backend_id: council.available_backends[i % council.available_backends.len()].clone(),
            reasoning: "fallback selection".into(),
        })
        .collect();
    Panel { members }
}

/// Validate a raw LLM selection into panel members: drop entries whose
/// `advisor_id` is unknown; substitute round-robin for unavailable backend
/// ids (§4.3 step 3).
fn validate_selection(council: &Council, raw: Vec<RawSelection>) -> Vec<PanelMember> {
    let mut kept = Vec::new();
    for selection in raw {
        if council.advisor(&selection.advisor_id).is_none() {
            continue;
        }
        let backend_id = match &selection.backend_id {
            Some(id) if council.available_backends.contains(id) => id.clone(),
            _ => council.available_backends[kept.len() % council.available_backends.len()].clone(),
        };
        kept.push(PanelMember { advisor_id: selection.advisor_id, backend_id, reasoning: selection.reasoning });
    }
    kept
}

/// Select a [`Panel`] for `q` from `council`, falling back deterministically
/// when the LLM's reply can't be validated into at least `min` members
/// (§4.3). Never fails: an empty `available_backends` produces an empty
/// panel, which the driver surfaces as `PanelInfeasible`.
pub async fn route(backend: &Arc<dyn Backend>, q: &str, council: &Council) -> Panel {
    if council.available_backends.is_empty() || council.personas.is_empty() {
        return Panel::default();
    }

    let messages = build_prompt(q, council);
    let result = backend.complete(&messages, Some(0.0), Some(500), Some(Duration::from_secs(30))).await;

    let mut members = match result {
        Ok(completion) => match serde_json::from_str::<RoutingReply>(completion.content.trim()) {
            Ok(reply) => validate_selection(council, reply.selections),
            Err(_) => Vec::new(),
        },
        Err(_) => Vec::new(),
    };

    if members.len() < council.routing.min {
        members = fallback_panel(council).members;
    }

    members.truncate(council.routing.max);
    Panel { members }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, CompletionResult, EventStream};
    use crate::council::{Advisor, RoutingPolicy, RubricCriterion};
    use async_trait::async_trait;

    struct StubBackend {
        reply: String,
    }

    #[async_trait]
    impl Backend for StubBackend {
        fn id(&self) -> &str {
            "stub"
        }

        async fn complete(
            &self,
            _messages: &[Message],
            _temperature: Option<f32>,
            _max_tokens: Option<u32>,
            _timeout: Option<Duration>,
        ) -> Result<CompletionResult, BackendError> {
            Ok(CompletionResult { content: self.reply.clone(), ..Default::default() })
        }

        async fn stream(
            &self,
            _messages: &[Message],
            _temperature: Option<f32>,
            _max_tokens: Option<u32>,
        ) -> Result<EventStream, BackendError> {
            unimplemented!("not exercised by router tests")
        }
    }

    fn sample_council() -> Council {
        Council {
            id: "test".into(),
            name: "Test Council".into(),
            personas: vec![
                Advisor { id: "a".into(), name: "A".into(), role: "generalist".into(), instruction_prompt: "".into(), tags: vec![] },
                Advisor { id: "b".into(), name: "B".into(), role: "skeptic".into(), instruction_prompt: "".into(), tags: vec![] },
                Advisor { id: "c".into(), name: "C".into(), role: "optimist".into(), instruction_prompt: "".into(), tags: vec![] },
            ],
            rubric: vec![RubricCriterion { name: "accuracy".into(), weight: 1.0, description: "".into() }],
            routing: RoutingPolicy { min: 1, max: 2, default: 2 },
            available_backends: vec!["m1".into(), "m2".into()],
        }
    }

    #[tokio::test]
    async fn valid_selection_is_used_as_is() {
        let backend: Arc<dyn Backend> = Arc::new(StubBackend {
            reply: r#"{"selections":[{"advisor_id":"a","backend_id":"m1","reasoning":"fits"}]}"#.into(),
        });
        let panel = route(&backend, "question", &sample_council()).await;
        assert_eq!(panel.members.len(), 1);
        assert_eq!(panel.members[0].advisor_id, "a");
        assert_eq!(panel.members[0].backend_id, "m1");
    }

    #[tokio::test]
    async fn unknown_backend_id_is_round_robin_substituted() {
        let backend: Arc<dyn Backend> = Arc::new(StubBackend {
            reply: r#"{"selections":[{"advisor_id":"a","backend_id":"nonexistent","reasoning":"x"}]}"#.into(),
        });
        let panel = route(&backend, "question", &sample_council()).await;
        assert_eq!(panel.members[0].backend_id, "m1");
    }

    #[tokio::test]
    async fn unparseable_reply_falls_back_deterministically() {
        let backend: Arc<dyn Backend> = Arc::new(StubBackend { reply: "not json".into() });
        let panel = route(&backend, "question", &sample_council()).await;
        assert_eq!(panel.members.len(), 2);
        assert_eq!(panel.members[0].advisor_id, "a");
        assert_eq!(panel.members[1].advisor_id, "b");
        assert!(panel.members.iter().all(|m| m.reasoning == "fallback selection"));
    }

    #[tokio::test]
    async fn panel_is_trimmed_to_max() {
        let backend: Arc<dyn Backend> = Arc::new(StubBackend {
            reply: r#"{"selections":[
                {"advisor_id":"a","backend_id":"m1","reasoning":"x"},
                {"advisor_id":"b","backend_id":"m2","reasoning":"x"},
                {"advisor_id":"c","backend_id":"m1","reasoning":"x"}
            ]}"#
            .into(),
        });
        let panel = route(&backend, "question", &sample_council()).await;
        assert_eq!(panel.members.len(), 2);
    }

    #[test]
    fn fallback_panel_assigns_round_robin_backends() {
        let panel = fallback_panel(&sample_council());
        assert_eq!(panel.members.len(), 2);
        assert_eq!(panel.members[0].backend_id, "m1");
        assert_eq!(panel.members[1].backend_id, "m2");
    }
}
