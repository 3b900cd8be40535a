//! Pipeline-level scenario tests exercising the driver end to end with an
//! in-memory `ConversationStore` and `Leaderboard`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;

use deliberation_engine::aggregator::{self, Conflict, Evaluation, Severity};
use deliberation_engine::backend::{Backend, BackendError, BackendRegistry, CompletionResult, EventStream, Message, StreamEvent, Usage};
use deliberation_engine::classifier::{self, MessageType};
use deliberation_engine::config::GlobalConfig;
use deliberation_engine::conversation::InMemoryConversationStore;
use deliberation_engine::council::{Advisor, Council, RoutingPolicy, RubricCriterion};
use deliberation_engine::leaderboard::Leaderboard;
use deliberation_engine::pipeline::{self, ExecutionMode, Request};
use deliberation_engine::ranking::ParsedRanking;
use deliberation_engine::router;

fn ranking(order: &[&str]) -> ParsedRanking {
    ParsedRanking { order: order.iter().map(|s| s.to_string()).collect(), ..Default::default() }
}

fn eval(evaluator: &str, backend: &str, order: &[&str]) -> Evaluation {
    Evaluation { evaluator_id: evaluator.into(), backend_id: backend.into(), ranking: ranking(order) }
}

fn label_map() -> HashMap<String, String> {
    [
        ("Response A".to_string(), "model-a".to_string()),
        ("Response B".to_string(), "model-b".to_string()),
        ("Response C".to_string(), "model-c".to_string()),
        ("Response D".to_string(), "model-d".to_string()),
    ]
    .into_iter()
    .collect()
}

/// S1 — Three-advisor Borda winner.
#[test]
fn s1_three_advisor_borda_winner() {
    let evaluations = vec![
        eval("a", "model-a", &["Response A", "Response B", "Response C"]),
        eval("b", "model-b", &["Response B", "Response A", "Response C"]),
        eval("c", "model-c", &["Response A", "Response C", "Response B"]),
    ];
    let bundle = aggregator::aggregate(&evaluations, &label_map());

    let scores: HashMap<&str, f64> = bundle.scores.iter().map(|(l, s)| (l.as_str(), *s)).collect();
    assert_eq!(scores["Response A"], 8.0);
    assert_eq!(scores["Response B"], 6.0);
    assert_eq!(scores["Response C"], 4.0);
    assert_eq!(bundle.winner, Some("Response A".to_string()));
}

/// S2 — Ranking-swap conflict: spread 3 on both endpoints yields `medium`.
#[test]
fn s2_ranking_swap_conflict_is_medium_severity() {
    let evaluations = vec![
        eval("a", "model-a", &["Response A", "Response B", "Response C", "Response D"]),
        eval("b", "model-b", &["Response D", "Response C", "Response B", "Response A"]),
    ];
    let conflicts = aggregator::detect_ranking_conflicts(&evaluations, &label_map());

    let a_conflict = conflicts.iter().find(|c| matches!(c, Conflict::RankingSpread { label, .. } if label == "Response A"));
    assert!(matches!(a_conflict, Some(Conflict::RankingSpread { severity: Severity::Medium, min_pos: 0, max_pos: 3, .. })));

    let d_conflict = conflicts.iter().find(|c| matches!(c, Conflict::RankingSpread { label, .. } if label == "Response D"));
    assert!(matches!(d_conflict, Some(Conflict::RankingSpread { severity: Severity::Medium, .. })));
}

/// S3 — Mutual opposition: each of two evaluators ranks the other's own
/// response last in a three-panel, which should trip the threshold.
#[test]
fn s3_mutual_opposition_detected_at_threshold() {
    let evaluations = vec![
        eval("a", "model-a", &["Response A", "Response C", "Response B"]),
        eval("b", "model-b", &["Response B", "Response C", "Response A"]),
        eval("c", "model-c", &["Response C", "Response A", "Response B"]),
    ];
    let mut label_to_backend = HashMap::new();
    label_to_backend.insert("Response A".to_string(), "model-a".to_string());
    label_to_backend.insert("Response B".to_string(), "model-b".to_string());
    label_to_backend.insert("Response C".to_string(), "model-c".to_string());

    let conflicts = aggregator::detect_ranking_conflicts(&evaluations, &label_to_backend);
    let mutual = conflicts
        .iter()
        .filter(|c| matches!(c, Conflict::MutualOpposition { severity: Severity::High, .. }))
        .count();
    assert!(mutual >= 1, "expected at least one mutual-opposition conflict, got {:?}", conflicts);
}

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
        unimplemented!("not exercised by this scenario")
    }
}

/// S4 — Classifier heuristic fast path: a back-reference phrase with
/// non-empty history returns `followup` without touching the backend.
#[tokio::test]
async fn s4_classifier_heuristic_fast_path() {
    let backend: Arc<dyn Backend> = Arc::new(StubBackend { reply: "should never be read".into() });
    let history = [Message::user("earlier turn")];
    let result = classifier::classify(&backend, "also can you elaborate", &history).await;
    assert_eq!(result.message_type, MessageType::Followup);
}

fn five_advisor_council() -> Council {
    Council {
        id: "test".into(),
        name: "Test".into(),
        personas: (0..5)
            .map(|i| Advisor {
                id: format!("advisor-{}", i),
                name: format!("Advisor {}", i),
                role: "generalist".into(),
                instruction_prompt: "Be helpful.".into(),
                tags: vec![],
            })
            .collect(),
        rubric: vec![RubricCriterion { name: "accuracy".into(), weight: 1.0, description: "".into() }],
        routing: RoutingPolicy { min: 2, max: 4, default: 3 },
        available_backends: vec!["m1".into(), "m2".into(), "m3".into()],
    }
}

/// S5 — Router fallback: an invalid-JSON routing reply produces the
/// deterministic fallback panel (first `default` advisors, round-robin
/// backends, reasoning `"fallback selection"`).
#[tokio::test]
async fn s5_router_fallback_on_invalid_json() {
    let backend: Arc<dyn Backend> = Arc::new(StubBackend { reply: "not valid json at all".into() });
    let council = five_advisor_council();
    let panel = router::route(&backend, "question", &council).await;

    assert_eq!(panel.members.len(), 3);
    assert_eq!(panel.members[0].advisor_id, "advisor-0");
    assert_eq!(panel.members[1].advisor_id, "advisor-1");
    assert_eq!(panel.members[2].advisor_id, "advisor-2");
    assert_eq!(panel.members[0].backend_id, "m1");
    assert_eq!(panel.members[1].backend_id, "m2");
    assert_eq!(panel.members[2].backend_id, "m3");
    assert!(panel.members.iter().all(|m| m.reasoning == "fallback selection"));
}

struct SlowBackend {
    id: String,
}

#[async_trait]
impl Backend for SlowBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(
        &self,
        _messages: &[Message],
        _temperature: Option<f32>,
        _max_tokens: Option<u32>,
        _timeout: Option<Duration>,
    ) -> Result<CompletionResult, BackendError> {
        // Used by the classifier and router, which both degrade gracefully
        // on unparseable content, so an empty reply is enough here.
        Ok(CompletionResult::default())
    }

    async fn stream(
        &self,
        _messages: &[Message],
        _temperature: Option<f32>,
        _max_tokens: Option<u32>,
    ) -> Result<EventStream, BackendError> {
        // Long enough that the 1 ms sleep below always wins the race,
        // so the driver is reliably mid-Stage-1 when its future is dropped.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let events = vec![
            StreamEvent::Content { delta: "partial ".into(), cumulative: "partial ".into() },
            StreamEvent::Content { delta: "answer".into(), cumulative: "partial answer".into() },
            StreamEvent::Complete {
                content: "partial answer".into(),
                reasoning_content: String::new(),
                usage: Usage::default(),
            },
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// S6 — Cancellation mid-Stage-1: dropping the driver's future before it
/// resolves must not persist an assistant record.
#[tokio::test]
async fn s6_cancellation_mid_stage1_persists_nothing() {
    let registry = BackendRegistry::new(vec![
        Arc::new(SlowBackend { id: "chairman".into() }),
        Arc::new(SlowBackend { id: "title".into() }),
        Arc::new(SlowBackend { id: "m1".into() }),
        Arc::new(SlowBackend { id: "m2".into() }),
    ]);
    let store: Arc<dyn deliberation_engine::conversation::ConversationStore> = InMemoryConversationStore::shared();
    let leaderboard = Leaderboard::new();
    let council = Council {
        id: "test".into(),
        name: "Test".into(),
        personas: vec![
            Advisor { id: "a".into(), name: "A".into(), role: "generalist".into(), instruction_prompt: "".into(), tags: vec![] },
            Advisor { id: "b".into(), name: "B".into(), role: "skeptic".into(), instruction_prompt: "".into(), tags: vec![] },
        ],
        rubric: vec![],
        routing: RoutingPolicy { min: 1, max: 2, default: 2 },
        available_backends: vec!["m1".into(), "m2".into()],
    };
    let mut config = GlobalConfig::default();
    config.chairman = "chairman".into();
    config.title_model = "title".into();

    let request = Request {
        conversation_id: "c1".into(),
        question: "brand new deliberation question".into(),
        mode: ExecutionMode::Full,
        force_direct: false,
    };

    let run_future = pipeline::run(&registry, &council, &config, &store, &leaderboard, request);
    {
        // Poll the future briefly, then drop it, simulating a client
        // disconnect mid-Stage-1 before any stage resolves.
        tokio::select! {
            _ = run_future => {}
            _ = tokio::time::sleep(Duration::from_millis(1)) => {}
        }
    }

    let conversation = store.get("c1").await.unwrap();
    assert!(conversation.turns.iter().all(|t| !matches!(t, deliberation_engine::conversation::Turn::Assistant(_))));
}
