//! The pipeline driver (§4.9): the per-request state machine that
//! composes Classifier → Router → Stage-1 → Stage-2 → Stage-3, owns the
//! bounded event queue, folds in usage accounting, and persists the
//! finished turn.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{Backend, BackendRegistry, Usage};
use crate::classifier::{self, MessageType};
use crate::conversation::{AssistantRecord, ConversationStore, Exchange};
use crate::council::Council;
use crate::error::DeliberationError;
use crate::event::{Event, EventReceiver, EventSender};
use crate::leaderboard::{Leaderboard, ParticipantResult};
use crate::router;
use crate::stage1;
use crate::stage2;
use crate::stage3;
use crate::token_accountant::UsageAggregator;

/// Where the pipeline stops short of full synthesis (§4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Stop after Stage-1; promote the first panel member's response.
    Chat,
    /// Stop after Stage-2; promote the top-aggregate backend's response.
    Ranked,
    /// Run through Stage-3 synthesis.
    Full,
}

/// Per-request input to the driver.
pub struct Request {
    pub conversation_id: String,
    pub question: String,
    pub mode: ExecutionMode,
    /// Skip classification and routing entirely and answer directly
    /// (§4.9 "force_direct").
    pub force_direct: bool,
}

const EVENT_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(50);

/// Drains the bounded queue on the fixed poll interval while `task` is
/// in-flight, forwarding every event to `sink`, then drains whatever is
/// left once `task` resolves (§4.9 "Event fan-out").
async fn drain_while<F, T>(receiver: &mut EventReceiver, task: F, sink: &mut Vec<Event>) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::pin!(task);
    loop {
        tokio::select! {
            biased;
            result = &mut task => {
                sink.extend(receiver.drain());
                return result;
            }
            event = receiver.recv_timeout(EVENT_POLL_INTERVAL) => {
                if let Some(event) = event {
                    sink.push(event);
                }
            }
        }
    }
}

/// The outcome of a completed request: its final text, the events
/// observed over its lifetime, and its full usage breakdown.
pub struct Outcome {
    pub response: String,
    pub events: Vec<Event>,
    pub usage_by_stage: HashMap<String, Usage>,
    pub usage_total: Usage,
}

/// Run one request to completion (§4.9 state machine). Cancellation is
/// expressed by dropping the returned future; no events are emitted and
/// nothing is persisted past whatever already completed.
pub async fn run(
    registry: &BackendRegistry,
    council: &Council,
    config: &crate::config::GlobalConfig,
    store: &Arc<dyn ConversationStore>,
    leaderboard: &Leaderboard,
    request: Request,
) -> Result<Outcome, DeliberationError> {
    let (tx, mut rx) = crate::event::channel();
    let mut events = Vec::new();
    let mut usage = UsageAggregator::new();

    let mode_name = match request.mode {
        ExecutionMode::Chat => "chat",
        ExecutionMode::Ranked => "ranked",
        ExecutionMode::Full => "full",
    };
    events.push(Event::ExecutionMode { mode: mode_name.to_string() });

    store.append_user(&request.conversation_id, &request.question).await;
    let conversation = store.get(&request.conversation_id).await.unwrap_or_default();
    let history: Vec<Exchange> = conversation.recent_exchanges(6);

    let chairman = registry
        .get(&config.chairman)
        .ok_or_else(|| DeliberationError::PanelInfeasible("chairman backend not registered".into()))?;

    if request.force_direct {
        let (response, call_usage) =
            stage3::run_direct(&chairman, &request.question, &history, config.deliberation.temperatures.stage3, tx.clone()).await;
        usage.record("direct", &call_usage);
        events.extend(rx.drain());
        return finish(store, &request.conversation_id, response, Vec::new(), Vec::new(), Default::default(), Default::default(), &crate::council::Panel::default(), usage, events).await;
    }

    events.push(Event::ClassificationStart);
    let title_backend = registry
        .get(&config.title_model)
        .ok_or_else(|| DeliberationError::PanelInfeasible("title/classifier backend not registered".into()))?;
    let history_messages: Vec<crate::backend::Message> = history
        .iter()
        .flat_map(|exchange| {
            [crate::backend::Message::user(exchange.user_text.clone()), crate::backend::Message::assistant(exchange.assistant_response.clone())]
        })
        .collect();
    let classification = classifier::classify(&title_backend, &request.question, &history_messages).await;
    events.push(Event::ClassificationComplete {
        message_type: format!("{:?}", classification.message_type).to_lowercase(),
        reasoning: classification.reasoning.clone(),
    });

    if matches!(classification.message_type, MessageType::Factual | MessageType::Chat) {
        let (response, call_usage) =
            stage3::run_direct(&chairman, &request.question, &history, config.deliberation.temperatures.stage3, tx.clone()).await;
        usage.record("direct", &call_usage);
        events.extend(rx.drain());
        return finish(store, &request.conversation_id, response, Vec::new(), Vec::new(), Default::default(), Default::default(), &crate::council::Panel::default(), usage, events).await;
    }

    events.push(Event::RoutingStart);
    let panel = router::route(&title_backend, &request.question, council).await;
    if panel.len() < council.routing.min {
        return Err(DeliberationError::PanelInfeasible(format!(
            "router could not assemble {} advisors",
            council.routing.min
        )));
    }
    events.push(Event::RoutingComplete { panel_size: panel.len() });
    events.push(Event::PanelConfirmed {
        members: panel
            .members
            .iter()
            .map(|m| crate::event::PanelMemberView {
                advisor_id: m.advisor_id.clone(),
                backend_id: m.backend_id.clone(),
                reasoning: m.reasoning.clone(),
            })
            .collect(),
    });

    let stage1_outputs = drain_while(
        &mut rx,
        stage1::run(
            registry,
            council,
            &panel,
            &request.question,
            &history,
            config.deliberation.temperatures.stage1,
            &config.response_config.response_style,
            tx.clone(),
        ),
        &mut events,
    )
    .await;

    if stage1_outputs.is_empty() {
        return Err(DeliberationError::NoStage1Survivors);
    }

    for output in &stage1_outputs {
        usage.record("stage1", &output.usage);
    }
    events.push(usage_event("stage1", &usage));

    if request.mode == ExecutionMode::Chat {
        let response = stage1_outputs[0].text.clone();
        events.extend(rx.drain());
        return finish(store, &request.conversation_id, response, stage1_outputs, Vec::new(), Default::default(), HashMap::new(), &panel, usage, events).await;
    }

    let stage2_result = drain_while(
        &mut rx,
        stage2::run(
            registry,
            council,
            &panel,
            &request.question,
            &stage1_outputs,
            config.deliberation.temperatures.stage2,
            tx.clone(),
        ),
        &mut events,
    )
    .await;

    for output in &stage2_result.outputs {
        usage.record("stage2", &output.usage);
    }
    events.push(usage_event("stage2", &usage));

    let participants: Vec<ParticipantResult> = stage2_result
        .analysis
        .backend_scores
        .iter()
        .map(|(backend_id, score)| ParticipantResult {
            backend_id: backend_id.clone(),
            score: *score,
            criterion_scores: stage2_result.analysis.backend_criterion_scores.get(backend_id).cloned().unwrap_or_default(),
        })
        .collect();
    leaderboard.record_result(&council.id, &participants, stage2_result.analysis.winner.as_deref().and_then(|w| stage2_result.label_to_backend.get(w)).map(|s| s.as_str())).await;

    if request.mode == ExecutionMode::Ranked {
        let response = stage2_result
            .analysis
            .winner
            .as_ref()
            .and_then(|winner| stage2_result.label_to_backend.get(winner))
            .and_then(|backend_id| stage1_outputs.iter().find(|o| &o.backend_id == backend_id))
            .map(|o| o.text.clone())
            .unwrap_or_default();
        events.extend(rx.drain());
        return finish(
            store,
            &request.conversation_id,
            response,
            stage1_outputs,
            stage2_result.outputs,
            stage2_result.analysis,
            stage2_result.label_to_backend,
            &panel,
            usage,
            events,
        )
        .await;
    }

    let (response, stage3_usage) = drain_while(
        &mut rx,
        stage3::run(
            &chairman,
            &request.question,
            &history,
            &stage2_result.analysis,
            &stage1_outputs,
            &stage2_result.outputs,
            &stage2_result.label_to_backend,
            config.deliberation.temperatures.stage3,
            tx.clone(),
        ),
        &mut events,
    )
    .await;
    usage.record("stage3", &stage3_usage);
    events.push(usage_event("stage3", &usage));
    events.extend(rx.drain());

    finish(
        store,
        &request.conversation_id,
        response,
        stage1_outputs,
        stage2_result.outputs,
        stage2_result.analysis,
        stage2_result.label_to_backend,
        &panel,
        usage,
        events,
    )
    .await
}

fn usage_event(stage: &str, usage: &UsageAggregator) -> Event {
    let stage_usage = usage.stage(stage).map(|s| s.usage.clone()).unwrap_or_default();
    Event::UsageUpdate(crate::event::UsageSnapshot {
        stage: stage.to_string(),
        usage: stage_usage,
        running_total: usage.total().clone(),
    })
}

async fn finish(
    store: &Arc<dyn ConversationStore>,
    conversation_id: &str,
    response: String,
    stage1_outputs: Vec<stage1::Stage1Output>,
    stage2_outputs: Vec<stage2::Stage2Output>,
    analysis: crate::aggregator::AnalysisBundle,
    _label_to_backend: HashMap<String, String>,
    panel: &crate::council::Panel,
    usage: UsageAggregator,
    mut events: Vec<Event>,
) -> Result<Outcome, DeliberationError> {
    let usage_by_stage: HashMap<String, Usage> =
        usage.by_stage().iter().map(|(k, v)| (k.clone(), v.usage.clone())).collect();
    let usage_total = usage.total().clone();

    let record = AssistantRecord {
        stage1: stage1_outputs,
        stage2: stage2_outputs,
        stage3_response: response.clone(),
        analysis,
        panel: panel.clone(),
        usage_by_stage: usage_by_stage.clone(),
        usage_total: usage_total.clone(),
    };
    store.append_assistant(conversation_id, record).await;

    events.push(Event::Done { usage_by_stage: usage_by_stage.clone(), usage_total: usage_total.clone() });

    Ok(Outcome { response, events, usage_by_stage, usage_total })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, CompletionResult, EventStream, Message, StreamEvent};
    use crate::config::GlobalConfig;
    use crate::conversation::InMemoryConversationStore;
    use crate::council::{Advisor, RoutingPolicy, RubricCriterion};
    use async_trait::async_trait;
    use futures_util::stream;
    use std::time::Duration;

    struct ScriptedBackend {
        id: String,
        complete_reply: String,
        stream_reply: &'static str,
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
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
            Ok(CompletionResult { content: self.complete_reply.clone(), ..Default::default() })
        }

        async fn stream(
            &self,
            _messages: &[Message],
            _temperature: Option<f32>,
            _max_tokens: Option<u32>,
        ) -> Result<EventStream, BackendError> {
            Ok(Box::pin(stream::iter(vec![
                StreamEvent::Content { delta: self.stream_reply.to_string(), cumulative: self.stream_reply.to_string() },
                StreamEvent::Complete {
                    content: self.stream_reply.to_string(),
                    reasoning_content: String::new(),
                    usage: Usage { prompt_tokens: 5, completion_tokens: 5, total_tokens: 10, cost: 0.0 },
                },
            ])))
        }
    }

    fn sample_council() -> Council {
        Council {
            id: "test".into(),
            name: "Test".into(),
            personas: vec![
                Advisor { id: "a".into(), name: "A".into(), role: "generalist".into(), instruction_prompt: "Be helpful.".into(), tags: vec![] },
                Advisor { id: "b".into(), name: "B".into(), role: "skeptic".into(), instruction_prompt: "Be critical.".into(), tags: vec![] },
            ],
            rubric: vec![RubricCriterion { name: "accuracy".into(), weight: 1.0, description: "".into() }],
            routing: RoutingPolicy { min: 1, max: 2, default: 2 },
            available_backends: vec!["m1".into(), "m2".into()],
        }
    }

    fn sample_config() -> crate::config::GlobalConfig {
        let mut config = GlobalConfig::default();
        config.chairman = "chairman".into();
        config.title_model = "title".into();
        config
    }

    #[tokio::test]
    async fn force_direct_skips_classification_and_routing() {
        let registry = BackendRegistry::new(vec![
            Arc::new(ScriptedBackend { id: "chairman".into(), complete_reply: "".into(), stream_reply: "direct answer" }),
            Arc::new(ScriptedBackend { id: "title".into(), complete_reply: r#"{"type":"deliberation"}"#.into(), stream_reply: "" }),
            Arc::new(ScriptedBackend { id: "m1".into(), complete_reply: "".into(), stream_reply: "p1" }),
            Arc::new(ScriptedBackend { id: "m2".into(), complete_reply: "".into(), stream_reply: "p2" }),
        ]);
        let store: Arc<dyn ConversationStore> = InMemoryConversationStore::shared();
        let leaderboard = Leaderboard::new();
        let council = sample_council();
        let config = sample_config();

        let request = Request {
            conversation_id: "c1".into(),
            question: "hi".into(),
            mode: ExecutionMode::Full,
            force_direct: true,
        };

        let outcome = run(&registry, &council, &config, &store, &leaderboard, request).await.unwrap();
        assert_eq!(outcome.response, "direct answer");
        assert!(outcome.events.iter().any(|e| matches!(e, Event::DirectStart)));
        assert!(!outcome.events.iter().any(|e| matches!(e, Event::RoutingStart)));
    }

    #[tokio::test]
    async fn chat_mode_stops_after_stage1() {
        let registry = BackendRegistry::new(vec![
            Arc::new(ScriptedBackend { id: "chairman".into(), complete_reply: "".into(), stream_reply: "unused" }),
            Arc::new(ScriptedBackend { id: "title".into(), complete_reply: r#"{"selections":[{"advisor_id":"a","backend_id":"m1","reasoning":"x"},{"advisor_id":"b","backend_id":"m2","reasoning":"x"}]}"#.into(), stream_reply: "" }),
            Arc::new(ScriptedBackend { id: "m1".into(), complete_reply: "".into(), stream_reply: "panelist one" }),
            Arc::new(ScriptedBackend { id: "m2".into(), complete_reply: "".into(), stream_reply: "panelist two" }),
        ]);
        let store: Arc<dyn ConversationStore> = InMemoryConversationStore::shared();
        let leaderboard = Leaderboard::new();
        let council = sample_council();
        let config = sample_config();

        let request = Request {
            conversation_id: "c1".into(),
            question: "brand new deliberation question here".into(),
            mode: ExecutionMode::Chat,
            force_direct: false,
        };

        let outcome = run(&registry, &council, &config, &store, &leaderboard, request).await.unwrap();
        assert_eq!(outcome.response, "panelist one");
        assert!(outcome.events.iter().any(|e| matches!(e, Event::Stage1Complete { .. })));
        assert!(!outcome.events.iter().any(|e| matches!(e, Event::Stage2Init { .. })));
    }

    #[tokio::test]
    async fn panel_infeasible_when_chairman_backend_missing() {
        let registry = BackendRegistry::new(vec![]);
        let store: Arc<dyn ConversationStore> = InMemoryConversationStore::shared();
        let leaderboard = Leaderboard::new();
        let council = sample_council();
        let config = sample_config();

        let request = Request {
            conversation_id: "c1".into(),
            question: "hi".into(),
            mode: ExecutionMode::Full,
            force_direct: true,
        };

        let result = run(&registry, &council, &config, &store, &leaderboard, request).await;
        assert!(matches!(result, Err(DeliberationError::PanelInfeasible(_))));
    }
}
