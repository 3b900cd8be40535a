//! Stage-1: parallel panelist generation (§4.4).
//!
//! Grounded in `original_source/backend/council/stage1.py` and the
//! teacher's `council.rs::execute_parallel` fan-out/join shape, generalized
//! from a fixed-mode council execution to a single deliberation stage that
//! reports progress through the bounded [`crate::event`] queue instead of
//! an `EventHandler` callback.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::sync::Mutex;

use crate::backend::{Backend, BackendRegistry, Message, StreamEvent, Usage};
use crate::conversation::Exchange;
use crate::council::{Council, Panel};
use crate::event::{Event, EventSender, TokenRate};
use crate::text::strip_fake_images;
use crate::token_accountant::TokenTracker;

/// One panelist's finished Stage-1 response (§3 "Stage-1 output").
#[derive(Debug, Clone)]
pub struct Stage1Output {
    pub backend_id: String,
    pub advisor_id: String,
    pub role_name: String,
    pub text: String,
    pub usage: Usage,
}

fn response_style_prefix(response_style: &str) -> Option<&'static str> {
    if response_style == "concise" {
        Some("Answer concisely, in at most a few sentences.\n\n")
    } else {
        None
    }
}

fn history_projection(history: &[Exchange]) -> Vec<Message> {
    let mut messages = Vec::new();
    for exchange in history.iter().rev().take(3).collect::<Vec<_>>().into_iter().rev() {
        messages.push(Message::user(exchange.user_text.clone()));
        messages.push(Message::assistant(exchange.assistant_response.clone()));
    }
    messages
}

fn build_messages(
    q: &str,
    persona_prompt: &str,
    history: &[Exchange],
    response_style: &str,
) -> Vec<Message> {
    let mut messages = vec![Message::system(persona_prompt.to_string())];
    messages.extend(history_projection(history));
    let user_text = match response_style_prefix(response_style) {
        Some(prefix) => format!("{}{}", prefix, q),
        None => q.to_string(),
    };
    messages.push(Message::user(user_text));
    messages
}

async fn run_member(
    backend: Arc<dyn Backend>,
    advisor_id: String,
    role_name: String,
    messages: Vec<Message>,
    temperature: f32,
    events: EventSender,
    tracker: Arc<Mutex<TokenTracker>>,
) -> Option<Stage1Output> {
    let backend_id = backend.id().to_string();
    let key = advisor_id.clone();

    let stream_result = backend.stream(&messages, Some(temperature), None).await;
    let mut stream = match stream_result {
        Ok(stream) => stream,
        Err(e) => {
            let _ = events
                .send(Event::Stage1ModelError {
                    backend: backend_id,
                    member_id: advisor_id,
                    role: role_name,
                    error: e.to_string(),
                })
                .await;
            return None;
        }
    };

    let mut content = String::new();
    let mut reasoning = String::new();
    let mut usage = Usage::default();
    let started = Instant::now();

    while let Some(chunk) = stream.next().await {
        match chunk {
            StreamEvent::Thinking { delta, cumulative } => {
                reasoning = cumulative.clone();
                let tps = tracker.lock().await.record_thinking(&key, &delta);
                let _ = events
                    .send(Event::Stage1Thinking {
                        backend: backend_id.clone(),
                        member_id: advisor_id.clone(),
                        role: role_name.clone(),
                        delta,
                        content: cumulative,
                        rate: TokenRate { tokens_per_second: tps, elapsed_seconds: started.elapsed().as_secs_f64() },
                    })
                    .await;
            }
            StreamEvent::Content { delta, cumulative } => {
                content = cumulative.clone();
                let tps = tracker.lock().await.record_token(&key, &delta);
                let _ = events
                    .send(Event::Stage1Token {
                        backend: backend_id.clone(),
                        member_id: advisor_id.clone(),
                        role: role_name.clone(),
                        delta,
                        content: cumulative,
                        rate: TokenRate { tokens_per_second: tps, elapsed_seconds: started.elapsed().as_secs_f64() },
                    })
                    .await;
            }
            StreamEvent::Complete { content: final_content, reasoning_content, usage: final_usage } => {
                content = final_content;
                reasoning = reasoning_content;
                usage = final_usage;
            }
            StreamEvent::Error(e) => {
                let _ = events
                    .send(Event::Stage1ModelError {
                        backend: backend_id,
                        member_id: advisor_id,
                        role: role_name,
                        error: e.to_string(),
                    })
                    .await;
                return None;
            }
        }
    }

    if content.trim().is_empty() && !reasoning.trim().is_empty() {
        content = reasoning;
    }
    let finalized = strip_fake_images(&content);

    let _ = events
        .send(Event::Stage1ModelComplete {
            backend: backend_id.clone(),
            member_id: advisor_id.clone(),
            role: role_name.clone(),
            content: finalized.clone(),
        })
        .await;

    Some(Stage1Output { backend_id, advisor_id, role_name, text: finalized, usage })
}

/// Run Stage-1 across every panel member concurrently, returning
/// successful outputs in panel order. An errored member contributes
/// nothing; `None` overall only happens if the panel itself is empty
/// (the driver maps that to `NoStage1Survivors`) (§4.4 "Failure semantics").
pub async fn run(
    registry: &BackendRegistry,
    council: &Council,
    panel: &Panel,
    q: &str,
    history: &[Exchange],
    temperature: f32,
    response_style: &str,
    events: EventSender,
) -> Vec<Stage1Output> {
    let _ = events.send(Event::Stage1Init { total: panel.len() }).await;

    let tracker = Arc::new(Mutex::new(TokenTracker::new()));
    let mut handles = Vec::with_capacity(panel.len());

    for member in &panel.members {
        let advisor = match council.advisor(&member.advisor_id) {
            Some(a) => a,
            None => continue,
        };
        let backend = match registry.get(&member.backend_id) {
            Some(b) => b,
            None => continue,
        };
        let messages = build_messages(q, &advisor.instruction_prompt, history, response_style);
        let advisor_id = advisor.id.clone();
        let role_name = advisor.role.clone();
        let events = events.clone();
        let tracker = tracker.clone();
        handles.push(tokio::spawn(async move {
            run_member(backend, advisor_id, role_name, messages, temperature, events, tracker).await
        }));
    }

    let mut outputs = Vec::new();
    for handle in handles {
        if let Ok(Some(output)) = handle.await {
            outputs.push(output);
        }
    }

    let _ = events.send(Event::Stage1Complete { survivors: outputs.len() }).await;
    outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, CompletionResult, EventStream};
    use crate::council::{Advisor, PanelMember, RoutingPolicy, RubricCriterion};
    use async_trait::async_trait;
    use futures_util::stream;

    struct StreamingBackend {
        id: String,
        chunks: Vec<&'static str>,
    }

    #[async_trait]
    impl Backend for StreamingBackend {
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
            unimplemented!()
        }

        async fn stream(
            &self,
            _messages: &[Message],
            _temperature: Option<f32>,
            _max_tokens: Option<u32>,
        ) -> Result<EventStream, BackendError> {
            let mut cumulative = String::new();
            let mut events = Vec::new();
            for chunk in &self.chunks {
                cumulative.push_str(chunk);
                events.push(StreamEvent::Content { delta: chunk.to_string(), cumulative: cumulative.clone() });
            }
            events.push(StreamEvent::Complete {
                content: cumulative,
                reasoning_content: String::new(),
                usage: Usage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15, cost: 0.0 },
            });
            Ok(Box::pin(stream::iter(events)))
        }
    }

    struct ErroringBackend {
        id: String,
    }

    #[async_trait]
    impl Backend for ErroringBackend {
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
            unimplemented!()
        }

        async fn stream(
            &self,
            _messages: &[Message],
            _temperature: Option<f32>,
            _max_tokens: Option<u32>,
        ) -> Result<EventStream, BackendError> {
            Ok(Box::pin(stream::iter(vec![StreamEvent::Error(BackendError::Transport("down".into()))])))
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

    #[tokio::test]
    async fn collects_outputs_from_every_surviving_member() {
        let council = sample_council();
        let registry = BackendRegistry::new(vec![
            Arc::new(StreamingBackend { id: "m1".into(), chunks: vec!["hello ", "world"] }),
            Arc::new(StreamingBackend { id: "m2".into(), chunks: vec!["hi"] }),
        ]);
        let panel = Panel {
            members: vec![
                PanelMember { advisor_id: "a".into(), backend_id: "m1".into(), reasoning: "x".into() },
                PanelMember { advisor_id: "b".into(), backend_id: "m2".into(), reasoning: "x".into() },
            ],
        };
        let (tx, mut rx) = crate::event::channel();
        let outputs = crate::stage1::run(&registry, &council, &panel, "q", &[], 0.5, "standard", tx).await;
        assert_eq!(outputs.len(), 2);
        assert!(outputs.iter().any(|o| o.text == "hello world"));
        let events = rx.drain();
        assert!(events.iter().any(|e| matches!(e, Event::Stage1Init { total: 2 })));
    }

    #[tokio::test]
    async fn errored_member_is_dropped_not_fatal() {
        let council = sample_council();
        let registry = BackendRegistry::new(vec![
            Arc::new(ErroringBackend { id: "m1".into() }),
            Arc::new(StreamingBackend { id: "m2".into(), chunks: vec!["ok"] }),
        ]);
        let panel = Panel {
            members: vec![
                PanelMember { advisor_id: "a".into(), backend_id: "m1".into(), reasoning: "x".into() },
                PanelMember { advisor_id: "b".into(), backend_id: "m2".into(), reasoning: "x".into() },
            ],
        };
        let (tx, _rx) = crate::event::channel();
        let outputs = crate::stage1::run(&registry, &council, &panel, "q", &[], 0.5, "standard", tx).await;
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].backend_id, "m2");
    }
}
