//! Stage-2: parallel peer ranking of the anonymized Stage-1 outputs (§4.5).
//!
//! Grounded in `original_source/backend/council/stage2.py`. Labels are
//! assigned positionally (`A, B, C, ...`); evaluators rank the labelled set
//! under the council's rubric and the Ranking parser (§4.6) turns their
//! free text back into structured scores for the Aggregator (§4.7).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use tokio::sync::Mutex;

use crate::aggregator::{self, AnalysisBundle, Evaluation};
use crate::backend::{Backend, BackendRegistry, Message, StreamEvent, Usage};
use crate::council::{Council, Panel, RubricCriterion};
use crate::event::{Event, EventSender, TokenRate};
use crate::ranking::{self, Label};
use crate::stage1::Stage1Output;
use crate::token_accountant::TokenTracker;

/// One evaluator's finished Stage-2 output.
#[derive(Debug, Clone)]
pub struct Stage2Output {
    pub backend_id: String,
    pub advisor_id: String,
    pub role_name: String,
    pub raw_text: String,
    pub parsed: ranking::ParsedRanking,
    pub usage: Usage,
}

fn assign_labels(outputs: &[Stage1Output]) -> (HashMap<Label, String>, HashMap<Label, String>) {
    let mut label_to_backend = HashMap::new();
    let mut label_to_advisor = HashMap::new();
    for (i, output) in outputs.iter().enumerate() {
        let label = format!("Response {}", (b'A' + i as u8) as char);
        label_to_backend.insert(label.clone(), output.backend_id.clone());
        label_to_advisor.insert(label, output.advisor_id.clone());
    }
    (label_to_backend, label_to_advisor)
}

fn build_evaluation_prompt(
    q: &str,
    outputs: &[Stage1Output],
    rubric: &[RubricCriterion],
) -> Vec<Message> {
    let mut body = String::new();
    for (i, output) in outputs.iter().enumerate() {
        let label = (b'A' + i as u8) as char;
        body.push_str(&format!("Response {}:\n{}\n\n", label, output.text));
    }

    let mut instructions = String::from(
        "Rate each response on a 1-5 scale with one sentence of feedback each.\n",
    );
    if !rubric.is_empty() {
        instructions.push_str("Additionally score each response on each of these criteria, 1-10:\n");
        for criterion in rubric {
            instructions.push_str(&format!("- {}: {}\n", criterion.name, criterion.description));
        }
    }
    instructions.push_str(
        "Finish with a line reading exactly \"FINAL RANKING:\" followed by a numbered list of \
         the responses from best to worst, e.g. \"1. Response B\".",
    );

    vec![
        Message::system(instructions),
        Message::user(format!("Question: {}\n\n{}", q, body)),
    ]
}

async fn run_evaluator(
    backend: Arc<dyn Backend>,
    advisor_id: String,
    role_name: String,
    messages: Vec<Message>,
    temperature: f32,
    rubric_names: Vec<String>,
    events: EventSender,
    tracker: Arc<Mutex<TokenTracker>>,
) -> Option<Stage2Output> {
    let backend_id = backend.id().to_string();
    let key = format!("s2-{}", advisor_id);

    let stream_result = backend.stream(&messages, Some(temperature), None).await;
    let mut stream = match stream_result {
        Ok(stream) => stream,
        Err(_) => return None,
    };

    let mut content = String::new();
    let mut usage = Usage::default();
    let started = Instant::now();

    while let Some(chunk) = stream.next().await {
        match chunk {
            StreamEvent::Thinking { delta, cumulative } => {
                let tps = tracker.lock().await.record_thinking(&key, &delta);
                let _ = events
                    .send(Event::Stage2Thinking {
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
                    .send(Event::Stage2Token {
                        backend: backend_id.clone(),
                        member_id: advisor_id.clone(),
                        role: role_name.clone(),
                        delta,
                        content: cumulative,
                        rate: TokenRate { tokens_per_second: tps, elapsed_seconds: started.elapsed().as_secs_f64() },
                    })
                    .await;
            }
            StreamEvent::Complete { content: final_content, usage: final_usage, .. } => {
                content = final_content;
                usage = final_usage;
            }
            StreamEvent::Error(_) => return None,
        }
    }

    if content.trim().is_empty() {
        return None;
    }

    let parsed = ranking::parse(&content, &rubric_names);

    let _ = events
        .send(Event::Stage2ModelComplete {
            backend: backend_id.clone(),
            member_id: advisor_id.clone(),
            role: role_name.clone(),
            content: content.clone(),
        })
        .await;

    Some(Stage2Output { backend_id, advisor_id, role_name, raw_text: content, parsed, usage })
}

/// Result of a full Stage-2 round: every evaluator's output plus the
/// aggregated analysis bundle.
pub struct Stage2Result {
    pub outputs: Vec<Stage2Output>,
    pub label_to_backend: HashMap<Label, String>,
    pub analysis: AnalysisBundle,
}

/// Run Stage-2: assign labels, fan out the evaluation prompt to every
/// panel member, and aggregate the results (§4.5). Runs a single round
/// regardless of the council's configured `max_rounds` (§9 open question,
/// resolved); `round_start`/`round_complete` are still emitted around it.
pub async fn run(
    registry: &BackendRegistry,
    council: &Council,
    panel: &Panel,
    q: &str,
    stage1_outputs: &[Stage1Output],
    temperature: f32,
    events: EventSender,
) -> Stage2Result {
    let (label_to_backend, _label_to_advisor) = assign_labels(stage1_outputs);
    let rubric_names: Vec<String> = council.rubric.iter().map(|c| c.name.clone()).collect();
    let messages = build_evaluation_prompt(q, stage1_outputs, &council.rubric);

    let _ = events.send(Event::Stage2Init { total: panel.len() }).await;
    let _ = events.send(Event::RoundStart { round: 1 }).await;

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
        let advisor_id = advisor.id.clone();
        let role_name = advisor.role.clone();
        let messages = messages.clone();
        let events = events.clone();
        let tracker = tracker.clone();
        let rubric_names = rubric_names.clone();
        handles.push(tokio::spawn(async move {
            run_evaluator(backend, advisor_id, role_name, messages, temperature, rubric_names, events, tracker).await
        }));
    }

    let mut evaluations = Vec::new();
    let mut outputs = Vec::new();
    for handle in handles {
        if let Ok(Some(output)) = handle.await {
            evaluations.push(Evaluation {
                evaluator_id: output.advisor_id.clone(),
                backend_id: output.backend_id.clone(),
                ranking: output.parsed.clone(),
            });
            outputs.push(output);
        }
    }

    let _ = events.send(Event::RoundComplete { round: 1 }).await;
    let _ = events.send(Event::Stage2Complete).await;

    let analysis = aggregator::aggregate(&evaluations, &label_to_backend);
    let _ = events
        .send(Event::Analysis {
            winner: analysis.winner.clone(),
            conflicts: analysis.conflicts.len(),
            minority_opinions: analysis.minority_opinions.len(),
        })
        .await;

    Stage2Result { outputs, label_to_backend, analysis }
}
