//! Stage-3: chairman synthesis and the direct-answer branch (§4.8).
//!
//! Grounded in `original_source/backend/council/stage3.py`
//! (`synthesize_responses`) and `routing.py::chairman_direct_response` for
//! the direct-answer branch's distinct fallback string.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;

use crate::aggregator::{AnalysisBundle, Conflict, MinorityOpinion};
use crate::backend::{Backend, Message, StreamEvent, Usage};
use crate::conversation::Exchange;
use crate::event::{Event, EventSender, TokenRate};
use crate::stage1::Stage1Output;
use crate::stage2::Stage2Output;
use crate::text::strip_fake_images;
use crate::token_accountant::TokenTracker;

/// Literal fallback returned when synthesis streams no content at all,
/// ported verbatim from the reference implementation.
pub const SYNTHESIS_FALLBACK: &str = "Error: Unable to generate synthesis.";

/// Literal fallback for the direct-answer branch, distinct from
/// [`SYNTHESIS_FALLBACK`] and ported verbatim.
pub const DIRECT_ANSWER_FALLBACK: &str = "I apologize, I was unable to generate a response.";

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

fn format_analysis_summary(analysis: &AnalysisBundle) -> String {
    let mut summary = String::from("Weighted rankings:\n");
    for (label, score) in &analysis.scores {
        summary.push_str(&format!("- {}: {:.1}\n", label, score));
    }

    if !analysis.conflicts.is_empty() {
        summary.push_str("\nConflicts:\n");
        for conflict in &analysis.conflicts {
            match conflict {
                Conflict::RankingSpread { label, min_pos, max_pos, severity } => {
                    summary.push_str(&format!(
                        "- {} spread {}-{} ({:?})\n",
                        label, min_pos, max_pos, severity
                    ));
                }
                Conflict::MutualOpposition { evaluator_a, evaluator_b, severity, .. } => {
                    summary.push_str(&format!(
                        "- mutual opposition between {} and {} ({:?})\n",
                        evaluator_a, evaluator_b, severity
                    ));
                }
            }
        }
    }

    if !analysis.minority_opinions.is_empty() {
        summary.push_str("\nMinority opinions:\n");
        for opinion in &analysis.minority_opinions {
            summary.push_str(&format_minority_opinion(opinion));
        }
    }

    summary
}

fn format_minority_opinion(opinion: &MinorityOpinion) -> String {
    format!(
        "- {}: average position {:.2}, dissenters_high={:?}, dissenters_low={:?}\n",
        opinion.label, opinion.average_position, opinion.dissenters_high, opinion.dissenters_low
    )
}

/// Find the top-voted response's text, by `label_to_member` (here,
/// `stage1_outputs` indexed by the winning label's position) and falling
/// back to a backend-id match against `label_to_backend` (§4.8).
fn find_top_response<'a>(
    winner: &str,
    stage1_outputs: &'a [Stage1Output],
    label_to_backend: &std::collections::HashMap<String, String>,
) -> Option<&'a Stage1Output> {
    let letter = winner.chars().last()?;
    let index = (letter as u8).checked_sub(b'A')? as usize;
    if let Some(output) = stage1_outputs.get(index) {
        return Some(output);
    }
    let backend_id = label_to_backend.get(winner)?;
    stage1_outputs.iter().find(|o| &o.backend_id == backend_id)
}

fn build_synthesis_prompt(
    q: &str,
    history: &[Exchange],
    analysis: &AnalysisBundle,
    top_response: Option<&Stage1Output>,
    stage1_outputs: &[Stage1Output],
    stage2_outputs: &[Stage2Output],
) -> Vec<Message> {
    let mut context = String::new();
    for exchange in history.iter().rev().take(6).collect::<Vec<_>>().into_iter().rev() {
        context.push_str(&format!(
            "User: {}\nAssistant: {}\n",
            truncate(&exchange.user_text, 500),
            truncate(&exchange.assistant_response, 500)
        ));
    }

    context.push_str(&format!("\nQuestion: {}\n\n", q));
    context.push_str(&format_analysis_summary(analysis));

    if let Some(top) = top_response {
        context.push_str(&format!("\nTop-voted response ({}):\n{}\n", top.advisor_id, top.text));
    }

    context.push_str("\nAll panelist responses:\n");
    for output in stage1_outputs {
        context.push_str(&format!("[{}] {}\n", output.role_name, output.text));
    }

    context.push_str("\nAll evaluator rankings:\n");
    for output in stage2_outputs {
        context.push_str(&format!("[{}] {}\n", output.role_name, output.raw_text));
    }

    vec![
        Message::system(
            "You are the chairman synthesizing a panel's deliberation. Start from the top-voted \
             response; fold in unique merits from the others; address valid minority opinions; \
             note significant conflicts; do not include images.",
        ),
        Message::user(context),
    ]
}

async fn stream_to_completion(
    backend: &Arc<dyn Backend>,
    messages: &[Message],
    temperature: f32,
    events: &EventSender,
    fallback: &str,
) -> (String, Usage) {
    let tracker_key = "stage3";
    let mut tracker = TokenTracker::new();
    let started = Instant::now();

    let stream_result = backend.stream(messages, Some(temperature), None).await;
    let mut stream = match stream_result {
        Ok(stream) => stream,
        Err(e) => {
            let _ = events.send(Event::Stage3Error { error: e.to_string() }).await;
            return (fallback.to_string(), Usage::default());
        }
    };

    let mut content = String::new();
    let mut usage = Usage::default();

    while let Some(chunk) = stream.next().await {
        match chunk {
            StreamEvent::Thinking { delta, cumulative } => {
                let tps = tracker.record_thinking(tracker_key, &delta);
                let _ = events
                    .send(Event::Stage3Thinking {
                        delta,
                        content: cumulative,
                        rate: TokenRate { tokens_per_second: tps, elapsed_seconds: started.elapsed().as_secs_f64() },
                    })
                    .await;
            }
            StreamEvent::Content { delta, cumulative } => {
                content = cumulative.clone();
                let tps = tracker.record_token(tracker_key, &delta);
                let _ = events
                    .send(Event::Stage3Token {
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
            StreamEvent::Error(e) => {
                let _ = events.send(Event::Stage3Error { error: e.to_string() }).await;
                break;
            }
        }
    }

    if content.trim().is_empty() {
        content = fallback.to_string();
    }
    (strip_fake_images(&content), usage)
}

/// Run Stage-3 synthesis (§4.8). Returns the finalized response text and
/// its usage.
pub async fn run(
    chairman: &Arc<dyn Backend>,
    q: &str,
    history: &[Exchange],
    analysis: &AnalysisBundle,
    stage1_outputs: &[Stage1Output],
    stage2_outputs: &[Stage2Output],
    label_to_backend: &std::collections::HashMap<String, String>,
    temperature: f32,
    events: EventSender,
) -> (String, Usage) {
    let _ = events.send(Event::Stage3Start).await;

    let top_response = analysis
        .winner
        .as_ref()
        .and_then(|winner| find_top_response(winner, stage1_outputs, label_to_backend));

    let messages = build_synthesis_prompt(q, history, analysis, top_response, stage1_outputs, stage2_outputs);
    let (content, usage) = stream_to_completion(chairman, &messages, temperature, &events, SYNTHESIS_FALLBACK).await;

    let _ = events.send(Event::Stage3Complete { content: content.clone() }).await;
    (content, usage)
}

/// Run the direct-answer branch: a single chairman call with no panel
/// context, used when the Classifier produces `factual`/`chat` or the
/// driver is invoked with `force_direct` (§4.8 "Direct-answer branch").
pub async fn run_direct(
    chairman: &Arc<dyn Backend>,
    q: &str,
    history: &[Exchange],
    temperature: f32,
    events: EventSender,
) -> (String, Usage) {
    let _ = events.send(Event::DirectStart).await;

    let mut context = String::new();
    for exchange in history.iter().rev().take(6).collect::<Vec<_>>().into_iter().rev() {
        context.push_str(&format!(
            "User: {}\nAssistant: {}\n",
            truncate(&exchange.user_text, 500),
            truncate(&exchange.assistant_response, 500)
        ));
    }
    context.push_str(&format!("\n{}", q));

    let messages = vec![Message::system("Answer directly and concisely."), Message::user(context)];
    stream_to_completion(chairman, &messages, temperature, &events, DIRECT_ANSWER_FALLBACK).await
}
