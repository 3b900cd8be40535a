//! The Classifier (Stage 0a, §4.2): labels an incoming message as
//! `factual`, `chat`, `deliberation`, or `followup` before the Router runs.
//!
//! The heuristic fast path and its phrase list are ported verbatim from
//! `original_source/backend/council/routing.py::_is_followup_heuristic`.
//! The LLM fallback mirrors `routing.py::classify_message`.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::backend::{Backend, Message};

/// The classifier's output label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Factual,
    Chat,
    Deliberation,
    Followup,
}

impl MessageType {
    fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "factual" => Some(MessageType::Factual),
            "chat" => Some(MessageType::Chat),
            "deliberation" => Some(MessageType::Deliberation),
            "followup" => Some(MessageType::Followup),
            _ => None,
        }
    }
}

/// The classifier's decision plus a brief human-readable reason.
#[derive(Debug, Clone)]
pub struct Classification {
    pub message_type: MessageType,
    pub reasoning: String,
}

/// Closed set of phrases that, found anywhere in a lowercased message with
/// non-empty history, mark it as a follow-up without an LLM call.
const BACK_REFERENCE_PHRASES: &[&str] = &[
    "follow up",
    "followup",
    "follow-up",
    "as i said",
    "as i mentioned",
    "as we discussed",
    "what you said",
    "what you mentioned",
    "you said",
    "you mentioned",
    "you suggested",
    "you recommended",
    "all of this",
    "all of that",
    "incorporate the above",
    "based on this",
    "based on that",
    "based on what",
    "can you summarize",
    "can you consolidate",
    "going back to",
    "regarding what",
    "about what you",
    "the above",
    "from above",
    "mentioned earlier",
    "earlier you",
    "previously you",
    "you just said",
    "expand on",
    "elaborate on",
    "more about",
    "what about",
    "how about",
    "and what about",
    "can you also",
    "one more thing",
    "thanks, now",
    "ok, now",
    "great, now",
    "ok now",
    "ok so",
    "ok can you",
    "also,",
    "also can you",
];

const CONTEXT_PRONOUNS: &[&str] = &["that", "this", "it", "them", "those", "these"];

const DEFINITIONAL_OPENERS: &[&str] = &["what is a", "what is an", "define ", "who is "];

fn tokenize(q: &str) -> Vec<&str> {
    q.split_whitespace().collect()
}

/// The heuristic fast path: `Some(Followup)` if it fires, `None` if the LLM
/// fallback should run instead.
fn heuristic_classify(q: &str, has_history: bool) -> Option<Classification> {
    if !has_history {
        return None;
    }
    let lowered = q.trim().to_lowercase();

    if BACK_REFERENCE_PHRASES.iter().any(|phrase| lowered.contains(phrase)) {
        return Some(Classification {
            message_type: MessageType::Followup,
            reasoning: "matched a back-reference phrase".into(),
        });
    }

    if tokenize(&lowered).len() <= 15
        && CONTEXT_PRONOUNS.iter().any(|pronoun| {
            lowered.split_whitespace().any(|word| word.trim_matches(|c: char| !c.is_alphanumeric()) == *pronoun)
        })
        && !DEFINITIONAL_OPENERS.iter().any(|opener| lowered.contains(opener))
    {
        return Some(Classification {
            message_type: MessageType::Followup,
            reasoning: "short message with a bare context pronoun".into(),
        });
    }

    None
}

#[derive(Debug, Deserialize)]
struct ClassifyReply {
    #[serde(rename = "type")]
    message_type: String,
    #[serde(default)]
    reasoning: String,
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

fn build_prompt(q: &str, history: &[Message]) -> Vec<Message> {
    let recent: Vec<&Message> = history.iter().rev().take(4).collect();
    let mut transcript = String::new();
    for message in recent.into_iter().rev() {
        transcript.push_str(&format!("{:?}: {}\n", message.role, truncate(&message.content, 200)));
    }
    vec![
        Message::system(
            "Classify the user's message as exactly one of: factual, chat, deliberation, followup. \
             Respond with strict JSON: {\"type\": <label>, \"reasoning\": <one sentence>}.",
        ),
        Message::user(format!("Recent history:\n{}\n\nMessage: {}", transcript, q)),
    ]
}

/// Classify `q` given optional prior `history`, using `backend` for the LLM
/// fallback path. Never fails outwardly: any backend or parse error
/// degrades to `deliberation` (§4.2 "Failure semantics").
pub async fn classify(backend: &Arc<dyn Backend>, q: &str, history: &[Message]) -> Classification {
    if let Some(result) = heuristic_classify(q, !history.is_empty()) {
        return result;
    }

    let messages = build_prompt(q, history);
    let result = backend.complete(&messages, Some(0.0), Some(200), Some(Duration::from_secs(30))).await;

    match result {
        Ok(completion) => {
            let parsed: Result<ClassifyReply, _> = serde_json::from_str(completion.content.trim());
            match parsed {
                Ok(reply) if !reply.message_type.trim().is_empty() => {
                    match MessageType::from_str(&reply.message_type) {
                        Some(message_type) => Classification { message_type, reasoning: reply.reasoning },
                        None => deliberation_default(),
                    }
                }
                _ => deliberation_default(),
            }
        }
        Err(_) => deliberation_default(),
    }
}

fn deliberation_default() -> Classification {
    Classification { message_type: MessageType::Deliberation, reasoning: "default classification".into() }
}
