//! The `Backend` port: the sole abstraction over a text-completion model.
//!
//! Every stage in the pipeline depends on [`Backend`], never on a concrete
//! vendor transport. A transport implementation lives outside this crate
//! and only needs to satisfy this trait.
//!
//! # Streaming quick start
//!
//! ```rust,no_run
//! use deliberation_engine::backend::{Backend, Message, Role, StreamEvent};
//! use futures_util::StreamExt;
//!
//! # async fn go(backend: &dyn Backend) -> Result<(), Box<dyn std::error::Error>> {
//! let messages = [Message { role: Role::User, content: "Who are you?".into() }];
//! let mut stream = backend.stream(&messages, None, None).await?;
//! while let Some(chunk) = stream.next().await {
//!     match chunk {
//!         StreamEvent::Content { delta, .. } => print!("{}", delta),
//!         StreamEvent::Complete { .. } => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures_util::stream::Stream;
use serde::Serialize;
use std::pin::Pin;
use std::time::Duration;

use crate::error::BackendError;

/// The role associated with a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// A persona/system priming message.
    System,
    /// A human-authored turn.
    User,
    /// A model-authored turn (including prior deliberation syntheses).
    Assistant,
}

/// A single message in a request to a [`Backend`].
#[derive(Debug, Clone)]
pub struct Message {
    /// The role associated with the message.
    pub role: Role,
    /// The message body.
    pub content: String,
}

impl Message {
    /// Convenience constructor for a system-role message.
    pub fn system(content: impl Into<String>) -> Self {
        Message { role: Role::System, content: content.into() }
    }

    /// Convenience constructor for a user-role message.
    pub fn user(content: impl Into<String>) -> Self {
        Message { role: Role::User, content: content.into() }
    }

    /// Convenience constructor for an assistant-role message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Message { role: Role::Assistant, content: content.into() }
    }
}

/// Token/cost accounting for a single backend call.
///
/// `cost` may be zero when the backend does not report pricing.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Usage {
    /// Number of prompt/input tokens billed by the backend.
    pub prompt_tokens: u64,
    /// Number of generated/output tokens billed by the backend.
    pub completion_tokens: u64,
    /// Convenience total, normally `prompt_tokens + completion_tokens`.
    pub total_tokens: u64,
    /// Estimated or billed monetary cost of this call. Zero when unknown.
    pub cost: f64,
}

/// The result of a blocking [`Backend::complete`] call.
#[derive(Debug, Clone, Default)]
pub struct CompletionResult {
    /// The model's final answer text.
    pub content: String,
    /// Reasoning/thinking trace, kept separate from `content`. Empty string
    /// when the backend does not expose one.
    pub reasoning_content: String,
    /// Usage reported for this call.
    pub usage: Usage,
}

/// One chunk emitted by [`Backend::stream`].
///
/// Exactly one terminal variant (`Complete` or `Error`) is emitted per call,
/// after which the stream ends.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A reasoning/thinking delta, kept separate from `Content`.
    Thinking {
        /// The incremental text produced since the last `Thinking` event.
        delta: String,
        /// The cumulative reasoning text so far.
        cumulative: String,
    },
    /// A content delta.
    Content {
        /// The incremental text produced since the last `Content` event.
        delta: String,
        /// The cumulative content text so far.
        cumulative: String,
    },
    /// Terminal: the call completed successfully.
    Complete {
        /// The finalized content text (equal to the last `cumulative` seen).
        content: String,
        /// The finalized reasoning text, if any.
        reasoning_content: String,
        /// Usage for the whole call.
        usage: Usage,
    },
    /// Terminal: the call failed.
    Error(BackendError),
}

/// A boxed stream of [`StreamEvent`]s, `Send` so it can cross task
/// boundaries inside `tokio::spawn`.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Uniform contract for a text-completion model.
///
/// All implementations must be `Send + Sync` so a single `Arc<dyn Backend>`
/// can be shared across the concurrent child tasks spawned by Stage-1 and
/// Stage-2.
#[async_trait]
pub trait Backend: Send + Sync {
    /// The identifier used to select this backend (e.g. `"openai/gpt-5.1"`).
    fn id(&self) -> &str;

    /// Blocking request/response completion.
    async fn complete(
        &self,
        messages: &[Message],
        temperature: Option<f32>,
        max_tokens: Option<u32>,
        timeout: Option<Duration>,
    ) -> Result<CompletionResult, BackendError>;

    /// Streaming completion. Must emit exactly one terminal chunk
    /// (`StreamEvent::Complete` or `StreamEvent::Error`) and then end.
    async fn stream(
        &self,
        messages: &[Message],
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> Result<EventStream, BackendError>;
}

/// A static roster of available backends, keyed by id.
///
/// Used once at startup by [`crate::router::Router`] to validate panel
/// assignments, and held by the driver for the lifetime of the process.
pub struct BackendRegistry {
    backends: Vec<(String, std::sync::Arc<dyn Backend>)>,
}

impl BackendRegistry {
    /// Build a registry from an ordered list of backends. Order matters: it
    /// is the insertion order used for round-robin substitution in the
    /// Router (§4.3).
    pub fn new(backends: Vec<std::sync::Arc<dyn Backend>>) -> Self {
        let backends = backends.into_iter().map(|b| (b.id().to_string(), b)).collect();
        BackendRegistry { backends }
    }

    /// The set of available backend ids, in insertion order.
    pub fn list_available(&self) -> Vec<String> {
        self.backends.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Look up a backend by id.
    pub fn get(&self, id: &str) -> Option<std::sync::Arc<dyn Backend>> {
        self.backends.iter().find(|(bid, _)| bid == id).map(|(_, b)| b.clone())
    }

    /// Number of registered backends.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Whether the registry has no backends.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
