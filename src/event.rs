//! The deliberation event stream: a closed set of progress events (§6) and
//! the bounded queue the driver uses to fan them out without blocking
//! behind a slow consumer (§4.9 "Event fan-out").
//!
//! A synchronous callback invoked from inside the producing task doesn't
//! fit a driver that must keep polling while child tasks are in flight, so
//! the closed event set here is expressed as values pushed onto a
//! `tokio::sync::mpsc` channel and drained by the driver.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::backend::Usage;

/// One entry in a `*_token` payload's running throughput figures.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TokenRate {
    pub tokens_per_second: f64,
    pub elapsed_seconds: f64,
}

/// Per-stage usage plus the running grand total, as carried on `usage_update`
/// and `done`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageSnapshot {
    pub stage: String,
    pub usage: Usage,
    pub running_total: Usage,
}

/// The closed set of events a deliberation request can emit (§6).
///
/// `SearchStart`/`SearchComplete` exist only for wire compatibility with
/// consumers expecting the full event-type enum; this crate never
/// constructs them, since web-search adapters are out of scope.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    ExecutionMode { mode: String },
    ClassificationStart,
    ClassificationComplete { message_type: String, reasoning: String },
    DirectStart,
    RoutingStart,
    RoutingComplete { panel_size: usize },
    PanelConfirmed { members: Vec<PanelMemberView> },
    SearchStart,
    SearchComplete,

    Stage1Init { total: usize },
    Stage1Progress { completed: usize, total: usize, backend: String, role: String, member_id: String },
    Stage1Thinking { backend: String, member_id: String, role: String, delta: String, content: String, rate: TokenRate },
    Stage1Token { backend: String, member_id: String, role: String, delta: String, content: String, rate: TokenRate },
    Stage1ModelComplete { backend: String, member_id: String, role: String, content: String },
    Stage1ModelError { backend: String, member_id: String, role: String, error: String },
    Stage1Complete { survivors: usize },

    RoundStart { round: u32 },
    RoundComplete { round: u32 },

    Stage2Init { total: usize },
    Stage2Progress { completed: usize, total: usize, backend: String, role: String, member_id: String },
    Stage2Thinking { backend: String, member_id: String, role: String, delta: String, content: String, rate: TokenRate },
    Stage2Token { backend: String, member_id: String, role: String, delta: String, content: String, rate: TokenRate },
    Stage2ModelComplete { backend: String, member_id: String, role: String, content: String },
    Stage2Complete,
    Analysis { winner: Option<String>, conflicts: usize, minority_opinions: usize },

    Stage3Start,
    Stage3Thinking { delta: String, content: String, rate: TokenRate },
    Stage3Token { delta: String, content: String, rate: TokenRate },
    Stage3Complete { content: String },
    Stage3Error { error: String },

    UsageUpdate(UsageSnapshot),
    Done { usage_by_stage: std::collections::HashMap<String, Usage>, usage_total: Usage },
    Error { message: String },
}

/// Compact view of a panel member for the `panel_confirmed` payload.
#[derive(Debug, Clone, Serialize)]
pub struct PanelMemberView {
    pub advisor_id: String,
    pub backend_id: String,
    pub reasoning: String,
}

/// The default channel capacity: generous enough that a burst of
/// token-level events from a fast backend doesn't stall the producing task
/// while the driver is mid-poll.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// The producer half of the bounded event queue, cloned into every Stage-1/2
/// child task so each can push events without contending on the driver.
#[derive(Clone)]
pub struct EventSender {
    inner: mpsc::Sender<Event>,
}

impl EventSender {
    /// Push an event, awaiting if the queue is momentarily full. Returns
    /// `Err` only once the receiver (the driver) has been dropped, which
    /// happens on cancellation; callers should treat that as "stop
    /// producing", not retry.
    pub async fn send(&self, event: Event) -> Result<(), Event> {
        self.inner.send(event).await.map_err(|e| e.0)
    }
}

/// The consumer half, held by the driver and drained on a 50 ms poll
/// interval while child tasks run (§4.9).
pub struct EventReceiver {
    inner: mpsc::Receiver<Event>,
}

impl EventReceiver {
    /// Poll for the next event, waiting up to `timeout` before returning
    /// `None` (not end-of-stream, just "nothing arrived within the poll
    /// window").
    pub async fn recv_timeout(&mut self, timeout: std::time::Duration) -> Option<Event> {
        tokio::time::timeout(timeout, self.inner.recv()).await.ok().flatten()
    }

    /// Drain every event currently buffered without waiting.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.inner.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Create a bounded event queue with [`DEFAULT_QUEUE_CAPACITY`].
pub fn channel() -> (EventSender, EventReceiver) {
    channel_with_capacity(DEFAULT_QUEUE_CAPACITY)
}

/// Create a bounded event queue with an explicit capacity (tests use a
/// small one to exercise backpressure).
pub fn channel_with_capacity(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender { inner: tx }, EventReceiver { inner: rx })
}
