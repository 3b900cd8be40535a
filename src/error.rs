//! Error kinds surfaced by the deliberation pipeline.
//!
//! Component failures that have a defined degradation path (the Classifier
//! falling back to `deliberation`, the Router falling back to a
//! deterministic panel) never produce an error value: they are absorbed
//! locally, per their failure semantics. The types here cover the cases
//! that must be surfaced to the driver and, from there, to the client.

use std::error::Error;
use std::fmt;

/// Errors that can terminate a deliberation request.
#[derive(Debug, Clone)]
pub enum DeliberationError {
    /// A backend call failed at the transport level (network, timeout, or
    /// malformed framing). Stage-1/2 absorb these per member; Stage-3
    /// surfaces buffered content instead of raising this variant.
    BackendTransport(String),
    /// The router could not assemble `min` advisors even after falling back
    /// to the deterministic panel (e.g. an empty roster).
    PanelInfeasible(String),
    /// Every Stage-1 panel member errored; there is nothing to rank or
    /// synthesize.
    NoStage1Survivors,
    /// The conversation append failed after the response was already
    /// streamed to the client.
    PersistenceFailure(String),
    /// The request was cancelled (client disconnect). No events are
    /// emitted and nothing is persisted once this fires.
    Cancelled,
}

impl fmt::Display for DeliberationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliberationError::BackendTransport(msg) => write!(f, "backend transport error: {}", msg),
            DeliberationError::PanelInfeasible(msg) => write!(f, "panel infeasible: {}", msg),
            DeliberationError::NoStage1Survivors => write!(f, "no stage-1 survivors"),
            DeliberationError::PersistenceFailure(msg) => write!(f, "persistence failure: {}", msg),
            DeliberationError::Cancelled => write!(f, "request cancelled"),
        }
    }
}

impl Error for DeliberationError {}

/// Errors raised directly by a [`crate::backend::Backend`] implementation.
#[derive(Debug, Clone)]
pub enum BackendError {
    /// Network failure, timeout, or malformed transport framing.
    Transport(String),
    /// The backend returned content that could not be parsed where strict
    /// JSON was expected.
    Schema(String),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Transport(msg) => write!(f, "transport error: {}", msg),
            BackendError::Schema(msg) => write!(f, "schema error: {}", msg),
        }
    }
}

impl Error for BackendError {}

impl From<BackendError> for DeliberationError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Transport(msg) => DeliberationError::BackendTransport(msg),
            BackendError::Schema(msg) => DeliberationError::BackendTransport(msg),
        }
    }
}
