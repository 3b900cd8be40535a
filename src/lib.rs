//! A multi-advisor deliberation engine: classify a question, route it to a
//! panel of backend-bound advisor personas, collect their independent
//! answers, have the panel peer-rank them under a rubric, and synthesize a
//! final response from the aggregate.

pub mod aggregator;
pub mod backend;
pub mod classifier;
pub mod config;
pub mod conversation;
pub mod council;
pub mod error;
pub mod event;
pub mod leaderboard;
pub mod pipeline;
pub mod ranking;
pub mod router;
pub mod stage1;
pub mod stage2;
pub mod stage3;
pub mod text;
pub mod token_accountant;

pub use backend::{Backend, BackendRegistry, Message, Role};
pub use council::{Advisor, Council, Panel, PanelMember};
pub use error::DeliberationError;
pub use pipeline::{ExecutionMode, Request};
