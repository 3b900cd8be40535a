//! Conversation persistence (§6 "Conversation store", §3 "Message").
//!
//! `ConversationStore` is the trait the driver persists through; the
//! in-memory implementation here is the one this crate ships. A durable
//! (file- or database-backed) implementation is out of scope (§1); callers
//! needing one implement the trait themselves.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::aggregator::AnalysisBundle;
use crate::backend::Usage;
use crate::council::Panel;

/// One prior question/answer pair, as projected into Stage-1/3 prompts
/// (§4.4, §4.8).
#[derive(Debug, Clone, Default)]
pub struct Exchange {
    pub user_text: String,
    pub assistant_response: String,
}

/// Everything recorded for one deliberation's assistant turn (§3 "Message").
#[derive(Debug, Clone)]
pub struct AssistantRecord {
    pub stage1: Vec<crate::stage1::Stage1Output>,
    pub stage2: Vec<crate::stage2::Stage2Output>,
    pub stage3_response: String,
    pub analysis: AnalysisBundle,
    pub panel: Panel,
    pub usage_by_stage: HashMap<String, Usage>,
    pub usage_total: Usage,
}

/// One turn in a conversation: either the user's utterance or the engine's
/// full assistant record.
#[derive(Debug, Clone)]
pub enum Turn {
    User(String),
    Assistant(AssistantRecord),
}

/// A persisted conversation: an append-only, ordered turn log plus a
/// best-effort title.
#[derive(Debug, Clone, Default)]
pub struct ConversationRecord {
    pub id: String,
    pub title: Option<String>,
    pub turns: Vec<Turn>,
    pub deleted: bool,
}

impl ConversationRecord {
    /// The last `n` exchanges, oldest first, projected for prompt-building
    /// (§4.4 "historyProjection").
    pub fn recent_exchanges(&self, n: usize) -> Vec<Exchange> {
        let mut exchanges = Vec::new();
        let mut pending_user: Option<String> = None;
        for turn in &self.turns {
            match turn {
                Turn::User(text) => pending_user = Some(text.clone()),
                Turn::Assistant(record) => {
                    if let Some(user_text) = pending_user.take() {
                        exchanges.push(Exchange {
                            user_text,
                            assistant_response: record.stage3_response.clone(),
                        });
                    }
                }
            }
        }
        let start = exchanges.len().saturating_sub(n);
        exchanges.split_off(start)
    }
}

/// Persistence contract the driver appends through (§6 "Conversation store").
#[async_trait::async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get(&self, id: &str) -> Option<ConversationRecord>;
    async fn create(&self, id: &str) -> ConversationRecord;
    async fn append_user(&self, id: &str, text: &str);
    async fn append_assistant(&self, id: &str, record: AssistantRecord);
    async fn update_title(&self, id: &str, title: &str);
    async fn list(&self) -> Vec<ConversationRecord>;
    async fn soft_delete(&self, id: &str);
}

/// In-memory `ConversationStore`. Lost on process exit, adequate for
/// tests and for callers that layer their own durable store on the trait.
#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: RwLock<HashMap<String, ConversationRecord>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        InMemoryConversationStore { conversations: RwLock::new(HashMap::new()) }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait::async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn get(&self, id: &str) -> Option<ConversationRecord> {
        self.conversations.read().await.get(id).cloned()
    }

    async fn create(&self, id: &str) -> ConversationRecord {
        let record = ConversationRecord { id: id.to_string(), ..Default::default() };
        self.conversations.write().await.insert(id.to_string(), record.clone());
        record
    }

    async fn append_user(&self, id: &str, text: &str) {
        let mut conversations = self.conversations.write().await;
        let record = conversations
            .entry(id.to_string())
            .or_insert_with(|| ConversationRecord { id: id.to_string(), ..Default::default() });
        record.turns.push(Turn::User(text.to_string()));
    }

    async fn append_assistant(&self, id: &str, record: AssistantRecord) {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .entry(id.to_string())
            .or_insert_with(|| ConversationRecord { id: id.to_string(), ..Default::default() });
        conversation.turns.push(Turn::Assistant(record));
    }

    async fn update_title(&self, id: &str, title: &str) {
        if let Some(record) = self.conversations.write().await.get_mut(id) {
            record.title = Some(title.to_string());
        }
    }

    async fn list(&self) -> Vec<ConversationRecord> {
        self.conversations.read().await.values().filter(|c| !c.deleted).cloned().collect()
    }

    async fn soft_delete(&self, id: &str) {
        if let Some(record) = self.conversations.write().await.get_mut(id) {
            record.deleted = true;
        }
    }
}
