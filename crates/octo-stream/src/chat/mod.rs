//! Conversation and message storage consumed by the streaming pipeline.

pub mod models;
pub mod repository;

use anyhow::Result;
use async_trait::async_trait;

pub use models::{
    Conversation, ConversationStatus, CreateConversation, CreateMessage, CreateSubagent, Message,
    MessageRole, Subagent, SubagentStatus,
};
pub use repository::SqliteChatStore;

/// Persistence operations the pipeline needs from the chat store.
///
/// Every write is a single statement; no transaction spans several calls.
#[async_trait]
pub trait ChatStore: Send + Sync {
    // ========== Conversations ==========

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>>;

    async fn create_conversation(&self, input: CreateConversation) -> Result<Conversation>;

    async fn set_title(&self, id: &str, title: &str) -> Result<()>;

    async fn increment_compaction_count(&self, id: &str) -> Result<()>;

    // ========== Messages ==========

    /// Most recent message with role `user`.
    async fn last_user_message(&self, conversation_id: &str) -> Result<Option<Message>>;

    async fn create_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<Message>;

    /// Append a message from API input.
    async fn add_message(&self, conversation_id: &str, input: CreateMessage) -> Result<Message> {
        self.create_message(conversation_id, input.role, &input.content)
            .await
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>>;

    /// Replace the content of an existing message in place.
    async fn update_message_content(&self, id: &str, content: &str) -> Result<()>;

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>>;

    // ========== Subagents ==========

    async fn create_subagent(&self, input: CreateSubagent) -> Result<Subagent>;

    /// Correlate a spawned subagent with its external task id and status.
    ///
    /// Looked up by tool-call id. The task id is only filled in once and a
    /// terminal record is never modified.
    async fn bind_subagent_task(
        &self,
        conversation_id: &str,
        tool_call_id: &str,
        task_id: Option<&str>,
        status: SubagentStatus,
        output: Option<&str>,
    ) -> Result<Option<Subagent>>;

    /// Move the subagent with this task id to a terminal status.
    ///
    /// Returns `true` only when this call performed the transition. Unknown
    /// task ids and already terminal records both return `false`.
    async fn complete_subagent(
        &self,
        task_id: &str,
        status: SubagentStatus,
        output: Option<&str>,
    ) -> Result<bool>;

    async fn find_subagent_by_task(&self, task_id: &str) -> Result<Option<Subagent>>;

    async fn list_subagents(&self, conversation_id: &str) -> Result<Vec<Subagent>>;
}
