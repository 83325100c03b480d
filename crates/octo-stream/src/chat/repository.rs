//! SQLite-backed chat store.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::ChatStore;
use super::models::{
    Conversation, ConversationRow, ConversationStatus, CreateConversation, CreateSubagent,
    Message, MessageRole, Subagent, SubagentStatus,
};
use crate::db::Database;

const CONVERSATION_COLUMNS: &str =
    "id, title, tags, status, compaction_count, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, created_at, updated_at";
const SUBAGENT_COLUMNS: &str = "id, conversation_id, tool_call_id, task_id, description, tier, status, output, created_at, completed_at";

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

/// Chat store backed by the shared SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteChatStore {
    db: Database,
}

impl SqliteChatStore {
    /// Create a new store instance.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Bump `updated_at` so it strictly increases even within one millisecond.
    async fn touch_conversation(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE conversations SET updated_at = MAX(updated_at + 1, ?) WHERE id = ?")
            .bind(now_ms())
            .bind(id)
            .execute(self.db.pool())
            .await
            .context("touching conversation")?;
        Ok(())
    }

    async fn get_subagent_by_tool_call(
        &self,
        conversation_id: &str,
        tool_call_id: &str,
    ) -> Result<Option<Subagent>> {
        sqlx::query_as::<_, Subagent>(&format!(
            "SELECT {} FROM subagents WHERE conversation_id = ? AND tool_call_id = ? ORDER BY created_at DESC LIMIT 1",
            SUBAGENT_COLUMNS
        ))
        .bind(conversation_id)
        .bind(tool_call_id)
        .fetch_optional(self.db.pool())
        .await
        .context("fetching subagent by tool call")
    }
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    // ========== Conversations ==========

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query_as::<_, ConversationRow>(&format!(
            "SELECT {} FROM conversations WHERE id = ?",
            CONVERSATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.db.pool())
        .await
        .context("fetching conversation")?;

        Ok(row.map(Conversation::from))
    }

    async fn create_conversation(&self, input: CreateConversation) -> Result<Conversation> {
        let id = input.id.unwrap_or_else(|| new_id("conv"));
        let tags = serde_json::to_string(&input.tags).context("serializing tags")?;
        let now = now_ms();

        sqlx::query(
            r#"
            INSERT INTO conversations (id, title, tags, status, compaction_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&input.title)
        .bind(&tags)
        .bind(ConversationStatus::Active.to_string())
        .bind(now)
        .bind(now)
        .execute(self.db.pool())
        .await
        .context("inserting conversation")?;

        self.get_conversation(&id)
            .await?
            .context("conversation vanished after insert")
    }

    async fn set_title(&self, id: &str, title: &str) -> Result<()> {
        sqlx::query(
            "UPDATE conversations SET title = ?, updated_at = MAX(updated_at + 1, ?) WHERE id = ?",
        )
        .bind(title)
        .bind(now_ms())
        .bind(id)
        .execute(self.db.pool())
        .await
        .context("setting conversation title")?;
        Ok(())
    }

    async fn increment_compaction_count(&self, id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE conversations
            SET compaction_count = compaction_count + 1,
                updated_at = MAX(updated_at + 1, ?)
            WHERE id = ?
            "#,
        )
        .bind(now_ms())
        .bind(id)
        .execute(self.db.pool())
        .await
        .context("incrementing compaction count")?;
        Ok(())
    }

    // ========== Messages ==========

    async fn last_user_message(&self, conversation_id: &str) -> Result<Option<Message>> {
        sqlx::query_as::<_, Message>(&format!(
            "SELECT {} FROM messages WHERE conversation_id = ? AND role = 'user' ORDER BY created_at DESC, rowid DESC LIMIT 1",
            MESSAGE_COLUMNS
        ))
        .bind(conversation_id)
        .fetch_optional(self.db.pool())
        .await
        .context("fetching last user message")
    }

    async fn create_message(
        &self,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<Message> {
        let id = new_id("msg");
        let now = now_ms();

        let message = sqlx::query_as::<_, Message>(&format!(
            r#"
            INSERT INTO messages (id, conversation_id, role, content, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING {}
            "#,
            MESSAGE_COLUMNS
        ))
        .bind(&id)
        .bind(conversation_id)
        .bind(role.to_string())
        .bind(content)
        .bind(now)
        .bind(now)
        .fetch_one(self.db.pool())
        .await
        .context("inserting message")?;

        self.touch_conversation(conversation_id).await?;
        Ok(message)
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        sqlx::query_as::<_, Message>(&format!(
            "SELECT {} FROM messages WHERE id = ?",
            MESSAGE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.db.pool())
        .await
        .context("fetching message")
    }

    async fn update_message_content(&self, id: &str, content: &str) -> Result<()> {
        let result = sqlx::query("UPDATE messages SET content = ?, updated_at = ? WHERE id = ?")
            .bind(content)
            .bind(now_ms())
            .bind(id)
            .execute(self.db.pool())
            .await
            .context("updating message content")?;

        if result.rows_affected() == 0 {
            bail!("message not found: {}", id);
        }
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        sqlx::query_as::<_, Message>(&format!(
            "SELECT {} FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, rowid ASC",
            MESSAGE_COLUMNS
        ))
        .bind(conversation_id)
        .fetch_all(self.db.pool())
        .await
        .context("listing messages")
    }

    // ========== Subagents ==========

    async fn create_subagent(&self, input: CreateSubagent) -> Result<Subagent> {
        let id = new_id("sub");

        sqlx::query_as::<_, Subagent>(&format!(
            r#"
            INSERT INTO subagents (id, conversation_id, tool_call_id, description, tier, status, created_at)
            VALUES (?, ?, ?, ?, ?, 'running', ?)
            RETURNING {}
            "#,
            SUBAGENT_COLUMNS
        ))
        .bind(&id)
        .bind(&input.conversation_id)
        .bind(&input.tool_call_id)
        .bind(&input.description)
        .bind(&input.tier)
        .bind(now_ms())
        .fetch_one(self.db.pool())
        .await
        .context("inserting subagent")
    }

    async fn bind_subagent_task(
        &self,
        conversation_id: &str,
        tool_call_id: &str,
        task_id: Option<&str>,
        status: SubagentStatus,
        output: Option<&str>,
    ) -> Result<Option<Subagent>> {
        if let Some(task_id) = task_id {
            sqlx::query(
                r#"
                UPDATE subagents SET task_id = ?
                WHERE conversation_id = ? AND tool_call_id = ? AND task_id IS NULL
                "#,
            )
            .bind(task_id)
            .bind(conversation_id)
            .bind(tool_call_id)
            .execute(self.db.pool())
            .await
            .context("binding subagent task id")?;
        }

        let completed_at = status.is_terminal().then(now_ms);
        sqlx::query(
            r#"
            UPDATE subagents
            SET status = ?, output = COALESCE(?, output), completed_at = ?
            WHERE conversation_id = ? AND tool_call_id = ? AND completed_at IS NULL
            "#,
        )
        .bind(status.to_string())
        .bind(output)
        .bind(completed_at)
        .bind(conversation_id)
        .bind(tool_call_id)
        .execute(self.db.pool())
        .await
        .context("updating subagent status")?;

        self.get_subagent_by_tool_call(conversation_id, tool_call_id)
            .await
    }

    async fn complete_subagent(
        &self,
        task_id: &str,
        status: SubagentStatus,
        output: Option<&str>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            bail!("not a terminal subagent status: {}", status);
        }

        let result = sqlx::query(
            r#"
            UPDATE subagents
            SET status = ?, output = COALESCE(?, output), completed_at = ?
            WHERE task_id = ? AND completed_at IS NULL
            "#,
        )
        .bind(status.to_string())
        .bind(output)
        .bind(now_ms())
        .bind(task_id)
        .execute(self.db.pool())
        .await
        .context("completing subagent")?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_subagent_by_task(&self, task_id: &str) -> Result<Option<Subagent>> {
        sqlx::query_as::<_, Subagent>(&format!(
            "SELECT {} FROM subagents WHERE task_id = ? ORDER BY created_at DESC LIMIT 1",
            SUBAGENT_COLUMNS
        ))
        .bind(task_id)
        .fetch_optional(self.db.pool())
        .await
        .context("fetching subagent by task id")
    }

    async fn list_subagents(&self, conversation_id: &str) -> Result<Vec<Subagent>> {
        sqlx::query_as::<_, Subagent>(&format!(
            "SELECT {} FROM subagents WHERE conversation_id = ? ORDER BY created_at ASC, rowid ASC",
            SUBAGENT_COLUMNS
        ))
        .bind(conversation_id)
        .fetch_all(self.db.pool())
        .await
        .context("listing subagents")
    }
}
