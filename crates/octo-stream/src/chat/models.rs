//! Conversation, message and subagent data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            _ => Err(format!("Unknown message role: {}", s)),
        }
    }
}

/// Lifecycle status of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Completed,
    Abandoned,
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Durable status of a subagent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentStatus {
    Running,
    Completed,
    Failed,
}

impl SubagentStatus {
    /// Whether no further transition is allowed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Map a free-form status word reported by the runtime.
    ///
    /// Returns `None` for words that carry no lifecycle meaning.
    pub fn from_word(word: &str) -> Option<Self> {
        match word.trim().to_lowercase().as_str() {
            "running" | "started" | "spawned" | "pending" | "queued" => Some(Self::Running),
            "completed" | "complete" | "done" | "succeeded" | "success" => Some(Self::Completed),
            "failed" | "failure" | "error" | "errored" | "cancelled" | "canceled" => {
                Some(Self::Failed)
            }
            _ => None,
        }
    }
}

impl fmt::Display for SubagentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for SubagentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown subagent status: {}", s)),
        }
    }
}

/// Raw conversation row; tags are stored as a JSON array.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct ConversationRow {
    pub id: String,
    pub title: Option<String>,
    pub tags: String,
    pub status: String,
    pub compaction_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A conversation (a.k.a. session).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub status: String,
    pub compaction_count: i64,
    /// Unix timestamp in milliseconds
    pub created_at: i64,
    /// Strictly increasing across mutations (milliseconds)
    pub updated_at: i64,
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        let tags = serde_json::from_str(&row.tags).unwrap_or_default();
        Self {
            id: row.id,
            title: row.title,
            tags,
            status: row.status,
            compaction_count: row.compaction_count,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Input for creating a conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateConversation {
    /// Caller-chosen identity; generated when absent.
    pub id: Option<String>,
    pub title: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A chat message stored in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    /// Message role (system, user, assistant, tool)
    pub role: String,
    pub content: String,
    /// Unix timestamp in milliseconds
    pub created_at: i64,
    pub updated_at: i64,
}

/// Input for creating a new chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMessage {
    pub role: MessageRole,
    pub content: String,
}

/// A tracked subagent record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Subagent {
    pub id: String,
    pub conversation_id: String,
    /// Local correlation key (the spawning tool call)
    pub tool_call_id: String,
    /// External task identifier, bound once the spawn result is parsed
    pub task_id: Option<String>,
    pub description: String,
    pub tier: String,
    pub status: String,
    pub output: Option<String>,
    pub created_at: i64,
    /// Set exactly once, on the terminal transition
    pub completed_at: Option<i64>,
}

impl Subagent {
    /// Parsed status; unknown strings are treated as running.
    pub fn status(&self) -> SubagentStatus {
        self.status.parse().unwrap_or(SubagentStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Input for registering a freshly spawned subagent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSubagent {
    pub conversation_id: String,
    pub tool_call_id: String,
    pub description: String,
    pub tier: String,
}
