//! Subagent lifecycle tracking.
//!
//! A subagent record is written by three independent sources that may arrive
//! in any order: the spawning tool call (`subagent_spawn` then
//! `subagent_result`, correlated by tool-call id), out-of-band notifications
//! (correlated by task id, possibly after the stream has closed), and client
//! polling (read only). All writes go straight to the store, and terminal
//! writes are guarded there so the first verdict wins.

use anyhow::Result;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;

use crate::canon::{StreamEvent, translate_notification};
use crate::chat::{ChatStore, CreateSubagent, Subagent, SubagentStatus};

/// Lifecycle phase of a subagent as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentPhase {
    /// Spawn observed, task id not yet known.
    Spawning,
    Running,
    Completed,
    Failed,
}

impl SubagentPhase {
    pub fn of(record: &Subagent) -> Self {
        match record.status() {
            SubagentStatus::Completed => Self::Completed,
            SubagentStatus::Failed => Self::Failed,
            SubagentStatus::Running if record.task_id.is_none() => Self::Spawning,
            SubagentStatus::Running => Self::Running,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Writes subagent transitions to durable storage.
#[derive(Clone)]
pub struct SubagentTracker {
    store: Arc<dyn ChatStore>,
}

impl SubagentTracker {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    /// Feed a canonical event from a live stream. Storage failures are
    /// logged; the stream is never interrupted.
    pub async fn on_event(&self, conversation_id: &str, event: &StreamEvent) {
        match event {
            StreamEvent::SubagentSpawn {
                tool_call_id,
                description,
                tier,
            } => {
                self.on_spawn(conversation_id, tool_call_id, description, tier)
                    .await;
            }
            StreamEvent::SubagentResult {
                tool_call_id,
                task_id,
                status,
            } => {
                self.on_tool_result(
                    conversation_id,
                    tool_call_id,
                    task_id.as_deref(),
                    status.as_deref(),
                )
                .await;
            }
            _ => {}
        }
    }

    /// Create the record for a freshly spawned subagent.
    pub async fn on_spawn(
        &self,
        conversation_id: &str,
        tool_call_id: &str,
        description: &str,
        tier: &str,
    ) -> Option<Subagent> {
        let input = CreateSubagent {
            conversation_id: conversation_id.to_string(),
            tool_call_id: tool_call_id.to_string(),
            description: description.to_string(),
            tier: tier.to_string(),
        };
        match self.store.create_subagent(input).await {
            Ok(record) => {
                info!(
                    "Subagent {} spawned in {} via {}",
                    record.id, conversation_id, tool_call_id
                );
                Some(record)
            }
            Err(e) => {
                warn!("Failed to record subagent spawn {}: {:#}", tool_call_id, e);
                None
            }
        }
    }

    /// Bind the task id reported by the spawning tool call.
    ///
    /// An unknown status word keeps the record running.
    pub async fn on_tool_result(
        &self,
        conversation_id: &str,
        tool_call_id: &str,
        task_id: Option<&str>,
        status: Option<&str>,
    ) -> Option<Subagent> {
        let status = status
            .and_then(SubagentStatus::from_word)
            .unwrap_or(SubagentStatus::Running);

        match self
            .store
            .bind_subagent_task(conversation_id, tool_call_id, task_id, status, None)
            .await
        {
            Ok(Some(record)) => Some(record),
            Ok(None) => {
                debug!(
                    "No subagent for tool call {} in {}, ignoring result",
                    tool_call_id, conversation_id
                );
                None
            }
            Err(e) => {
                warn!("Failed to bind subagent {}: {:#}", tool_call_id, e);
                None
            }
        }
    }

    /// Handle out-of-band notification text.
    ///
    /// Writes the verdict by task id without needing a live stream. Returns
    /// the event to forward when a transport is still attached, reflecting
    /// the durable verdict if one was already recorded.
    pub async fn on_notification(&self, text: &str) -> Option<StreamEvent> {
        let Some(StreamEvent::SubagentComplete {
            task_id,
            description: output,
            success,
        }) = translate_notification(text)
        else {
            debug!("Notification carries no subagent verdict");
            return None;
        };
        let status = if success {
            SubagentStatus::Completed
        } else {
            SubagentStatus::Failed
        };
        let output = (!output.is_empty()).then_some(output);

        match self
            .store
            .complete_subagent(&task_id, status, output.as_deref())
            .await
        {
            Ok(true) => info!("Subagent {} -> {}", task_id, status),
            Ok(false) => debug!(
                "Subagent {} not found or already terminal, ignoring verdict",
                task_id
            ),
            Err(e) => warn!("Failed to complete subagent {}: {:#}", task_id, e),
        }

        let record = self
            .store
            .find_subagent_by_task(&task_id)
            .await
            .unwrap_or_else(|e| {
                warn!("Failed to load subagent {}: {:#}", task_id, e);
                None
            });

        let (description, success) = match record {
            Some(record) if record.is_terminal() => {
                let success = record.status() == SubagentStatus::Completed;
                (record.description, success)
            }
            Some(record) => (record.description, success),
            None => (output.unwrap_or_default(), success),
        };

        Some(StreamEvent::SubagentComplete {
            task_id,
            description,
            success,
        })
    }

    /// Current subagents of a conversation, for polling.
    pub async fn list(&self, conversation_id: &str) -> Result<Vec<Subagent>> {
        self.store.list_subagents(conversation_id).await
    }
}
