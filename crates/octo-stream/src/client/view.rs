//! Client-side view model rebuilt from stream events and polls.
//!
//! Every merge is idempotent and order-insensitive: fields are only filled
//! in, never cleared, and a terminal subagent status never regresses. Push
//! and poll can therefore race freely.

use serde_json::Value;

use crate::canon::{OutboundEvent, StreamEvent};
use crate::chat::{Message, Subagent, SubagentStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallView {
    pub tool_call_id: String,
    pub tool_name: String,
    pub args: Value,
    pub finished: bool,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubagentView {
    /// Local correlation id; not stable across reconnects.
    pub tool_call_id: Option<String>,
    /// External task id, the reconciliation key for polling.
    pub task_id: Option<String>,
    pub description: String,
    pub tier: String,
    pub status: SubagentStatus,
    /// Live output lines pushed while the subagent runs.
    pub output: Vec<String>,
    /// Final output recorded by the server.
    pub result: Option<String>,
    pub completed_at: Option<i64>,
}

impl SubagentView {
    fn new(tool_call_id: Option<String>, task_id: Option<String>) -> Self {
        Self {
            tool_call_id,
            task_id,
            description: String::new(),
            tier: String::new(),
            status: SubagentStatus::Running,
            output: Vec::new(),
            result: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn merge_status(&mut self, incoming: SubagentStatus) -> bool {
        if self.status.is_terminal() || self.status == incoming {
            return false;
        }
        self.status = incoming;
        true
    }

    fn fill_description(&mut self, description: &str) {
        if self.description.is_empty() {
            self.description = description.to_string();
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatView {
    text: String,
    messages: Vec<Message>,
    tool_calls: Vec<ToolCallView>,
    subagents: Vec<SubagentView>,
    last_error: Option<String>,
    compacting: bool,
}

impl ChatView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text of the reply in progress.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Finished messages delivered by `done` events.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn tool_calls(&self) -> &[ToolCallView] {
        &self.tool_calls
    }

    pub fn subagents(&self) -> &[SubagentView] {
        &self.subagents
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_compacting(&self) -> bool {
        self.compacting
    }

    pub fn subagent_by_task(&self, task_id: &str) -> Option<&SubagentView> {
        self.subagents
            .iter()
            .find(|s| s.task_id.as_deref() == Some(task_id))
    }

    /// Task ids of subagents still waiting for a verdict.
    ///
    /// Subagents whose task id never arrived cannot be reconciled and are
    /// left out.
    pub fn pending_task_ids(&self) -> Vec<String> {
        self.subagents
            .iter()
            .filter(|s| !s.is_terminal())
            .filter_map(|s| s.task_id.clone())
            .collect()
    }

    pub fn needs_polling(&self) -> bool {
        !self.pending_task_ids().is_empty()
    }

    pub fn apply(&mut self, event: &OutboundEvent) {
        match event {
            OutboundEvent::Done(done) => {
                match self.messages.iter_mut().find(|m| m.id == done.message.id) {
                    Some(existing) => *existing = done.message.clone(),
                    None => self.messages.push(done.message.clone()),
                }
                self.text.clear();
            }
            OutboundEvent::Event(event) => self.apply_event(event),
        }
    }

    fn apply_event(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Text { content } => self.text.push_str(content),

            StreamEvent::ToolStart {
                tool_call_id,
                tool_name,
                args,
            } => {
                let call = self.tool_call(tool_call_id, tool_name);
                if call.args.is_null() {
                    call.args = args.clone();
                }
            }

            StreamEvent::ToolEnd {
                tool_call_id,
                tool_name,
                is_error,
            } => {
                let call = self.tool_call(tool_call_id, tool_name);
                call.finished = true;
                call.is_error |= *is_error;
            }

            StreamEvent::SubagentSpawn {
                tool_call_id,
                description,
                tier,
            } => {
                let view = self.subagent_by_call(tool_call_id, None);
                view.fill_description(description);
                if view.tier.is_empty() {
                    view.tier = tier.clone();
                }
            }

            StreamEvent::SubagentResult {
                tool_call_id,
                task_id,
                status,
            } => {
                let view = self.subagent_by_call(tool_call_id, task_id.as_deref());
                if view.task_id.is_none() {
                    view.task_id = task_id.clone();
                }
                if let Some(status) = status.as_deref().and_then(SubagentStatus::from_word) {
                    view.merge_status(status);
                }
            }

            StreamEvent::SubagentOutput {
                tool_call_id,
                lines,
            } => {
                let view = match tool_call_id {
                    Some(id) => Some(self.subagent_by_call(id, None)),
                    None => self.subagents.iter_mut().rev().find(|s| !s.is_terminal()),
                };
                if let Some(view) = view {
                    view.output.extend(lines.iter().cloned());
                }
            }

            StreamEvent::SubagentComplete {
                task_id,
                description,
                success,
            } => {
                let view = self.subagent_by_task_mut(task_id);
                view.fill_description(description);
                view.merge_status(if *success {
                    SubagentStatus::Completed
                } else {
                    SubagentStatus::Failed
                });
            }

            StreamEvent::CompactionStart { .. } => self.compacting = true,
            StreamEvent::CompactionEnd { .. } => self.compacting = false,

            StreamEvent::Error { error } => self.last_error = Some(error.clone()),

            StreamEvent::Completion { .. } | StreamEvent::AgentStart | StreamEvent::AgentEnd => {}
        }
    }

    /// Merge polled server records, matched by task id only.
    ///
    /// Returns how many tracked subagents changed status.
    pub fn reconcile(&mut self, records: &[Subagent]) -> usize {
        let mut changed = 0;
        for record in records {
            let Some(ref task_id) = record.task_id else {
                continue;
            };
            let Some(view) = self
                .subagents
                .iter_mut()
                .find(|s| s.task_id.as_deref() == Some(task_id.as_str()))
            else {
                continue;
            };

            if view.merge_status(record.status()) {
                changed += 1;
            }
            view.fill_description(&record.description);
            if view.result.is_none() {
                view.result = record.output.clone();
            }
            if view.completed_at.is_none() {
                view.completed_at = record.completed_at;
            }
        }
        changed
    }

    fn tool_call(&mut self, tool_call_id: &str, tool_name: &str) -> &mut ToolCallView {
        let index = match self
            .tool_calls
            .iter()
            .position(|c| c.tool_call_id == tool_call_id)
        {
            Some(index) => index,
            None => {
                self.tool_calls.push(ToolCallView {
                    tool_call_id: tool_call_id.to_string(),
                    tool_name: tool_name.to_string(),
                    args: Value::Null,
                    finished: false,
                    is_error: false,
                });
                self.tool_calls.len() - 1
            }
        };
        &mut self.tool_calls[index]
    }

    /// Subagent keyed by tool call, falling back to task id for records
    /// first seen through a verdict.
    fn subagent_by_call(&mut self, tool_call_id: &str, task_id: Option<&str>) -> &mut SubagentView {
        let position = self
            .subagents
            .iter()
            .position(|s| s.tool_call_id.as_deref() == Some(tool_call_id))
            .or_else(|| {
                let task_id = task_id?;
                self.subagents
                    .iter()
                    .position(|s| s.tool_call_id.is_none() && s.task_id.as_deref() == Some(task_id))
            });

        let index = match position {
            Some(index) => {
                let view = &mut self.subagents[index];
                if view.tool_call_id.is_none() {
                    view.tool_call_id = Some(tool_call_id.to_string());
                }
                index
            }
            None => {
                self.subagents.push(SubagentView::new(
                    Some(tool_call_id.to_string()),
                    task_id.map(str::to_string),
                ));
                self.subagents.len() - 1
            }
        };
        &mut self.subagents[index]
    }

    fn subagent_by_task_mut(&mut self, task_id: &str) -> &mut SubagentView {
        let index = match self
            .subagents
            .iter()
            .position(|s| s.task_id.as_deref() == Some(task_id))
        {
            Some(index) => index,
            None => {
                self.subagents
                    .push(SubagentView::new(None, Some(task_id.to_string())));
                self.subagents.len() - 1
            }
        };
        &mut self.subagents[index]
    }
}
