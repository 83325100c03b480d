//! Canonical stream events and their wire form.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chat::Message;

/// Closed set of domain events produced from raw runtime events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StreamEvent {
    /// Assistant text delta.
    Text { content: String },

    ToolStart {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        args: Value,
    },

    ToolEnd {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        is_error: bool,
    },

    /// The assistant finished its reply.
    ///
    /// `content` carries the final text when the runtime reports it, for
    /// replies that never streamed deltas.
    Completion {
        stop_reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },

    Error { error: String },

    AgentStart,

    AgentEnd,

    CompactionStart {
        #[serde(default)]
        reason: String,
    },

    CompactionEnd {
        #[serde(default)]
        aborted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// A `spawn_agent` tool call started.
    SubagentSpawn {
        tool_call_id: String,
        description: String,
        tier: String,
    },

    /// A `spawn_agent` tool call finished. Fields the result text did not
    /// reveal are `None`.
    SubagentResult {
        tool_call_id: String,
        #[serde(default)]
        task_id: Option<String>,
        #[serde(default)]
        status: Option<String>,
    },

    SubagentOutput {
        #[serde(default)]
        tool_call_id: Option<String>,
        lines: Vec<String>,
    },

    /// Out-of-band verdict for a subagent.
    SubagentComplete {
        task_id: String,
        description: String,
        success: bool,
    },
}

impl StreamEvent {
    /// Event name used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Text { .. } => "text",
            StreamEvent::ToolStart { .. } => "tool_start",
            StreamEvent::ToolEnd { .. } => "tool_end",
            StreamEvent::Completion { .. } => "completion",
            StreamEvent::Error { .. } => "error",
            StreamEvent::AgentStart => "agent_start",
            StreamEvent::AgentEnd => "agent_end",
            StreamEvent::CompactionStart { .. } => "compaction_start",
            StreamEvent::CompactionEnd { .. } => "compaction_end",
            StreamEvent::SubagentSpawn { .. } => "subagent_spawn",
            StreamEvent::SubagentResult { .. } => "subagent_result",
            StreamEvent::SubagentOutput { .. } => "subagent_output",
            StreamEvent::SubagentComplete { .. } => "subagent_complete",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            error: message.into(),
        }
    }
}

/// Payload of the transport-level `done` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonePayload {
    pub message: Message,
}

/// Everything the coordinator writes to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    Event(StreamEvent),
    Done(DonePayload),
}

impl OutboundEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundEvent::Event(event) => event.kind(),
            OutboundEvent::Done(_) => "done",
        }
    }

    /// JSON body of the `data:` line.
    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            OutboundEvent::Event(event) => serde_json::to_string(event),
            OutboundEvent::Done(done) => serde_json::to_string(done),
        }
    }

    /// Rebuild an event from its wire name and `data:` body.
    pub fn from_wire(kind: &str, data: &str) -> serde_json::Result<Self> {
        if kind == "done" {
            return serde_json::from_str(data).map(OutboundEvent::Done);
        }

        // Trust the event name over any tag inside the payload.
        let mut value: Value = serde_json::from_str(data)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("type".to_string(), Value::String(kind.to_string()));
        }
        serde_json::from_value(value).map(OutboundEvent::Event)
    }
}

impl From<StreamEvent> for OutboundEvent {
    fn from(event: StreamEvent) -> Self {
        OutboundEvent::Event(event)
    }
}
