//! Pi RPC protocol types.
//!
//! Only the subset of the protocol the streaming pipeline drives is modelled.
//! Tool results are kept as raw JSON because their shape depends on the tool.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Commands (sent to pi via stdin)
// ============================================================================

/// Command sent to pi.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PiCommand {
    /// Send a user prompt to the agent.
    Prompt {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        message: String,
    },
    /// Abort the current agent operation.
    Abort {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// Get current session state.
    GetState {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// Switch to a specific model.
    SetModel {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        provider: String,
        #[serde(rename = "modelId")]
        model_id: String,
    },
}

impl PiCommand {
    /// Attach a request id for response correlation.
    pub fn with_id(mut self, request_id: String) -> Self {
        match &mut self {
            PiCommand::Prompt { id, .. }
            | PiCommand::Abort { id }
            | PiCommand::GetState { id }
            | PiCommand::SetModel { id, .. } => *id = Some(request_id),
        }
        self
    }

    pub fn name(&self) -> &'static str {
        match self {
            PiCommand::Prompt { .. } => "prompt",
            PiCommand::Abort { .. } => "abort",
            PiCommand::GetState { .. } => "get_state",
            PiCommand::SetModel { .. } => "set_model",
        }
    }
}

// ============================================================================
// Responses (received from pi via stdout)
// ============================================================================

/// Response to a command.
#[derive(Debug, Clone, Deserialize)]
pub struct PiResponse {
    #[serde(rename = "type")]
    pub response_type: String,
    pub command: String,
    pub success: bool,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

// ============================================================================
// Events (streamed from pi via stdout during operation)
// ============================================================================

/// Events streamed from pi during agent operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PiEvent {
    /// Agent begins processing.
    AgentStart,
    /// Agent completes.
    AgentEnd {
        #[serde(default)]
        messages: Vec<AgentMessage>,
    },
    TurnStart,
    TurnEnd {
        #[serde(default)]
        message: Option<AgentMessage>,
    },
    MessageStart {
        message: AgentMessage,
    },
    /// Streaming update.
    MessageUpdate {
        message: AgentMessage,
        #[serde(rename = "assistantMessageEvent")]
        assistant_message_event: AssistantMessageEvent,
    },
    MessageEnd {
        message: AgentMessage,
    },
    /// Tool begins execution.
    ToolExecutionStart {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(default)]
        args: Value,
    },
    /// Tool execution progress.
    ToolExecutionUpdate {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(default)]
        args: Value,
        #[serde(rename = "partialResult", default)]
        partial_result: Value,
    },
    /// Tool completes. `result` is a string or a content envelope.
    ToolExecutionEnd {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(default)]
        result: Value,
        #[serde(rename = "isError", default)]
        is_error: bool,
    },
    /// Extension UI request (RPC mode).
    ExtensionUiRequest(ExtensionUiRequest),
    /// Extension threw an error.
    ExtensionError {
        #[serde(default)]
        error: String,
    },
    AutoCompactionStart {
        #[serde(default)]
        reason: String,
    },
    AutoCompactionEnd {
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        aborted: bool,
        #[serde(rename = "willRetry", default)]
        will_retry: bool,
        #[serde(rename = "errorMessage", default)]
        error_message: Option<String>,
    },
    AutoRetryStart {
        #[serde(default)]
        attempt: u32,
        #[serde(rename = "errorMessage", default)]
        error_message: String,
    },
    AutoRetryEnd {
        success: bool,
        #[serde(default)]
        attempt: u32,
        #[serde(rename = "finalError", default)]
        final_error: Option<String>,
    },
    /// Hook threw an error.
    HookError {
        #[serde(rename = "hookPath", default)]
        hook_path: String,
        #[serde(default)]
        event: String,
        error: String,
    },
    /// Unknown event type (forward-compatible).
    #[serde(other)]
    Unknown,
}

/// Streaming delta events for assistant messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantMessageEvent {
    Start,
    TextDelta {
        #[serde(rename = "contentIndex", default)]
        content_index: usize,
        delta: String,
    },
    ThinkingDelta {
        #[serde(rename = "contentIndex", default)]
        content_index: usize,
        delta: String,
    },
    ToolcallEnd {
        #[serde(rename = "contentIndex", default)]
        content_index: usize,
        #[serde(rename = "toolCall")]
        tool_call: ToolCall,
    },
    Done {
        reason: String, // "stop", "length", "toolUse"
    },
    Error {
        reason: String, // "aborted", "error"
    },
    /// Unknown assistant event type (forward-compatible).
    #[serde(other)]
    Unknown,
}

/// Agent message (user, assistant or tool result).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: Value,
    #[serde(rename = "stopReason", default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(rename = "errorMessage", default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// UI request raised by a pi extension. `notify` requests carry free-form
/// text and may arrive at any time, including between prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionUiRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(rename = "notifyType", default)]
    pub notify_type: Option<String>,
}

impl ExtensionUiRequest {
    pub fn is_notify(&self) -> bool {
        self.method == "notify"
    }
}

// ============================================================================
// Parsed message from stdout (can be response or event)
// ============================================================================

/// Message received from pi stdout - either a response or an event.
#[derive(Debug, Clone)]
pub enum PiMessage {
    Response(PiResponse),
    Event(PiEvent),
}

impl PiMessage {
    /// Parse a JSON line from pi stdout.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(line)?;

        if let Some(msg_type) = value.get("type").and_then(|v| v.as_str())
            && msg_type == "response"
        {
            let response: PiResponse = serde_json::from_value(value)?;
            return Ok(PiMessage::Response(response));
        }

        let event: PiEvent = serde_json::from_value(value)?;
        Ok(PiMessage::Event(event))
    }
}
