//! Pi event to canonical event translation.

use serde_json::Value;

use super::events::StreamEvent;
use super::patterns::{self, parse_notification, parse_spawn_result};
use crate::pi::{AssistantMessageEvent, PiEvent};

/// Tool whose calls are tracked as subagents.
pub const SPAWN_AGENT_TOOL: &str = "spawn_agent";

const DEFAULT_TIER: &str = "default";

/// Map one raw pi event to at most one canonical event.
pub fn translate(event: &PiEvent) -> Option<StreamEvent> {
    match event {
        PiEvent::AgentStart => Some(StreamEvent::AgentStart),
        PiEvent::AgentEnd { .. } => Some(StreamEvent::AgentEnd),

        PiEvent::MessageUpdate {
            message,
            assistant_message_event,
        } => match assistant_message_event {
            AssistantMessageEvent::TextDelta { delta, .. } if !delta.is_empty() => {
                Some(StreamEvent::Text {
                    content: delta.clone(),
                })
            }
            AssistantMessageEvent::Done { reason } if reason == "stop" || reason == "length" => {
                let content = flatten_tool_result(&message.content);
                Some(StreamEvent::Completion {
                    stop_reason: reason.clone(),
                    content: (!content.is_empty()).then_some(content),
                })
            }
            AssistantMessageEvent::Error { reason } => Some(StreamEvent::Error {
                error: message
                    .error_message
                    .clone()
                    .unwrap_or_else(|| format!("Agent error: {}", reason)),
            }),
            _ => None,
        },

        PiEvent::ToolExecutionStart {
            tool_call_id,
            tool_name,
            args,
        } => {
            if tool_name == SPAWN_AGENT_TOOL {
                Some(StreamEvent::SubagentSpawn {
                    tool_call_id: tool_call_id.clone(),
                    description: first_string(args, &["description", "task", "prompt"])
                        .unwrap_or_default(),
                    tier: first_string(args, &["tier", "model"])
                        .unwrap_or_else(|| DEFAULT_TIER.to_string()),
                })
            } else {
                Some(StreamEvent::ToolStart {
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    args: args.clone(),
                })
            }
        }

        PiEvent::ToolExecutionUpdate {
            tool_call_id,
            tool_name,
            partial_result,
            ..
        } if tool_name == SPAWN_AGENT_TOOL => {
            let lines: Vec<String> = flatten_tool_result(partial_result)
                .lines()
                .map(str::trim_end)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect();
            (!lines.is_empty()).then(|| StreamEvent::SubagentOutput {
                tool_call_id: Some(tool_call_id.clone()),
                lines,
            })
        }

        PiEvent::ToolExecutionEnd {
            tool_call_id,
            tool_name,
            result,
            is_error,
        } => {
            if tool_name == SPAWN_AGENT_TOOL {
                let info = parse_spawn_result(&flatten_tool_result(result));
                let status = if *is_error {
                    Some(patterns::normalize_status("failed"))
                } else {
                    info.status
                };
                Some(StreamEvent::SubagentResult {
                    tool_call_id: tool_call_id.clone(),
                    task_id: info.task_id,
                    status,
                })
            } else {
                Some(StreamEvent::ToolEnd {
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    is_error: *is_error,
                })
            }
        }

        PiEvent::AutoCompactionStart { reason } => Some(StreamEvent::CompactionStart {
            reason: reason.clone(),
        }),
        PiEvent::AutoCompactionEnd {
            aborted,
            error_message,
            ..
        } => Some(StreamEvent::CompactionEnd {
            aborted: *aborted,
            error: error_message.clone(),
        }),

        PiEvent::AutoRetryEnd {
            success: false,
            final_error,
            ..
        } => Some(StreamEvent::Error {
            error: final_error
                .clone()
                .unwrap_or_else(|| "Retries exhausted".to_string()),
        }),
        PiEvent::HookError { error, .. } | PiEvent::ExtensionError { error } => {
            Some(StreamEvent::Error {
                error: error.clone(),
            })
        }

        PiEvent::TurnStart
        | PiEvent::TurnEnd { .. }
        | PiEvent::MessageStart { .. }
        | PiEvent::MessageEnd { .. }
        | PiEvent::ToolExecutionUpdate { .. }
        | PiEvent::ExtensionUiRequest(_)
        | PiEvent::AutoRetryStart { .. }
        | PiEvent::AutoRetryEnd { .. }
        | PiEvent::Unknown => None,
    }
}

/// Map out-of-band notification text to a `subagent_complete` event.
///
/// The description is the text following the verdict line; callers that know
/// the subagent record may replace it.
pub fn translate_notification(text: &str) -> Option<StreamEvent> {
    let verdict = parse_notification(text)?;
    Some(StreamEvent::SubagentComplete {
        task_id: verdict.task_id,
        description: verdict.output.unwrap_or_default(),
        success: verdict.success,
    })
}

/// Flatten a tool result of any shape into plain text.
///
/// Accepts a string, a `{ content: [...] }` envelope, or a bare list of
/// parts where only `text` parts contribute. Other JSON is stringified.
pub fn flatten_tool_result(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(text) => Some(text.clone()),
                Value::Object(obj) => {
                    let is_text = obj
                        .get("type")
                        .and_then(|t| t.as_str())
                        .is_none_or(|t| t == "text");
                    if is_text {
                        obj.get("text").and_then(|t| t.as_str()).map(String::from)
                    } else {
                        None
                    }
                }
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(obj) => match obj.get("content") {
            Some(content @ (Value::Array(_) | Value::String(_))) => flatten_tool_result(content),
            _ => match obj.get("text").and_then(|t| t.as_str()) {
                Some(text) => text.to_string(),
                None => value.to_string(),
            },
        },
        other => other.to_string(),
    }
}

fn first_string(args: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| args.get(*key).and_then(|v| v.as_str()))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pi::{AgentMessage, PiMessage};
    use serde_json::json;

    fn event(value: Value) -> PiEvent {
        match PiMessage::parse(&value.to_string()).unwrap() {
            PiMessage::Event(event) => event,
            PiMessage::Response(r) => panic!("expected event, got {:?}", r),
        }
    }

    #[test]
    fn test_text_delta() {
        let e = event(json!({
            "type": "message_update",
            "message": {"role": "assistant", "content": []},
            "assistantMessageEvent": {"type": "text_delta", "contentIndex": 0, "delta": "Hel", "partial": {}}
        }));
        assert_eq!(
            translate(&e),
            Some(StreamEvent::Text {
                content: "Hel".into()
            })
        );
    }

    #[test]
    fn test_done_reasons() {
        let done = |reason: &str| {
            event(json!({
                "type": "message_update",
                "message": {"role": "assistant", "content": [{"type": "text", "text": "All done"}]},
                "assistantMessageEvent": {"type": "done", "reason": reason}
            }))
        };
        assert_eq!(
            translate(&done("stop")),
            Some(StreamEvent::Completion {
                stop_reason: "stop".into(),
                content: Some("All done".into())
            })
        );
        assert!(matches!(
            translate(&done("length")),
            Some(StreamEvent::Completion { .. })
        ));
        assert_eq!(translate(&done("toolUse")), None);
    }

    #[test]
    fn test_spawn_agent_lifecycle() {
        let start = event(json!({
            "type": "tool_execution_start",
            "toolCallId": "call-1",
            "toolName": "spawn_agent",
            "args": {"task": "Mock task", "model": "fast"}
        }));
        assert_eq!(
            translate(&start),
            Some(StreamEvent::SubagentSpawn {
                tool_call_id: "call-1".into(),
                description: "Mock task".into(),
                tier: "fast".into()
            })
        );

        let end = event(json!({
            "type": "tool_execution_end",
            "toolCallId": "call-1",
            "toolName": "spawn_agent",
            "result": {"content": [{"type": "text", "text": "Agent spawned: task-123 — Mock task (...)\nStatus: running"}]},
            "isError": false
        }));
        assert_eq!(
            translate(&end),
            Some(StreamEvent::SubagentResult {
                tool_call_id: "call-1".into(),
                task_id: Some("task-123".into()),
                status: Some("running".into())
            })
        );
    }

    #[test]
    fn test_spawn_agent_failure_and_parse_miss() {
        let end = event(json!({
            "type": "tool_execution_end",
            "toolCallId": "call-2",
            "toolName": "spawn_agent",
            "result": "quota exceeded",
            "isError": true
        }));
        assert_eq!(
            translate(&end),
            Some(StreamEvent::SubagentResult {
                tool_call_id: "call-2".into(),
                task_id: None,
                status: Some("failed".into())
            })
        );

        let start = event(json!({
            "type": "tool_execution_start",
            "toolCallId": "call-3",
            "toolName": "spawn_agent",
            "args": 17
        }));
        assert_eq!(
            translate(&start),
            Some(StreamEvent::SubagentSpawn {
                tool_call_id: "call-3".into(),
                description: String::new(),
                tier: "default".into()
            })
        );
    }

    #[test]
    fn test_regular_tools() {
        let start = event(json!({
            "type": "tool_execution_start",
            "toolCallId": "c9",
            "toolName": "bash",
            "args": {"command": "ls"}
        }));
        assert!(matches!(translate(&start), Some(StreamEvent::ToolStart { .. })));

        let update = event(json!({
            "type": "tool_execution_update",
            "toolCallId": "c9",
            "toolName": "bash",
            "args": {},
            "partialResult": "file"
        }));
        assert_eq!(translate(&update), None);
    }

    #[test]
    fn test_subagent_output_lines() {
        let update = event(json!({
            "type": "tool_execution_update",
            "toolCallId": "call-1",
            "toolName": "spawn_agent",
            "args": {},
            "partialResult": {"content": [{"type": "text", "text": "step 1\n\nstep 2\n"}]}
        }));
        assert_eq!(
            translate(&update),
            Some(StreamEvent::SubagentOutput {
                tool_call_id: Some("call-1".into()),
                lines: vec!["step 1".into(), "step 2".into()]
            })
        );
    }

    #[test]
    fn test_lifecycle_and_errors() {
        assert_eq!(translate(&PiEvent::AgentStart), Some(StreamEvent::AgentStart));
        assert_eq!(
            translate(&PiEvent::AgentEnd { messages: vec![] }),
            Some(StreamEvent::AgentEnd)
        );
        assert_eq!(translate(&PiEvent::TurnStart), None);
        assert_eq!(translate(&PiEvent::Unknown), None);

        let compaction = event(json!({
            "type": "auto_compaction_end",
            "result": null,
            "aborted": true,
            "willRetry": false,
            "errorMessage": "too small"
        }));
        assert_eq!(
            translate(&compaction),
            Some(StreamEvent::CompactionEnd {
                aborted: true,
                error: Some("too small".into())
            })
        );

        let retry = event(json!({"type": "auto_retry_end", "success": false, "attempt": 3}));
        assert_eq!(translate(&retry), Some(StreamEvent::error("Retries exhausted")));

        let ok_retry = event(json!({"type": "auto_retry_end", "success": true, "attempt": 1}));
        assert_eq!(translate(&ok_retry), None);

        let message_error = PiEvent::MessageUpdate {
            message: AgentMessage {
                error_message: Some("overloaded".into()),
                ..AgentMessage::default()
            },
            assistant_message_event: AssistantMessageEvent::Error {
                reason: "error".into(),
            },
        };
        assert_eq!(translate(&message_error), Some(StreamEvent::error("overloaded")));
    }

    #[test]
    fn test_flatten_shapes() {
        assert_eq!(flatten_tool_result(&json!("plain")), "plain");
        assert_eq!(
            flatten_tool_result(&json!({"content": [
                {"type": "text", "text": "a"},
                {"type": "image", "data": "..."},
                {"type": "text", "text": "b"}
            ]})),
            "a\nb"
        );
        assert_eq!(flatten_tool_result(&json!(["x", {"text": "y"}])), "x\ny");
        assert_eq!(flatten_tool_result(&json!({"text": "t"})), "t");
        assert_eq!(flatten_tool_result(&json!({"ok": true})), r#"{"ok":true}"#);
        assert_eq!(flatten_tool_result(&json!(42)), "42");
        assert_eq!(flatten_tool_result(&Value::Null), "");
    }

    #[test]
    fn test_translate_notification() {
        assert_eq!(
            translate_notification("✅ Agent completed: task-999\nDid the thing"),
            Some(StreamEvent::SubagentComplete {
                task_id: "task-999".into(),
                description: "Did the thing".into(),
                success: true
            })
        );
        assert_eq!(translate_notification("Compaction finished"), None);
    }
}
