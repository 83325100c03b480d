//! Test utilities and common setup.
#![allow(dead_code)]

use anyhow::{Result, bail};
use async_trait::async_trait;
use axum::Router;
use octo_stream::api::{self, AppState};
use octo_stream::canon::{OutboundEvent, StreamEvent};
use octo_stream::chat::{
    ChatStore, CreateConversation, Message, MessageRole, SqliteChatStore, Subagent,
};
use octo_stream::db::Database;
use octo_stream::pi::{
    NotifyHandler, PiCommand, PiEvent, PiProcess, PiResponse, PiRuntime, PiSpawnConfig,
    SessionRegistry,
};
use octo_stream::stream::{EventStream, StreamConfig, StreamCoordinator};
use octo_stream::subagent::SubagentTracker;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio_stream::StreamExt;

/// One step of a scripted agent reply.
#[derive(Debug, Clone)]
pub enum Step {
    Event(PiEvent),
    /// Out-of-band notify request.
    Notify(String),
    Sleep(Duration),
}

/// Reply script for one prompt.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub steps: Vec<Step>,
    /// Reject the prompt command itself.
    pub reject: bool,
}

impl Script {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            reject: false,
        }
    }

    pub fn rejected() -> Self {
        Self {
            steps: Vec::new(),
            reject: true,
        }
    }
}

type NotifySlot = Arc<RwLock<Option<NotifyHandler>>>;

/// Agent runtime whose processes play back scripts, one per prompt.
#[derive(Default)]
pub struct ScriptedRuntime {
    scripts: Arc<Mutex<VecDeque<Script>>>,
    notify_slots: Mutex<Vec<NotifySlot>>,
    spawns: AtomicUsize,
    aborts: Arc<AtomicUsize>,
}

impl ScriptedRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the reply to the next prompt.
    pub async fn push_script(&self, script: Script) {
        self.scripts.lock().await.push_back(script);
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    /// Deliver a notification through every spawned process, as pi would
    /// at any time after a background task finishes.
    pub async fn notify(&self, text: &str) {
        for slot in self.notify_slots.lock().await.iter() {
            if let Some(handler) = slot.read().await.clone() {
                handler(text.to_string());
            }
        }
    }
}

#[async_trait]
impl PiRuntime for ScriptedRuntime {
    async fn spawn(&self, _config: PiSpawnConfig) -> Result<Box<dyn PiProcess>> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        let (events, _) = broadcast::channel(4096);
        let notify: NotifySlot = Arc::new(RwLock::new(None));
        self.notify_slots.lock().await.push(Arc::clone(&notify));

        Ok(Box::new(ScriptedProcess {
            scripts: Arc::clone(&self.scripts),
            events,
            notify,
            aborted: Arc::new(AtomicBool::new(false)),
            aborts: Arc::clone(&self.aborts),
        }))
    }
}

struct ScriptedProcess {
    scripts: Arc<Mutex<VecDeque<Script>>>,
    events: broadcast::Sender<PiEvent>,
    notify: NotifySlot,
    aborted: Arc<AtomicBool>,
    aborts: Arc<AtomicUsize>,
}

fn response(command: &str, success: bool) -> PiResponse {
    PiResponse {
        response_type: "response".to_string(),
        command: command.to_string(),
        success,
        id: None,
        data: None,
        error: (!success).then(|| "rejected by script".to_string()),
    }
}

#[async_trait]
impl PiProcess for ScriptedProcess {
    async fn send_command(&self, command: PiCommand) -> Result<PiResponse> {
        match command {
            PiCommand::Prompt { .. } => {
                let Some(script) = self.scripts.lock().await.pop_front() else {
                    bail!("no script queued");
                };
                if script.reject {
                    return Ok(response("prompt", false));
                }

                self.aborted.store(false, Ordering::SeqCst);
                let events = self.events.clone();
                let notify = Arc::clone(&self.notify);
                let aborted = Arc::clone(&self.aborted);
                tokio::spawn(async move {
                    for step in script.steps {
                        if aborted.load(Ordering::SeqCst) {
                            break;
                        }
                        match step {
                            Step::Event(event) => {
                                let _ = events.send(event);
                                tokio::task::yield_now().await;
                            }
                            Step::Notify(text) => {
                                if let Some(handler) = notify.read().await.clone() {
                                    handler(text);
                                }
                            }
                            Step::Sleep(duration) => tokio::time::sleep(duration).await,
                        }
                    }
                });
                Ok(response("prompt", true))
            }
            PiCommand::Abort { .. } => {
                self.aborted.store(true, Ordering::SeqCst);
                self.aborts.fetch_add(1, Ordering::SeqCst);
                Ok(response("abort", true))
            }
            other => Ok(response(other.name(), true)),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<PiEvent> {
        self.events.subscribe()
    }

    async fn set_notify_handler(&self, handler: NotifyHandler) {
        *self.notify.write().await = Some(handler);
    }
}

// ========== Raw event builders ==========

fn event(value: Value) -> Step {
    Step::Event(serde_json::from_value(value).unwrap())
}

pub fn agent_start() -> Step {
    event(json!({ "type": "agent_start" }))
}

pub fn agent_end() -> Step {
    event(json!({ "type": "agent_end", "messages": [] }))
}

pub fn text_delta(delta: &str) -> Step {
    event(json!({
        "type": "message_update",
        "message": { "role": "assistant", "content": [] },
        "assistantMessageEvent": { "type": "text_delta", "contentIndex": 0, "delta": delta }
    }))
}

pub fn done(reason: &str) -> Step {
    event(json!({
        "type": "message_update",
        "message": { "role": "assistant", "content": [] },
        "assistantMessageEvent": { "type": "done", "reason": reason }
    }))
}

/// Final message event whose message carries the whole reply.
pub fn done_with_text(reason: &str, text: &str) -> Step {
    event(json!({
        "type": "message_update",
        "message": { "role": "assistant", "content": [ { "type": "text", "text": text } ] },
        "assistantMessageEvent": { "type": "done", "reason": reason }
    }))
}

pub fn message_error(reason: &str, error_message: &str) -> Step {
    event(json!({
        "type": "message_update",
        "message": { "role": "assistant", "content": [], "errorMessage": error_message },
        "assistantMessageEvent": { "type": "error", "reason": reason }
    }))
}

pub fn tool_start(tool_call_id: &str, tool_name: &str, args: Value) -> Step {
    event(json!({
        "type": "tool_execution_start",
        "toolCallId": tool_call_id,
        "toolName": tool_name,
        "args": args
    }))
}

pub fn tool_end(tool_call_id: &str, tool_name: &str, result: &str) -> Step {
    event(json!({
        "type": "tool_execution_end",
        "toolCallId": tool_call_id,
        "toolName": tool_name,
        "result": { "content": [ { "type": "text", "text": result } ] },
        "isError": false
    }))
}

pub fn compaction_start(reason: &str) -> Step {
    event(json!({ "type": "auto_compaction_start", "reason": reason }))
}

pub fn compaction_end(aborted: bool) -> Step {
    event(json!({ "type": "auto_compaction_end", "aborted": aborted, "willRetry": false }))
}

pub fn sleep_ms(ms: u64) -> Step {
    Step::Sleep(Duration::from_millis(ms))
}

// ========== Harness ==========

pub struct TestHarness {
    pub store: Arc<dyn ChatStore>,
    pub runtime: Arc<ScriptedRuntime>,
    pub registry: Arc<SessionRegistry>,
    pub coordinator: StreamCoordinator,
    pub db: Database,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_config(test_stream_config()).await
    }

    pub async fn with_config(config: StreamConfig) -> Self {
        let db = Database::in_memory().await.unwrap();
        let store: Arc<dyn ChatStore> = Arc::new(SqliteChatStore::new(db.clone()));
        let runtime = ScriptedRuntime::new();
        let tracker = SubagentTracker::new(Arc::clone(&store));
        let registry = Arc::new(SessionRegistry::new(
            runtime.clone(),
            PiSpawnConfig::default(),
            tracker,
        ));
        let coordinator =
            StreamCoordinator::new(Arc::clone(&store), Arc::clone(&registry), config);

        Self {
            store,
            runtime,
            registry,
            coordinator,
            db,
        }
    }

    pub fn router(&self) -> Router {
        let state = AppState::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            self.coordinator.clone(),
        )
        .with_database(self.db.clone());
        api::create_router(state)
    }

    /// Conversation with one user message.
    pub async fn conversation(&self, prompt: &str) -> String {
        let conversation = self
            .store
            .create_conversation(CreateConversation::default())
            .await
            .unwrap();
        self.store
            .create_message(&conversation.id, MessageRole::User, prompt)
            .await
            .unwrap();
        conversation.id
    }

    pub async fn assistant_messages(&self, conversation_id: &str) -> Vec<Message> {
        self.store
            .list_messages(conversation_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.role == "assistant")
            .collect()
    }

    /// Wait until the subagent with this task id satisfies `done`.
    pub async fn wait_for_subagent<F>(&self, task_id: &str, done: F) -> Subagent
    where
        F: Fn(&Subagent) -> bool,
    {
        for _ in 0..200 {
            if let Some(record) = self.store.find_subagent_by_task(task_id).await.unwrap()
                && done(&record)
            {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("subagent {} never reached the expected state", task_id);
    }

    /// Wait until the conversation has no active stream.
    pub async fn wait_until_idle(&self, conversation_id: &str) {
        for _ in 0..500 {
            match self.registry.get(conversation_id).await {
                Some(handle) if handle.is_streaming() => {}
                _ => return,
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("stream for {} never finished", conversation_id);
    }
}

/// Defaults with a short flush interval so timed flushes happen in tests.
pub fn test_stream_config() -> StreamConfig {
    StreamConfig {
        flush_interval_ms: 0,
        ..StreamConfig::default()
    }
}

/// Drain a stream with a safety timeout.
pub async fn collect(stream: EventStream) -> Vec<OutboundEvent> {
    tokio::time::timeout(Duration::from_secs(10), stream.collect::<Vec<_>>())
        .await
        .expect("stream did not finish")
}

pub fn texts(events: &[OutboundEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            OutboundEvent::Event(StreamEvent::Text { content }) => Some(content.clone()),
            _ => None,
        })
        .collect()
}

pub fn errors(events: &[OutboundEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            OutboundEvent::Event(StreamEvent::Error { error }) => Some(error.clone()),
            _ => None,
        })
        .collect()
}

pub fn done_message(events: &[OutboundEvent]) -> Option<Message> {
    events.iter().find_map(|e| match e {
        OutboundEvent::Done(done) => Some(done.message.clone()),
        _ => None,
    })
}

pub fn kinds(events: &[OutboundEvent]) -> Vec<&'static str> {
    events.iter().map(OutboundEvent::kind).collect()
}
