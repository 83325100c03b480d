//! Per-conversation agent sessions.
//!
//! The registry is owned by the server state and injected where needed.
//! Each conversation id maps to a slot guarded by its own async mutex, so
//! concurrent requests for a new conversation create exactly one process
//! while requests for other conversations proceed independently.

use anyhow::{Context, Result};
use dashmap::DashMap;
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, broadcast, mpsc};

use super::runtime::{NotifyHandler, PiProcess, PiRuntime, PiSpawnConfig};
use super::types::PiEvent;
use crate::canon::StreamEvent;
use crate::subagent::SubagentTracker;

type Slot = Arc<Mutex<Option<Arc<SessionHandle>>>>;

/// Live agent session for one conversation.
pub struct SessionHandle {
    conversation_id: String,
    process: Box<dyn PiProcess>,
    /// Sink of the stream currently attached, if any.
    live_sink: Mutex<Option<mpsc::UnboundedSender<StreamEvent>>>,
    streaming: AtomicBool,
}

impl SessionHandle {
    fn new(conversation_id: String, process: Box<dyn PiProcess>) -> Self {
        Self {
            conversation_id,
            process,
            live_sink: Mutex::new(None),
            streaming: AtomicBool::new(false),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn process(&self) -> &dyn PiProcess {
        self.process.as_ref()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    /// Claim the session for one stream. `None` if another stream holds it.
    pub fn try_begin_stream(self: &Arc<Self>) -> Option<StreamGuard> {
        self.streaming
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| StreamGuard {
                handle: Arc::clone(self),
            })
    }

    /// Subscribe to the event feed, then send the prompt.
    pub async fn send_message(&self, text: &str) -> Result<broadcast::Receiver<PiEvent>> {
        let events = self.process.subscribe();
        self.process.prompt(text).await?;
        Ok(events)
    }

    pub async fn attach_sink(&self, sink: mpsc::UnboundedSender<StreamEvent>) {
        *self.live_sink.lock().await = Some(sink);
    }

    pub async fn detach_sink(&self) {
        self.live_sink.lock().await.take();
    }

    /// Push an out-of-band event to the attached stream, if any.
    pub async fn forward(&self, event: StreamEvent) -> bool {
        match self.live_sink.lock().await.as_ref() {
            Some(sink) => sink.send(event).is_ok(),
            None => false,
        }
    }
}

/// Releases the streaming claim on drop.
pub struct StreamGuard {
    handle: Arc<SessionHandle>,
}

impl StreamGuard {
    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.handle.streaming.store(false, Ordering::Release);
    }
}

/// Registry of live agent sessions keyed by conversation id.
pub struct SessionRegistry {
    runtime: Arc<dyn PiRuntime>,
    spawn_config: PiSpawnConfig,
    sessions_dir: Option<PathBuf>,
    tracker: SubagentTracker,
    slots: DashMap<String, Slot>,
}

impl SessionRegistry {
    pub fn new(
        runtime: Arc<dyn PiRuntime>,
        spawn_config: PiSpawnConfig,
        tracker: SubagentTracker,
    ) -> Self {
        Self {
            runtime,
            spawn_config,
            sessions_dir: None,
            tracker,
            slots: DashMap::new(),
        }
    }

    /// Persist each conversation's pi session under this directory.
    pub fn with_sessions_dir(mut self, dir: PathBuf) -> Self {
        self.sessions_dir = Some(dir);
        self
    }

    pub fn tracker(&self) -> &SubagentTracker {
        &self.tracker
    }

    fn slot(&self, conversation_id: &str) -> Slot {
        self.slots
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }

    /// Existing session, without creating one.
    pub async fn get(&self, conversation_id: &str) -> Option<Arc<SessionHandle>> {
        let slot = self.slots.get(conversation_id)?.clone();
        let guard = slot.lock().await;
        guard.clone()
    }

    /// Existing session or a freshly spawned one.
    pub async fn get_or_create(&self, conversation_id: &str) -> Result<Arc<SessionHandle>> {
        let slot = self.slot(conversation_id);
        let mut guard = slot.lock().await;
        if let Some(handle) = guard.as_ref() {
            return Ok(Arc::clone(handle));
        }

        let handle = self.create(conversation_id).await?;
        *guard = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Prompt the conversation's session, creating it if needed.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<broadcast::Receiver<PiEvent>> {
        let handle = self.get_or_create(conversation_id).await?;
        handle.send_message(text).await
    }

    /// Shut down and forget a session. Returns `false` if none existed.
    pub async fn dispose(&self, conversation_id: &str) -> Result<bool> {
        let Some((_, slot)) = self.slots.remove(conversation_id) else {
            return Ok(false);
        };
        let Some(handle) = slot.lock().await.take() else {
            return Ok(false);
        };

        handle.detach_sink().await;
        handle
            .process
            .shutdown()
            .await
            .with_context(|| format!("shutting down session {}", conversation_id))?;
        info!("Disposed agent session for {}", conversation_id);
        Ok(true)
    }

    /// Ids of conversations with a live session.
    pub async fn active_ids(&self) -> Vec<String> {
        let slots: Vec<(String, Slot)> = self
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut ids = Vec::new();
        for (id, slot) in slots {
            if slot.lock().await.is_some() {
                ids.push(id);
            }
        }
        ids.sort();
        ids
    }

    /// Dispose every session.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.dispose(&id).await {
                warn!("{:#}", e);
            }
        }
    }

    async fn create(&self, conversation_id: &str) -> Result<Arc<SessionHandle>> {
        let mut config = self.spawn_config.clone();
        if let Some(ref dir) = self.sessions_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating sessions dir: {}", dir.display()))?;
            config.session_file = Some(dir.join(format!("{}.jsonl", file_stem(conversation_id))));
        }

        let process = self
            .runtime
            .spawn(config)
            .await
            .with_context(|| format!("starting agent session for {}", conversation_id))?;

        let handle = Arc::new(SessionHandle::new(conversation_id.to_string(), process));
        handle
            .process
            .set_notify_handler(self.notify_handler(Arc::downgrade(&handle)))
            .await;

        info!("Created agent session for {}", conversation_id);
        Ok(handle)
    }

    /// Notifications are written to storage first, then forwarded to the
    /// stream attached at that moment.
    fn notify_handler(&self, handle: Weak<SessionHandle>) -> NotifyHandler {
        let tracker = self.tracker.clone();
        Arc::new(move |text: String| {
            let tracker = tracker.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                let Some(event) = tracker.on_notification(&text).await else {
                    return;
                };
                let forwarded = match handle.upgrade() {
                    Some(handle) => handle.forward(event).await,
                    None => false,
                };
                if forwarded {
                    debug!("Forwarded subagent verdict to live stream");
                } else {
                    debug!("No live stream for subagent verdict");
                }
            });
        })
    }
}

fn file_stem(conversation_id: &str) -> String {
    conversation_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
