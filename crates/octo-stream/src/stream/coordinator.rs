//! Per-request stream driver.
//!
//! One driver task per request pulls raw events from the agent session,
//! translates them, feeds the persister and the subagent tracker, and writes
//! outbound events to a bounded channel consumed by the transport.
//!
//! Agent events are pumped off the session's broadcast channel by a separate
//! task, so a slow consumer only backpressures the outbound side and never
//! makes the driver skip agent events. Every outbound write is bounded by the
//! stream deadline.

use futures::FutureExt;
use log::{debug, error, info, warn};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

use super::config::StreamConfig;
use super::persister::{IncrementalPersister, derive_title};
use super::StreamError;
use crate::canon::{DonePayload, OutboundEvent, StreamEvent, translate};
use crate::chat::ChatStore;
use crate::pi::{PiEvent, SessionHandle, SessionRegistry, StreamGuard};
use crate::subagent::SubagentTracker;

pub const RESPONSE_TIMED_OUT: &str = "Response timed out";
pub const RESPONSE_TOO_LONG: &str = "Response too long";
pub const EVENTS_LOST: &str = "Agent events were lost";

const OUTBOUND_BUFFER: usize = 64;

/// Outbound events of one streaming request.
pub type EventStream = ReceiverStream<OutboundEvent>;

/// Why a stream ended. Exactly one is recorded per stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalReason {
    Completed,
    TimedOut,
    TooLong,
    RuntimeFailed,
    /// The client went away; the reply was drained to its end regardless.
    Disconnected,
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::TimedOut => write!(f, "timed out"),
            Self::TooLong => write!(f, "too long"),
            Self::RuntimeFailed => write!(f, "runtime failed"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Opens streams for conversations.
#[derive(Clone)]
pub struct StreamCoordinator {
    store: Arc<dyn ChatStore>,
    registry: Arc<SessionRegistry>,
    config: StreamConfig,
}

impl StreamCoordinator {
    pub fn new(
        store: Arc<dyn ChatStore>,
        registry: Arc<SessionRegistry>,
        config: StreamConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Answer the latest user message of a conversation.
    ///
    /// Every check that can fail happens here, before the caller commits to a
    /// response. After this returns, failures arrive as `error` events.
    pub async fn start(&self, conversation_id: &str) -> Result<EventStream, StreamError> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| StreamError::ConversationNotFound(conversation_id.to_string()))?;

        let prompt = self
            .store
            .last_user_message(conversation_id)
            .await?
            .ok_or_else(|| StreamError::NoUserMessage(conversation_id.to_string()))?;

        let handle = self.registry.get_or_create(conversation_id).await?;
        let guard = handle
            .try_begin_stream()
            .ok_or_else(|| StreamError::AlreadyStreaming(conversation_id.to_string()))?;

        let title = conversation
            .title
            .as_deref()
            .is_none_or(|t| t.trim().is_empty())
            .then(|| derive_title(&prompt.content, self.config.title_max_chars));

        let persister = IncrementalPersister::new(
            Arc::clone(&self.store),
            conversation_id,
            self.config.flush_interval(),
        )
        .with_title(title);

        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let run = StreamRun {
            conversation_id: conversation_id.to_string(),
            store: Arc::clone(&self.store),
            tracker: self.registry.tracker().clone(),
            config: self.config.clone(),
            tx,
            deadline: Instant::now() + self.config.max_duration(),
            disconnected: false,
            response_chars: 0,
        };

        info!("Streaming reply for {}", conversation_id);
        tokio::spawn(run.drive(guard, prompt.content, persister));

        Ok(ReceiverStream::new(rx))
    }
}

/// State of one streaming request.
struct StreamRun {
    conversation_id: String,
    store: Arc<dyn ChatStore>,
    tracker: SubagentTracker,
    config: StreamConfig,
    tx: mpsc::Sender<OutboundEvent>,
    deadline: Instant,
    disconnected: bool,
    response_chars: usize,
}

impl StreamRun {
    async fn drive(
        mut self,
        guard: StreamGuard,
        prompt: String,
        mut persister: IncrementalPersister,
    ) -> TerminalReason {
        let handle = Arc::clone(guard.handle());
        let (sink, notifications) = mpsc::unbounded_channel();
        handle.attach_sink(sink).await;

        let outcome = AssertUnwindSafe(self.run(&handle, &prompt, &mut persister, notifications))
            .catch_unwind()
            .await;

        let mut reason = match outcome {
            Ok(reason) => reason,
            Err(_) => {
                error!("Stream for {} panicked", self.conversation_id);
                self.emit(StreamEvent::error("Internal error")).await;
                TerminalReason::RuntimeFailed
            }
        };
        if self.disconnected && reason == TerminalReason::Completed {
            reason = TerminalReason::Disconnected;
        }

        // Runs on every path, panics included.
        let message = persister.finalize(reason == TerminalReason::Completed).await;
        if reason == TerminalReason::Completed {
            match message {
                Some(message) => {
                    self.send(OutboundEvent::Done(DonePayload { message }))
                        .await;
                }
                None => self.emit(StreamEvent::error("Failed to save response")).await,
            }
        }

        handle.detach_sink().await;
        drop(guard);

        info!(
            "Stream for {} ended: {} ({} chars)",
            self.conversation_id, reason, self.response_chars
        );
        reason
    }

    async fn run(
        &mut self,
        handle: &Arc<SessionHandle>,
        prompt: &str,
        persister: &mut IncrementalPersister,
        mut notifications: mpsc::UnboundedReceiver<StreamEvent>,
    ) -> TerminalReason {
        let deadline = self.deadline;

        let events =
            match tokio::time::timeout_at(deadline, handle.send_message(prompt)).await {
                Ok(Ok(events)) => events,
                Ok(Err(e)) => {
                    warn!("Prompt failed for {}: {:#}", self.conversation_id, e);
                    self.emit(StreamEvent::error(format!("Agent error: {:#}", e)))
                        .await;
                    return TerminalReason::RuntimeFailed;
                }
                Err(_) => return self.time_out(handle, persister).await,
            };

        let mut events = pump_events(events);
        let timer = tokio::time::sleep_until(deadline);
        tokio::pin!(timer);
        let transport = self.tx.clone();

        loop {
            tokio::select! {
                biased;

                _ = &mut timer => return self.time_out(handle, persister).await,

                _ = transport.closed(), if !self.disconnected => {
                    info!("Client left stream for {}, draining", self.conversation_id);
                    self.disconnected = true;
                    persister.force_flush().await;
                }

                received = events.recv() => match received {
                    Some(Pumped::Event(raw)) => {
                        let Some(event) = translate(&raw) else {
                            continue;
                        };
                        if let Some(reason) = self.dispatch(event, handle, persister).await {
                            return reason;
                        }
                    }
                    Some(Pumped::Lost(skipped)) => {
                        error!(
                            "Stream for {} lost {} agent events",
                            self.conversation_id, skipped
                        );
                        persister.force_flush().await;
                        self.emit(StreamEvent::error(EVENTS_LOST)).await;
                        abort_agent(handle);
                        return TerminalReason::RuntimeFailed;
                    }
                    None => {
                        persister.force_flush().await;
                        self.emit(StreamEvent::error("Agent session ended unexpectedly"))
                            .await;
                        return TerminalReason::RuntimeFailed;
                    }
                },

                Some(event) = notifications.recv() => self.emit(event).await,
            }
        }
    }

    /// Apply one canonical event. Returns the terminal reason if it ends the
    /// stream.
    async fn dispatch(
        &mut self,
        event: StreamEvent,
        handle: &Arc<SessionHandle>,
        persister: &mut IncrementalPersister,
    ) -> Option<TerminalReason> {
        match event {
            StreamEvent::Text { content } => {
                let chars = content.chars().count();
                if self.response_chars + chars > self.config.max_response_chars {
                    warn!(
                        "Reply for {} exceeds {} chars",
                        self.conversation_id, self.config.max_response_chars
                    );
                    persister.force_flush().await;
                    self.emit(StreamEvent::error(RESPONSE_TOO_LONG)).await;
                    abort_agent(handle);
                    return Some(TerminalReason::TooLong);
                }
                self.response_chars += chars;
                persister.on_text_delta(&content).await;
                self.emit(StreamEvent::Text { content }).await;
            }

            // The durable text must not lag behind a tool's side effects.
            StreamEvent::ToolStart { .. } | StreamEvent::SubagentSpawn { .. } => {
                persister.force_flush().await;
                self.tracker.on_event(&self.conversation_id, &event).await;
                self.emit(event).await;
            }

            StreamEvent::SubagentResult { .. } => {
                self.tracker.on_event(&self.conversation_id, &event).await;
                self.emit(event).await;
            }

            StreamEvent::CompactionEnd { aborted, .. } => {
                if !aborted
                    && let Err(e) = self
                        .store
                        .increment_compaction_count(&self.conversation_id)
                        .await
                {
                    warn!(
                        "Failed to count compaction for {}: {:#}",
                        self.conversation_id, e
                    );
                }
                self.emit(event).await;
            }

            StreamEvent::Error { error } => {
                warn!("Agent error in {}: {}", self.conversation_id, error);
                persister.force_flush().await;
                self.emit(StreamEvent::Error { error }).await;
                return Some(TerminalReason::RuntimeFailed);
            }

            StreamEvent::Completion { content, .. } => {
                if let Some(content) = content {
                    persister.seed_if_empty(&content);
                }
                return Some(TerminalReason::Completed);
            }

            StreamEvent::AgentEnd => return Some(TerminalReason::Completed),

            StreamEvent::AgentStart => debug!("Agent started for {}", self.conversation_id),

            other => self.emit(other).await,
        }
        None
    }

    async fn time_out(
        &mut self,
        handle: &Arc<SessionHandle>,
        persister: &mut IncrementalPersister,
    ) -> TerminalReason {
        warn!(
            "Stream for {} hit the {}s limit",
            self.conversation_id, self.config.max_duration_secs
        );
        persister.force_flush().await;
        self.emit(StreamEvent::error(RESPONSE_TIMED_OUT)).await;
        abort_agent(handle);
        TerminalReason::TimedOut
    }

    async fn emit(&mut self, event: StreamEvent) {
        self.send(OutboundEvent::Event(event)).await;
    }

    /// Writes are skipped once the client is gone; a failed send is picked
    /// up by the close watcher on the next iteration.
    ///
    /// A write never outlives the deadline. Past it, an event is only
    /// delivered if the buffer has room; the expired timer then ends the
    /// stream on the next iteration.
    async fn send(&mut self, event: OutboundEvent) {
        if self.disconnected {
            return;
        }
        match tokio::time::timeout_at(self.deadline, self.tx.send(event)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!("Dropped {} event, transport closed", self.conversation_id),
            Err(_) => debug!(
                "Dropped {} event, transport stalled past the deadline",
                self.conversation_id
            ),
        }
    }
}

/// Item read off the session's broadcast channel.
enum Pumped {
    Event(PiEvent),
    /// The pump itself fell behind the runtime.
    Lost(u64),
}

/// Move agent events into an unbounded queue owned by this stream.
///
/// The pump ends when the session closes or the stream drops the queue.
fn pump_events(mut events: broadcast::Receiver<PiEvent>) -> mpsc::UnboundedReceiver<Pumped> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                _ = tx.closed() => return,
                received = events.recv() => match received {
                    Ok(event) => Pumped::Event(event),
                    Err(RecvError::Lagged(skipped)) => Pumped::Lost(skipped),
                    Err(RecvError::Closed) => return,
                },
            };
            if tx.send(item).is_err() {
                return;
            }
        }
    });
    rx
}

/// Stop the agent in the background so cleanup is not held up.
fn abort_agent(handle: &Arc<SessionHandle>) {
    let handle = Arc::clone(handle);
    tokio::spawn(async move {
        if let Err(e) = handle.process().abort().await {
            debug!("Abort of {} failed: {:#}", handle.conversation_id(), e);
        }
    });
}
