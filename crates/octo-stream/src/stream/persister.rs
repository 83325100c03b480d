//! Incremental persistence of a streaming assistant reply.
//!
//! The in-memory accumulator is the source of truth while a reply streams.
//! The first flush with text creates the assistant message; later flushes
//! overwrite its content. A failed write is logged and retried implicitly by
//! the next flush, since the accumulator is never cleared.

use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::chat::{ChatStore, Message, MessageRole};

/// Where the durable copy of the reply stands.
#[derive(Debug, Clone)]
pub struct PersistenceCursor {
    pub assistant_message_id: Option<String>,
    /// Accumulator length (bytes) covered by the last successful write.
    pub last_flushed_len: usize,
    pub last_flush: Instant,
}

pub struct IncrementalPersister {
    store: Arc<dyn ChatStore>,
    conversation_id: String,
    flush_interval: Duration,
    text: String,
    cursor: PersistenceCursor,
    /// Title applied once the reply's message first exists.
    pending_title: Option<String>,
}

impl IncrementalPersister {
    pub fn new(
        store: Arc<dyn ChatStore>,
        conversation_id: impl Into<String>,
        flush_interval: Duration,
    ) -> Self {
        Self {
            store,
            conversation_id: conversation_id.into(),
            flush_interval,
            text: String::new(),
            cursor: PersistenceCursor {
                assistant_message_id: None,
                last_flushed_len: 0,
                last_flush: Instant::now(),
            },
            pending_title: None,
        }
    }

    /// Set the conversation title when the first reply message is created.
    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.pending_title = title;
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn cursor(&self) -> &PersistenceCursor {
        &self.cursor
    }

    /// Use `content` as the reply when nothing streamed.
    pub fn seed_if_empty(&mut self, content: &str) {
        if self.text.is_empty() {
            self.text.push_str(content);
        }
    }

    /// Append a delta and flush if the interval has elapsed.
    pub async fn on_text_delta(&mut self, delta: &str) {
        self.text.push_str(delta);
        if self.cursor.last_flush.elapsed() >= self.flush_interval {
            self.flush().await;
        }
    }

    /// Flush now, regardless of the interval.
    pub async fn force_flush(&mut self) {
        self.flush().await;
    }

    /// Final flush. Returns the durable message, creating an empty one first
    /// when `ensure_message` is set and nothing was written yet.
    pub async fn finalize(&mut self, ensure_message: bool) -> Option<Message> {
        self.flush().await;

        if self.cursor.assistant_message_id.is_none() && ensure_message {
            self.create().await;
        }

        let id = self.cursor.assistant_message_id.as_deref()?;
        match self.store.get_message(id).await {
            Ok(message) => message,
            Err(e) => {
                warn!("Failed to load assistant message {}: {:#}", id, e);
                None
            }
        }
    }

    async fn flush(&mut self) {
        if self.text.len() == self.cursor.last_flushed_len {
            return;
        }
        // A failed write still waits a full interval before the next timed try.
        self.cursor.last_flush = Instant::now();

        match self.cursor.assistant_message_id.clone() {
            None => self.create().await,
            Some(id) => match self.store.update_message_content(&id, &self.text).await {
                Ok(()) => {
                    self.cursor.last_flushed_len = self.text.len();
                    debug!("Flushed {} bytes to {}", self.text.len(), id);
                }
                Err(e) => warn!("Failed to flush assistant message {}: {:#}", id, e),
            },
        }
    }

    async fn create(&mut self) {
        let created = self
            .store
            .create_message(&self.conversation_id, MessageRole::Assistant, &self.text)
            .await;

        match created {
            Ok(message) => {
                debug!(
                    "Created assistant message {} in {}",
                    message.id, self.conversation_id
                );
                self.cursor.assistant_message_id = Some(message.id);
                self.cursor.last_flushed_len = self.text.len();
                self.apply_title().await;
            }
            Err(e) => warn!(
                "Failed to create assistant message in {}: {:#}",
                self.conversation_id, e
            ),
        }
    }

    async fn apply_title(&mut self) {
        let Some(title) = self.pending_title.take() else {
            return;
        };
        if let Err(e) = self.store.set_title(&self.conversation_id, &title).await {
            warn!("Failed to set title of {}: {:#}", self.conversation_id, e);
        }
    }
}

/// Derive a title from a user message: whitespace collapsed, cut at
/// `max_chars` characters with `...` appended when truncated.
pub fn derive_title(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{
        Conversation, CreateConversation, CreateSubagent, SqliteChatStore, Subagent,
        SubagentStatus,
    };
    use crate::db::Database;
    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Store that counts message writes and can be told to fail them.
    struct ProbeStore {
        inner: SqliteChatStore,
        writes: AtomicUsize,
        failing: AtomicBool,
    }

    impl ProbeStore {
        fn write(&self) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                bail!("disk on fire");
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl ChatStore for ProbeStore {
        async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
            self.inner.get_conversation(id).await
        }
        async fn create_conversation(&self, input: CreateConversation) -> Result<Conversation> {
            self.inner.create_conversation(input).await
        }
        async fn set_title(&self, id: &str, title: &str) -> Result<()> {
            self.inner.set_title(id, title).await
        }
        async fn increment_compaction_count(&self, id: &str) -> Result<()> {
            self.inner.increment_compaction_count(id).await
        }
        async fn last_user_message(&self, conversation_id: &str) -> Result<Option<Message>> {
            self.inner.last_user_message(conversation_id).await
        }
        async fn create_message(
            &self,
            conversation_id: &str,
            role: MessageRole,
            content: &str,
        ) -> Result<Message> {
            self.write()?;
            self.inner.create_message(conversation_id, role, content).await
        }
        async fn get_message(&self, id: &str) -> Result<Option<Message>> {
            self.inner.get_message(id).await
        }
        async fn update_message_content(&self, id: &str, content: &str) -> Result<()> {
            self.write()?;
            self.inner.update_message_content(id, content).await
        }
        async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
            self.inner.list_messages(conversation_id).await
        }
        async fn create_subagent(&self, input: CreateSubagent) -> Result<Subagent> {
            self.inner.create_subagent(input).await
        }
        async fn bind_subagent_task(
            &self,
            conversation_id: &str,
            tool_call_id: &str,
            task_id: Option<&str>,
            status: SubagentStatus,
            output: Option<&str>,
        ) -> Result<Option<Subagent>> {
            self.inner
                .bind_subagent_task(conversation_id, tool_call_id, task_id, status, output)
                .await
        }
        async fn complete_subagent(
            &self,
            task_id: &str,
            status: SubagentStatus,
            output: Option<&str>,
        ) -> Result<bool> {
            self.inner.complete_subagent(task_id, status, output).await
        }
        async fn find_subagent_by_task(&self, task_id: &str) -> Result<Option<Subagent>> {
            self.inner.find_subagent_by_task(task_id).await
        }
        async fn list_subagents(&self, conversation_id: &str) -> Result<Vec<Subagent>> {
            self.inner.list_subagents(conversation_id).await
        }
    }

    const FLUSH: Duration = Duration::from_millis(500);

    async fn probe() -> Arc<ProbeStore> {
        let inner = SqliteChatStore::new(Database::in_memory().await.unwrap());
        inner
            .create_conversation(CreateConversation {
                id: Some("conv".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        Arc::new(ProbeStore {
            inner,
            writes: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        })
    }

    fn persister(store: &Arc<ProbeStore>, flush_interval: Duration) -> IncrementalPersister {
        let store: Arc<dyn ChatStore> = store.clone();
        IncrementalPersister::new(store, "conv", flush_interval)
    }

    async fn assistant_messages(store: &ProbeStore) -> Vec<Message> {
        store
            .inner
            .list_messages("conv")
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.role == "assistant")
            .collect()
    }

    #[tokio::test]
    async fn test_single_message_across_flushes() {
        let store = probe().await;
        let mut p = persister(&store, Duration::ZERO);

        for chunk in ["Hello", ", ", "world", "!"] {
            p.on_text_delta(chunk).await;
        }
        let message = p.finalize(false).await.unwrap();

        let messages = assistant_messages(&store).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, message.id);
        assert_eq!(message.content, "Hello, world!");
        assert_eq!(store.writes.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_flush_interval_batches_deltas() {
        let store = probe().await;
        let mut p = persister(&store, Duration::from_secs(3600));

        for _ in 0..10 {
            p.on_text_delta("b").await;
        }
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
        assert!(p.cursor().assistant_message_id.is_none());

        p.force_flush().await;
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
        assert_eq!(p.cursor().last_flushed_len, 10);
    }

    #[tokio::test]
    async fn test_repeated_flush_without_new_text_writes_once() {
        let store = probe().await;
        let mut p = persister(&store, FLUSH);

        p.force_flush().await;
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);

        p.on_text_delta("partial").await;
        p.force_flush().await;
        p.force_flush().await;
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_flush_is_retried() {
        let store = probe().await;
        let mut p = persister(&store, FLUSH);

        store.failing.store(true, Ordering::SeqCst);
        p.on_text_delta("keep me").await;
        p.force_flush().await;
        assert!(p.cursor().assistant_message_id.is_none());
        assert_eq!(p.text(), "keep me");

        store.failing.store(false, Ordering::SeqCst);
        let message = p.finalize(false).await.unwrap();
        assert_eq!(message.content, "keep me");
    }

    #[tokio::test]
    async fn test_finalize_without_text() {
        let store = probe().await;

        let mut p = persister(&store, FLUSH);
        assert!(p.finalize(false).await.is_none());
        assert!(assistant_messages(&store).await.is_empty());

        let mut p = persister(&store, FLUSH);
        let message = p.finalize(true).await.unwrap();
        assert_eq!(message.content, "");
        assert_eq!(assistant_messages(&store).await.len(), 1);
    }

    #[tokio::test]
    async fn test_title_applied_on_first_creation() {
        let store = probe().await;
        let mut p = persister(&store, FLUSH).with_title(Some("Greeting".into()));
        p.on_text_delta("hi").await;
        p.force_flush().await;

        let conversation = store.inner.get_conversation("conv").await.unwrap().unwrap();
        assert_eq!(conversation.title.as_deref(), Some("Greeting"));
    }

    #[test]
    fn test_derive_title() {
        assert_eq!(derive_title("  Short  question\n", 50), "Short question");
        let long = "word ".repeat(30);
        let title = derive_title(&long, 50);
        assert!(title.ends_with("..."));
        assert!(title.chars().count() <= 53);
        assert_eq!(derive_title(&"é".repeat(81), 80), format!("{}...", "é".repeat(80)));
        assert_eq!(derive_title(&"x".repeat(80), 80), "x".repeat(80));
    }
}
