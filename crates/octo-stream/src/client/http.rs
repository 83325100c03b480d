//! HTTP client for the streaming endpoint.

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

use super::decoder::SseDecoder;
use super::poller::SubagentStatusSource;
use super::view::ChatView;
use crate::canon::{OutboundEvent, StreamEvent};
use crate::chat::{Conversation, Message, Subagent};

#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection failed or broke before any text arrived.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server refused the request.
    #[error("server returned {status}: {body}")]
    Status { status: StatusCode, body: String },
}

pub type ClientResult<T> = Result<T, ClientError>;

/// How a stream ended from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// A `done` event arrived.
    Completed,
    /// The server closed the stream without `done`, after an `error` event.
    Ended,
    /// The transport broke after text arrived. The partial text stays in the
    /// view and was persisted by the server.
    Interrupted,
}

/// Client for one server.
#[derive(Debug, Clone)]
pub struct StreamClient {
    client: Client,
    base_url: String,
}

impl StreamClient {
    pub fn new(base_url: impl Into<String>) -> ClientResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub async fn create_conversation(&self) -> ClientResult<Conversation> {
        let url = format!("{}/api/conversations", self.base_url);
        let response = self.client.post(&url).json(&json!({})).send().await?;
        Self::handle_response(response).await
    }

    pub async fn add_user_message(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> ClientResult<Message> {
        let url = format!(
            "{}/api/conversations/{}/messages",
            self.base_url, conversation_id
        );
        let response = self
            .client
            .post(&url)
            .json(&json!({ "role": "user", "content": content }))
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn list_subagents(&self, conversation_id: &str) -> ClientResult<Vec<Subagent>> {
        let url = format!(
            "{}/api/conversations/{}/subagents",
            self.base_url, conversation_id
        );
        let response = self.client.get(&url).send().await?;
        Self::handle_response(response).await
    }

    /// Stream the reply to the latest user message into `view`.
    ///
    /// `on_event` sees every decoded event after it was applied.
    pub async fn stream<F>(
        &self,
        conversation_id: &str,
        view: &mut ChatView,
        mut on_event: F,
    ) -> ClientResult<StreamOutcome>
    where
        F: FnMut(&OutboundEvent),
    {
        let url = format!("{}/api/chat/stream", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Accept", "text/event-stream")
            .json(&json!({ "sessionId": conversation_id }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status { status, body });
        }

        let mut decoder = SseDecoder::new();
        let mut bytes = response.bytes_stream();
        let mut progress = Progress::default();

        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    for event in decoder.push_events(&chunk) {
                        progress.deliver(event, view, &mut on_event);
                    }
                }
                Err(e) if progress.received_text => {
                    warn!("Stream for {} interrupted: {}", conversation_id, e);
                    return Ok(StreamOutcome::Interrupted);
                }
                Err(e) => return Err(ClientError::Transport(e)),
            }
        }

        if let Some(event) = decoder.finish().and_then(|frame| frame.decode()) {
            progress.deliver(event, view, &mut on_event);
        }

        let outcome = if progress.done {
            StreamOutcome::Completed
        } else {
            StreamOutcome::Ended
        };
        debug!("Stream for {} ended: {:?}", conversation_id, outcome);
        Ok(outcome)
    }

    async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> ClientResult<T> {
        let status = response.status();
        if status.is_success() {
            Ok(response.json().await?)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ClientError::Status { status, body })
        }
    }
}

#[derive(Debug, Default)]
struct Progress {
    received_text: bool,
    done: bool,
}

impl Progress {
    fn deliver<F>(&mut self, event: OutboundEvent, view: &mut ChatView, on_event: &mut F)
    where
        F: FnMut(&OutboundEvent),
    {
        match event {
            OutboundEvent::Done(_) => self.done = true,
            OutboundEvent::Event(StreamEvent::Text { .. }) => self.received_text = true,
            OutboundEvent::Event(_) => {}
        }
        view.apply(&event);
        on_event(&event);
    }
}

#[async_trait]
impl SubagentStatusSource for StreamClient {
    async fn fetch_subagents(&self, conversation_id: &str) -> anyhow::Result<Vec<Subagent>> {
        self.list_subagents(conversation_id)
            .await
            .with_context(|| format!("polling subagents of {}", conversation_id))
    }
}
