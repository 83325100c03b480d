//! Polling fallback for subagent verdicts the stream did not deliver.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::time::Duration;

use super::view::ChatView;
use crate::chat::Subagent;
use crate::subagent::SubagentTracker;

/// Default interval between polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Where current subagent records come from.
#[async_trait]
pub trait SubagentStatusSource: Send + Sync {
    async fn fetch_subagents(&self, conversation_id: &str) -> Result<Vec<Subagent>>;
}

#[async_trait]
impl SubagentStatusSource for SubagentTracker {
    async fn fetch_subagents(&self, conversation_id: &str) -> Result<Vec<Subagent>> {
        self.list(conversation_id).await
    }
}

/// Polls until every tracked subagent has reached a terminal status.
pub struct SubagentPoller<S> {
    source: S,
    interval: Duration,
    max_polls: Option<usize>,
}

impl<S: SubagentStatusSource> SubagentPoller<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            interval: POLL_INTERVAL,
            max_polls: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Give up after this many polls.
    pub fn with_max_polls(mut self, max_polls: usize) -> Self {
        self.max_polls = Some(max_polls);
        self
    }

    /// Poll into `view` until nothing is pending. Returns the number of
    /// polls performed; zero when the stream already delivered everything.
    ///
    /// Failed polls are logged and retried on the next tick.
    pub async fn run(&self, conversation_id: &str, view: &mut ChatView) -> usize {
        let mut polls = 0;
        while view.needs_polling() {
            if self.max_polls.is_some_and(|max| polls >= max) {
                warn!(
                    "Giving up on subagents {:?} of {} after {} polls",
                    view.pending_task_ids(),
                    conversation_id,
                    polls
                );
                break;
            }

            tokio::time::sleep(self.interval).await;
            polls += 1;

            match self.source.fetch_subagents(conversation_id).await {
                Ok(records) => {
                    let changed = view.reconcile(&records);
                    debug!(
                        "Poll {} for {}: {} subagents changed",
                        polls, conversation_id, changed
                    );
                }
                Err(e) => warn!("Subagent poll for {} failed: {:#}", conversation_id, e),
            }
        }

        if polls > 0 && !view.needs_polling() {
            info!("All subagents of {} settled after {} polls", conversation_id, polls);
        }
        polls
    }
}
