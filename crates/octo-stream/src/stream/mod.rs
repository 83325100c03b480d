//! Streaming of agent replies.

mod config;
mod coordinator;
mod persister;

pub use config::StreamConfig;
pub use coordinator::{EventStream, StreamCoordinator, TerminalReason};
pub use persister::{IncrementalPersister, PersistenceCursor, derive_title};

use thiserror::Error;

/// Failures detected before any byte of the stream is sent.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("conversation {0} has no user message to answer")]
    NoUserMessage(String),

    #[error("conversation {0} is already streaming")]
    AlreadyStreaming(String),

    #[error("agent runtime error: {0:#}")]
    Runtime(#[from] anyhow::Error),
}
