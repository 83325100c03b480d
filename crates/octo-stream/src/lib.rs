//! Durable streaming of agent replies.
//!
//! Raw events from a pi agent session are translated into a closed set of
//! canonical events, persisted incrementally and pushed to the client as
//! server-sent events. Subagents spawned by the agent are tracked through
//! both the event feed and an out-of-band notification channel.

pub mod api;
pub mod canon;
pub mod chat;
pub mod client;
pub mod db;
pub mod pi;
pub mod stream;
pub mod subagent;
