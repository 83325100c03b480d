//! Subagent lifecycle.

mod tracker;

pub use tracker::{SubagentPhase, SubagentTracker};
