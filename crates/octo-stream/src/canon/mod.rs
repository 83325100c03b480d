//! Canonical event model.
//!
//! Raw pi events are translated into a small closed set of [`StreamEvent`]s
//! at this boundary; nothing downstream looks at runtime shapes.

pub mod events;
pub mod patterns;
pub mod translate;

pub use events::{DonePayload, OutboundEvent, StreamEvent};
pub use patterns::{SpawnInfo, Verdict, parse_notification, parse_spawn_result};
pub use translate::{SPAWN_AGENT_TOOL, flatten_tool_result, translate, translate_notification};
