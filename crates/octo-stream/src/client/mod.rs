//! Client-side reassembly of the event stream.

mod decoder;
mod http;
mod poller;
mod view;

pub use decoder::{SseDecoder, SseFrame};
pub use http::{ClientError, ClientResult, StreamClient, StreamOutcome};
pub use poller::{POLL_INTERVAL, SubagentPoller, SubagentStatusSource};
pub use view::{ChatView, SubagentView, ToolCallView};
