//! Pi agent runtime integration.

mod client;
mod registry;
mod runtime;
mod types;

pub use client::{PiClient, PiClientConfig};
pub use registry::{SessionHandle, SessionRegistry, StreamGuard};
pub use runtime::{LocalPiRuntime, NotifyHandler, PiProcess, PiRuntime, PiSpawnConfig};
pub use types::*;
