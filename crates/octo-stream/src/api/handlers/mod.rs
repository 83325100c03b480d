//! HTTP request handlers.

mod conversations;
mod misc;
mod stream;

pub use conversations::*;
pub use misc::*;
pub use stream::*;
