pub mod gemini;
pub mod openai;
pub mod relay;
pub mod sse;

pub use relay::{RelayEvent, RelayRequestFrame, StreamingMode, cancel_frame};
