pub mod channel;
pub mod mux;

pub use channel::{ChannelSignal, RelayChannel, RelayError};
pub use mux::{DequeueError, QueueItem, RequestMultiplexer, RequestQueue};
