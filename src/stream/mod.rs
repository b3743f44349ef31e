//! Live state streaming: publishing, merging, transport and catch-up.

pub mod catch_up;
pub mod channel;
pub mod fanin;
pub mod message;
pub mod transport;

pub use catch_up::{CatchUp, consume_stream_state, consume_typed};
pub use channel::{StateChannel, create_channel};
pub use fanin::{FanIn, MuxedEvent, mux_events};
pub use message::{StreamMsg, apply_message, apply_raw};
pub use transport::{MuxEvent, MuxOptions, SseDecoder, StreamSource, spawn_mux};
