pub mod error;
pub mod protocol;
pub mod streamer;

pub use error::LinkError;
pub use protocol::{parse_message, ServerMessage, TranscriptEvent};
pub use streamer::{spawn_link_sender, LinkCommand, LinkEvent, TranscriptStreamer};
