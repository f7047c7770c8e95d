//! Data model and external collaborator contracts for the spooling
//! producer: messages, stream identity, wire serialization, and the
//! router/source/formatter traits a producer is built against.

mod formatter;
mod message;
mod router;
mod source;
mod wire;

pub use formatter::{CopyMode, Formatter, MetadataCopyFormatter, WriterAssembly};
pub use message::{Message, StreamId};
pub use router::{ChannelRouter, Router};
pub use source::{MessageSource, ToggleSource};
pub use wire::{deserialize, serialize, WireError};
