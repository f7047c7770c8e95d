//! Durable spooling producer: persists messages to rotating on-disk
//! segment files when a downstream is unavailable, and replays them
//! back through the router once it recovers.

mod producer;
mod segment;

pub use producer::{spawn_control_loop, ProducerConfig, SharedContext, SpoolControl, SpoolingProducer};
pub use segment::{SegmentError, SpoolSegment, MAX_SPOOL_FILE_NUMBER};
