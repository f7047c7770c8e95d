//! Pull-based byte-stream framing shared by the spool reader loop and
//! usable standalone wherever a stream needs splitting into discrete
//! message frames.

mod reader;

pub use reader::{Framing, FramedReader, FramingError};
