//! Frame-level I/O over the two halves of an async stream.
//!
//! Reads and writes honor the connection's [`Deadlines`](crate::deadline::Deadlines).

mod framed;

pub use framed::{FrameReader, FrameWriter};
