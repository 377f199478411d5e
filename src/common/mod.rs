//! Core types shared by every layer: the boxed stream and the packet pool.

mod pool;
mod stream;

pub use pool::{PacketBuffer, PacketPool, PACKET_CAPACITY};
pub use stream::{Stream, StreamIo};

pub use crate::error::{Error, Result};
