//! Type-erased transport streams
//!
//! Transport leaves produce concrete socket types (TCP streams, UDP
//! flows, TLS sessions); everything above them operates on [`Stream`],
//! which erases that type behind one object-safe trait. Wrappers peel a
//! `Stream` out of a connection, layer their own behavior over it, and
//! box the result back up.

use tokio::io::{AsyncRead, AsyncWrite};

/// The capabilities a transport stream must carry: ordered async byte
/// IO that can be moved across tasks.
pub trait StreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> StreamIo for T {}

/// A transport byte stream with its concrete type erased.
pub type Stream = Box<dyn StreamIo>;
