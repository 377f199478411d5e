//! Error types for meshium

use thiserror::Error;

/// Main error type for meshium
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Setup error: {0}")]
    Setup(String),

    #[error("Dial failed: {0}")]
    Dial(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}

/// Result type alias for meshium
pub type Result<T> = std::result::Result<T, Error>;
