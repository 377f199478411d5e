//! Meshium - a point-to-multipoint mesh VPN data plane
//!
//! # Architecture (Forwarding Pipeline)
//!
//! ```text
//! TUN read
//! → Routing queue
//! → Classifier (local / peer / drop)
//! → Peer queue → framed write → Transport stack (TCP · TLS · Caesar · Trojan)
//! → network — and symmetrically back into the TUN
//! ```
//!
//! ## Core Principles
//!
//! - Every long-running loop is an independent task joined by bounded queues
//! - Transports compose: leaves own sockets, wrappers transform streams
//! - Routing is a pure longest-prefix lookup, no IO
//! - Packets live in pooled buffers; handing one to a queue hands off the
//!   duty to recycle it
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Stream, PacketBuffer, PacketPool
//! ├── crypto/          # Identity keys (Curve25519)
//! ├── transport/       # Transport stack: TCP, UDP, TLS, Caesar, Trojan
//! ├── router/          # Allowed-IP trie: longest-prefix match
//! ├── device/          # Forwarding engine: TUN, peers, classifier
//! └── config.rs        # TOML configuration
//! ```

// Core types
pub mod common;
pub mod error;

// Layered architecture
pub mod crypto;
pub mod device;
pub mod router;
pub mod transport;

// Supporting modules
pub mod config;

// Re-exports for convenience
pub use common::{PacketBuffer, PacketPool, Stream};
pub use config::Config;
pub use crypto::{PrivateKey, PublicKey};
pub use error::{Error, Result};

// Architecture re-exports
pub use device::{Device, Peer};
pub use router::AllowedIps;
pub use transport::{Connection, TransportClient, TransportServer};
