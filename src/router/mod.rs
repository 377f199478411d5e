//! Allowed-IP routing
//!
//! Responsibilities:
//! - Map a destination IP to the owning peer by longest-prefix match
//! - NO IO operations
//!
//! The trie is built once at device construction and read without locking
//! afterwards.

mod trie;

pub use trie::AllowedIps;
