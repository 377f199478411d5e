//! Identity key primitives.
//!
//! Keys identify nodes; they do not encrypt traffic. Confidentiality on
//! the wire comes from the TLS transport layer.

mod keys;

pub use keys::{PrivateKey, PublicKey, KEY_LEN};
