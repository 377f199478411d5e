//! Configuration
//!
//! TOML, WireGuard-flavored: an `[Interface]` section, repeated `[[Peer]]`
//! sections, and optional `[[Transport]]` sections describing the
//! transport stack (see [`crate::transport::stack`]). Values stay as
//! written here; the device parses keys, prefixes, and endpoints when it
//! is constructed and rejects anything malformed at startup.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::transport::stack::TransportEntry;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "Interface")]
    pub interface: InterfaceConfig,

    #[serde(rename = "Peer", default)]
    pub peers: Vec<PeerConfig>,

    /// Transport stack shared by the listener and all peer dialers.
    /// Empty means plain TCP.
    #[serde(rename = "Transport", default)]
    pub transport: Vec<TransportEntry>,
}

/// `[Interface]` section
#[derive(Debug, Clone, Deserialize)]
pub struct InterfaceConfig {
    /// Node identity, base64.
    #[serde(rename = "PrivateKey")]
    pub private_key: String,

    /// 0 (or absent) disables the listener: client-only mode.
    #[serde(rename = "ListenPort", default)]
    pub listen_port: u16,

    /// CIDR holding both the local VPN address and the network mask.
    #[serde(rename = "Address")]
    pub address: String,
}

/// `[[Peer]]` section
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    #[serde(rename = "PublicKey")]
    pub public_key: String,

    /// Destination prefix routed to this peer.
    #[serde(rename = "AllowedIPs")]
    pub allowed_ips: String,

    /// Present ⇒ active peer (we dial it); absent ⇒ passive (inbound only).
    #[serde(rename = "Endpoint", default)]
    pub endpoint: Option<String>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!(
                "failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("failed to parse config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_without_endpoints() {
        let config = Config::from_toml(
            r#"
[Interface]
PrivateKey = "kP3gpdm72QExS/uwfVS/+H88IkMTaMD38GNgNpecyxc="
ListenPort = 51820
Address = "10.0.0.1/24"

[[Peer]]
PublicKey = "uLSvhLaefcFG8EB/jAaioIKz9YhpoJ3JinbK+m+O8Ec="
AllowedIPs = "10.0.0.2/32"

[[Peer]]
PublicKey = "lCcCFRczyZ5f4y3PBoLccBdjMGzGjz8rU6RCcHXuTio="
AllowedIPs = "10.0.0.3/32"
"#,
        )
        .unwrap();

        assert_eq!(config.interface.listen_port, 51820);
        assert_eq!(config.interface.address, "10.0.0.1/24");
        assert_eq!(config.peers.len(), 2);
        assert!(config.peers.iter().all(|p| p.endpoint.is_none()));
        assert!(config.transport.is_empty());
    }

    #[test]
    fn client_config_with_endpoint() {
        let config = Config::from_toml(
            r#"
[Interface]
PrivateKey = "uLSvhLaefcFG8EB/jAaioIKz9YhpoJ3JinbK+m+O8Ec="
Address = "10.0.0.2/32"

[[Peer]]
PublicKey = "kP3gpdm72QExS/uwfVS/+H88IkMTaMD38GNgNpecyxc="
AllowedIPs = "10.0.0.1/24"
Endpoint = "127.0.0.1:51820"
"#,
        )
        .unwrap();

        assert_eq!(config.interface.listen_port, 0);
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.peers[0].endpoint.as_deref(), Some("127.0.0.1:51820"));
    }

    #[test]
    fn transport_stack_parses() {
        let config = Config::from_toml(
            r#"
[Interface]
PrivateKey = "uLSvhLaefcFG8EB/jAaioIKz9YhpoJ3JinbK+m+O8Ec="
Address = "10.0.0.2/32"

[[Transport]]
Id = "caesar0"
Type = "caesar"
Main = true
Underlying = "tcp0"
Shift = 3

[[Transport]]
Id = "tcp0"
Type = "tcp"
"#,
        )
        .unwrap();

        assert_eq!(config.transport.len(), 2);
        assert_eq!(config.transport[0].id, "caesar0");
        assert!(config.transport[0].main);
    }

    #[test]
    fn missing_required_field_fails() {
        assert!(Config::from_toml(
            r#"
[Interface]
ListenPort = 51820
Address = "10.0.0.1/24"
"#,
        )
        .is_err());
    }
}
