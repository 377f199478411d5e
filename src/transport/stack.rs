//! Transport stack composition
//!
//! A stack is described by a list of transport entries forming a
//! dependency DAG: wrappers name the layer beneath them via `Underlying`,
//! and exactly one entry carries the `Main` flag. The composer resolves
//! the DAG depth-first (dependencies before dependents, cycles rejected),
//! instantiates every layer in post-order, and returns the root.
//!
//! The same entry list describes both sides; [`build_server`] reads the
//! server-side fields and [`build_client`] the client-side ones. An empty
//! list yields plain TCP.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

use serde::Deserialize;

use crate::common::{Error, Result};

use super::trojan::{TrojanClientConfig, TrojanServerConfig};
use super::{
    CaesarClient, CaesarServer, TcpClient, TcpServer, TlsClient, TlsClientConfig, TlsServer,
    TlsServerConfig, TransportClient, TransportServer, TrojanClient, TrojanServer, UdpClient,
    UdpServer,
};

/// One layer of the transport stack, as configured.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportEntry {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Main", default)]
    pub main: bool,
    #[serde(rename = "Underlying", default)]
    pub underlying: Option<String>,
    #[serde(flatten)]
    pub kind: TransportKind,
}

/// Typed per-layer settings, discriminated by the `Type` key.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "Type")]
pub enum TransportKind {
    #[serde(rename = "tcp")]
    Tcp,
    #[serde(rename = "udp")]
    Udp,
    #[serde(rename = "tls")]
    Tls(TlsEntry),
    #[serde(rename = "caesar")]
    Caesar(CaesarEntry),
    #[serde(rename = "trojan")]
    Trojan(TrojanEntry),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsEntry {
    #[serde(rename = "ServerName", default)]
    pub server_name: Option<String>,
    #[serde(rename = "Sni", default = "default_true")]
    pub sni: bool,
    #[serde(rename = "InsecureSkipVerify", default)]
    pub insecure_skip_verify: bool,
    #[serde(rename = "CertPem", default)]
    pub cert_pem: Option<String>,
    #[serde(rename = "KeyPem", default)]
    pub key_pem: Option<String>,
    #[serde(rename = "CertFile", default)]
    pub cert_file: Option<String>,
    #[serde(rename = "KeyFile", default)]
    pub key_file: Option<String>,
    #[serde(rename = "ClientCaFile", default)]
    pub client_ca_file: Option<String>,
    #[serde(rename = "RequireClientCert", default)]
    pub require_client_cert: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaesarEntry {
    #[serde(rename = "Shift")]
    pub shift: i64,
}

impl CaesarEntry {
    fn shift_mod_256(&self) -> u8 {
        self.shift.rem_euclid(256) as u8
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrojanEntry {
    /// Client credential.
    #[serde(rename = "Password", default)]
    pub password: Option<String>,
    /// Server user table.
    #[serde(rename = "Passwords", default)]
    pub passwords: Vec<String>,
    #[serde(rename = "RedirectHost", default)]
    pub redirect_host: Option<IpAddr>,
    #[serde(rename = "RedirectPort", default)]
    pub redirect_port: u16,
}

/// Dependency-first ordering of the entries. Rejects cycles, unknown
/// `Underlying` references, and duplicate ids.
fn resolve_order(entries: &[TransportEntry]) -> Result<Vec<&TransportEntry>> {
    let mut by_id: HashMap<&str, &TransportEntry> = HashMap::new();
    for entry in entries {
        if by_id.insert(entry.id.as_str(), entry).is_some() {
            return Err(Error::Config(format!("duplicate transport id: {}", entry.id)));
        }
    }

    let mut order = Vec::with_capacity(entries.len());
    let mut visited: HashSet<&str> = HashSet::new();
    let mut in_progress: HashSet<&str> = HashSet::new();

    fn visit<'a>(
        id: &'a str,
        by_id: &HashMap<&'a str, &'a TransportEntry>,
        visited: &mut HashSet<&'a str>,
        in_progress: &mut HashSet<&'a str>,
        order: &mut Vec<&'a TransportEntry>,
    ) -> Result<()> {
        if visited.contains(id) {
            return Ok(());
        }
        if !in_progress.insert(id) {
            return Err(Error::Config(format!(
                "circular transport dependency at {}",
                id
            )));
        }
        let entry = by_id
            .get(id)
            .ok_or_else(|| Error::Config(format!("unknown transport dependency: {}", id)))?;
        if let Some(underlying) = &entry.underlying {
            visit(underlying, by_id, visited, in_progress, order)?;
        }
        in_progress.remove(id);
        visited.insert(id);
        order.push(entry);
        Ok(())
    }

    for entry in entries {
        visit(
            &entry.id,
            &by_id,
            &mut visited,
            &mut in_progress,
            &mut order,
        )?;
    }
    Ok(order)
}

fn main_id(entries: &[TransportEntry]) -> Result<&str> {
    let mut mains = entries.iter().filter(|e| e.main);
    let first = mains
        .next()
        .ok_or_else(|| Error::Config("no main transport configured".into()))?;
    if mains.next().is_some() {
        return Err(Error::Config("more than one main transport configured".into()));
    }
    Ok(&first.id)
}

fn underlying_of<'a, T: Clone>(
    entry: &TransportEntry,
    built: &'a HashMap<String, T>,
) -> Result<T> {
    let id = entry
        .underlying
        .as_ref()
        .ok_or_else(|| Error::Config(format!("transport {} requires Underlying", entry.id)))?;
    built
        .get(id)
        .cloned()
        .ok_or_else(|| Error::Config(format!("unknown transport dependency: {}", id)))
}

fn leaf_check(entry: &TransportEntry) -> Result<()> {
    if entry.underlying.is_some() {
        return Err(Error::Config(format!(
            "leaf transport {} cannot have Underlying",
            entry.id
        )));
    }
    Ok(())
}

/// Build the server side of the configured stack.
pub fn build_server(entries: &[TransportEntry]) -> Result<Arc<dyn TransportServer>> {
    if entries.is_empty() {
        return Ok(Arc::new(TcpServer::new()));
    }
    let main = main_id(entries)?;
    let mut built: HashMap<String, Arc<dyn TransportServer>> = HashMap::new();

    for entry in resolve_order(entries)? {
        let server: Arc<dyn TransportServer> = match &entry.kind {
            TransportKind::Tcp => {
                leaf_check(entry)?;
                Arc::new(TcpServer::new())
            }
            TransportKind::Udp => {
                leaf_check(entry)?;
                Arc::new(UdpServer::new())
            }
            TransportKind::Tls(tls) => {
                let config = TlsServerConfig {
                    cert_pem: tls.cert_pem.clone(),
                    key_pem: tls.key_pem.clone(),
                    cert_file: tls.cert_file.clone(),
                    key_file: tls.key_file.clone(),
                    client_ca_file: tls.client_ca_file.clone(),
                    require_client_cert: tls.require_client_cert,
                };
                Arc::new(TlsServer::new(&config, underlying_of(entry, &built)?)?)
            }
            TransportKind::Caesar(caesar) => Arc::new(CaesarServer::new(
                caesar.shift_mod_256(),
                underlying_of(entry, &built)?,
            )),
            TransportKind::Trojan(trojan) => {
                if trojan.passwords.is_empty() {
                    return Err(Error::Config(format!(
                        "trojan server {} requires Passwords",
                        entry.id
                    )));
                }
                let config = TrojanServerConfig {
                    passwords: trojan.passwords.clone(),
                    redirect_host: trojan
                        .redirect_host
                        .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)),
                    redirect_port: trojan.redirect_port,
                };
                Arc::new(TrojanServer::new(&config, underlying_of(entry, &built)?))
            }
        };
        built.insert(entry.id.clone(), server);
    }

    Ok(built.remove(main).expect("main resolved from entries"))
}

/// Build the client side of the configured stack.
pub fn build_client(entries: &[TransportEntry]) -> Result<Arc<dyn TransportClient>> {
    if entries.is_empty() {
        return Ok(Arc::new(TcpClient::new()));
    }
    let main = main_id(entries)?;
    let mut built: HashMap<String, Arc<dyn TransportClient>> = HashMap::new();

    for entry in resolve_order(entries)? {
        let client: Arc<dyn TransportClient> = match &entry.kind {
            TransportKind::Tcp => {
                leaf_check(entry)?;
                Arc::new(TcpClient::new())
            }
            TransportKind::Udp => {
                leaf_check(entry)?;
                Arc::new(UdpClient::new())
            }
            TransportKind::Tls(tls) => {
                let config = TlsClientConfig {
                    server_name: tls.server_name.clone().unwrap_or_default(),
                    sni: tls.sni,
                    insecure_skip_verify: tls.insecure_skip_verify,
                };
                Arc::new(TlsClient::new(&config, underlying_of(entry, &built)?)?)
            }
            TransportKind::Caesar(caesar) => Arc::new(CaesarClient::new(
                caesar.shift_mod_256(),
                underlying_of(entry, &built)?,
            )),
            TransportKind::Trojan(trojan) => {
                let password = trojan.password.clone().ok_or_else(|| {
                    Error::Config(format!("trojan client {} requires Password", entry.id))
                })?;
                let config = TrojanClientConfig { password };
                Arc::new(TrojanClient::new(&config, underlying_of(entry, &built)?)?)
            }
        };
        built.insert(entry.id.clone(), client);
    }

    Ok(built.remove(main).expect("main resolved from entries"))
}
