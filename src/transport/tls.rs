//! TLS transport wrapper
//!
//! Wraps an underlying transport (normally the TCP leaf) with rustls.
//! Server certificate and key come either as in-memory PEM or from file
//! paths; the client can pin a server name, disable SNI, or skip
//! verification entirely for testing.

use std::io::{BufReader, Cursor, Read};
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::common::{Error, Result};

use super::{Connection, TransportClient, TransportServer};

/// TLS server configuration
#[derive(Debug, Clone, Default)]
pub struct TlsServerConfig {
    /// Certificate chain, PEM. Takes precedence over `cert_file`.
    pub cert_pem: Option<String>,
    /// Private key, PEM. Takes precedence over `key_file`.
    pub key_pem: Option<String>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    /// CA bundle for verifying client certificates.
    pub client_ca_file: Option<String>,
    /// Reject clients that do not present a valid certificate.
    pub require_client_cert: bool,
}

/// TLS client configuration
#[derive(Debug, Clone)]
pub struct TlsClientConfig {
    /// Name used for certificate verification and, when `sni` is set,
    /// the SNI extension.
    pub server_name: String,
    pub sni: bool,
    pub insecure_skip_verify: bool,
}

impl Default for TlsClientConfig {
    fn default() -> Self {
        Self {
            server_name: String::new(),
            sni: true,
            insecure_skip_verify: false,
        }
    }
}

fn pem_source(inline: &Option<String>, path: &Option<String>, what: &str) -> Result<Vec<u8>> {
    if let Some(pem) = inline {
        return Ok(pem.as_bytes().to_vec());
    }
    if let Some(path) = path {
        let mut raw = Vec::new();
        std::fs::File::open(path)
            .map_err(|e| Error::Config(format!("cannot open {} {}: {}", what, path, e)))?
            .read_to_end(&mut raw)?;
        return Ok(raw);
    }
    Err(Error::Config(format!("TLS server requires a {}", what)))
}

fn load_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(Cursor::new(pem)))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("cannot parse certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::Config("no certificates found in PEM".into()));
    }
    Ok(certs)
}

fn load_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let items = rustls_pemfile::read_all(&mut BufReader::new(Cursor::new(pem)))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("cannot parse private key: {}", e)))?;
    for item in items {
        match item {
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => continue,
        }
    }
    Err(Error::Config("no valid private key found in PEM".into()))
}

/// TLS server layer: accepts from the underlying server, then runs the
/// TLS handshake before handing the connection up.
pub struct TlsServer {
    underlying: Arc<dyn TransportServer>,
    acceptor: TlsAcceptor,
}

impl TlsServer {
    pub fn new(config: &TlsServerConfig, underlying: Arc<dyn TransportServer>) -> Result<Self> {
        let certs = load_certs(&pem_source(&config.cert_pem, &config.cert_file, "certificate")?)?;
        let key = load_private_key(&pem_source(&config.key_pem, &config.key_file, "private key")?)?;

        let builder = if config.require_client_cert {
            let ca_file = config
                .client_ca_file
                .as_ref()
                .ok_or_else(|| Error::Config("client auth requires ClientCaFile".into()))?;
            let mut roots = RootCertStore::empty();
            let ca_pem = std::fs::read(ca_file)
                .map_err(|e| Error::Config(format!("cannot open client CA {}: {}", ca_file, e)))?;
            for cert in load_certs(&ca_pem)? {
                roots
                    .add(cert)
                    .map_err(|e| Error::Config(format!("invalid client CA: {}", e)))?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| Error::Config(format!("client verifier: {}", e)))?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        } else {
            ServerConfig::builder().with_no_client_auth()
        };

        let server_config = builder
            .with_single_cert(certs, key)
            .map_err(|e| Error::Config(format!("invalid certificate/key: {}", e)))?;

        Ok(Self {
            underlying,
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
        })
    }
}

#[async_trait]
impl TransportServer for TlsServer {
    async fn listen(&self, host: IpAddr, port: u16) -> Result<()> {
        self.underlying.listen(host, port).await
    }

    async fn accept(&self) -> Result<Connection> {
        let conn = self.underlying.accept().await?;
        let (local, remote) = (conn.local_addr(), conn.remote_addr());
        let tls_stream = self
            .acceptor
            .accept(conn.into_stream())
            .await
            .map_err(|e| Error::Transport(format!("TLS accept: {}", e)))?;
        Ok(Connection::from_io(tls_stream, local, remote))
    }

    async fn close(&self) -> Result<()> {
        self.underlying.close().await
    }
}

/// TLS client layer: dials through the underlying client, then runs the
/// TLS handshake.
pub struct TlsClient {
    underlying: Arc<dyn TransportClient>,
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsClient {
    pub fn new(config: &TlsClientConfig, underlying: Arc<dyn TransportClient>) -> Result<Self> {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let mut client_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        if config.insecure_skip_verify {
            client_config
                .dangerous()
                .set_certificate_verifier(Arc::new(InsecureVerifier));
        }
        if !config.sni {
            client_config.enable_sni = false;
        }

        let server_name = ServerName::try_from(config.server_name.clone())
            .map_err(|_| Error::Config(format!("invalid server name: {}", config.server_name)))?;

        Ok(Self {
            underlying,
            connector: TlsConnector::from(Arc::new(client_config)),
            server_name,
        })
    }
}

#[async_trait]
impl TransportClient for TlsClient {
    async fn dial(&self, endpoint: &str) -> Result<Connection> {
        let conn = self.underlying.dial(endpoint).await?;
        let (local, remote) = (conn.local_addr(), conn.remote_addr());
        let tls_stream = self
            .connector
            .connect(self.server_name.clone(), conn.into_stream())
            .await
            .map_err(|e| Error::Transport(format!("TLS connect: {}", e)))?;
        Ok(Connection::from_io(tls_stream, local, remote))
    }
}

/// Insecure certificate verifier for testing
#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
