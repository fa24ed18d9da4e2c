use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::connect_info::Connected;
use axum::serve::IncomingStream;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig, version};
use tokio_rustls::server::TlsStream;
use x509_parser::prelude::*;

use infrastructure::config::ServerTimeouts;
use infrastructure::constants::TCP_KEEPALIVE_PERIOD;

use super::timeout::TimeoutStream;

/// Load a rustls [`ServerConfig`] pinned to TLS 1.2 with ALPN `http/1.1`.
///
/// When `client_ca` is given, client certificates are requested and, if
/// presented, verified against that pool; connections without a certificate
/// are still admitted (the authorization handler decides what an absent
/// certificate means).
pub fn load_server_config(
    cert_path: &Path,
    key_path: &Path,
    client_ca: Option<&Path>,
) -> anyhow::Result<Arc<ServerConfig>> {
    // Ensure a CryptoProvider is installed (required by rustls 0.23+).
    // Ignore the error if already installed by another dependency.
    let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();

    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(cert_path)
        .map_err(|e| anyhow::anyhow!("failed to read TLS cert at '{}': {e}", cert_path.display()))?
        .collect::<Result<_, _>>()
        .map_err(|e| anyhow::anyhow!("failed to parse TLS certificates: {e}"))?;

    if certs.is_empty() {
        anyhow::bail!(
            "TLS cert file contains no certificates: {}",
            cert_path.display()
        );
    }

    let key: PrivateKeyDer<'static> = PrivateKeyDer::from_pem_file(key_path).map_err(|e| {
        anyhow::anyhow!(
            "failed to parse TLS private key at '{}': {e}",
            key_path.display()
        )
    })?;

    let builder = ServerConfig::builder_with_protocol_versions(&[&version::TLS12]);

    let builder = match client_ca {
        Some(ca_path) => {
            let mut roots = RootCertStore::empty();
            for cert in CertificateDer::pem_file_iter(ca_path).map_err(|e| {
                anyhow::anyhow!("failed to read client CA at '{}': {e}", ca_path.display())
            })? {
                let cert =
                    cert.map_err(|e| anyhow::anyhow!("failed to parse client CA cert: {e}"))?;
                roots
                    .add(cert)
                    .map_err(|e| anyhow::anyhow!("unusable client CA cert: {e}"))?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .allow_unauthenticated()
                .build()
                .map_err(|e| anyhow::anyhow!("failed to build client cert verifier: {e}"))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let mut config = builder
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("invalid TLS certificate/key pair: {e}"))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

// ── Peer identity ───────────────────────────────────────────────────

/// Subject of the verified client certificate, in the two forms the
/// authorization handler matches against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerSubject {
    pub common_name: Option<String>,
    /// Full subject in RFC 2253 order (most specific attribute first).
    pub rfc2253: String,
}

/// Per-connection info surfaced to request handlers.
#[derive(Clone, Debug)]
pub struct TlsConnectInfo {
    pub remote_addr: SocketAddr,
    pub peer_subject: Option<PeerSubject>,
}

/// Extract the subject of the first certificate in the verified chain.
pub fn peer_subject_from_der(der: &[u8]) -> Option<PeerSubject> {
    let (_, cert) = X509Certificate::from_der(der).ok()?;
    let subject = cert.subject();
    let common_name = subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    Some(PeerSubject {
        common_name,
        rfc2253: rfc2253_subject(subject),
    })
}

/// Render an X.500 name as an RFC 2253 string: RDNs most-specific-first,
/// joined by commas, multi-valued RDNs joined by `+`.
fn rfc2253_subject(name: &X509Name<'_>) -> String {
    let mut rdns: Vec<String> = name
        .iter_rdn()
        .map(|rdn| {
            rdn.iter()
                .map(attribute_to_string)
                .collect::<Vec<_>>()
                .join("+")
        })
        .collect();
    rdns.reverse();
    rdns.join(",")
}

fn attribute_to_string(attr: &AttributeTypeAndValue<'_>) -> String {
    let oid = attr.attr_type().to_id_string();
    let key = match oid.as_str() {
        "2.5.4.3" => "CN".to_string(),
        "2.5.4.6" => "C".to_string(),
        "2.5.4.7" => "L".to_string(),
        "2.5.4.8" => "ST".to_string(),
        "2.5.4.9" => "STREET".to_string(),
        "2.5.4.10" => "O".to_string(),
        "2.5.4.11" => "OU".to_string(),
        "0.9.2342.19200300.100.1.1" => "UID".to_string(),
        "0.9.2342.19200300.100.1.25" => "DC".to_string(),
        _ => oid,
    };
    let value = match attr.as_str() {
        Ok(text) => escape_rfc2253(text),
        // Non-string attribute values (rare in subject DNs) are opaque.
        Err(_) => "#<unprintable>".to_string(),
    };
    format!("{key}={value}")
}

/// Escape the characters RFC 2253 reserves inside attribute values.
fn escape_rfc2253(value: &str) -> String {
    let last = value.chars().count().saturating_sub(1);
    let mut escaped = String::with_capacity(value.len());
    for (i, c) in value.chars().enumerate() {
        let needs_escape = matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';')
            || (i == 0 && matches!(c, ' ' | '#'))
            || (i == last && c == ' ');
        if needs_escape {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

// ── Listener ────────────────────────────────────────────────────────

/// A TCP listener that performs TLS handshakes on accepted connections,
/// applies TCP keep-alive, and wraps streams with the configured I/O
/// deadlines.
///
/// Implements [`axum::serve::Listener`] so it can be used as a drop-in
/// replacement for [`TcpListener`] in `axum::serve`.
pub struct TlsListener {
    inner: TcpListener,
    acceptor: TlsAcceptor,
    timeouts: ServerTimeouts,
}

impl TlsListener {
    pub fn new(listener: TcpListener, config: Arc<ServerConfig>, timeouts: ServerTimeouts) -> Self {
        Self {
            inner: listener,
            acceptor: TlsAcceptor::from(config),
            timeouts,
        }
    }
}

fn apply_keepalive(stream: &TcpStream) {
    let keepalive = TcpKeepalive::new().with_time(TCP_KEEPALIVE_PERIOD);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        tracing::debug!(error = %e, "failed to set TCP keep-alive");
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = TimeoutStream<TlsStream<TcpStream>>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let (stream, addr) = match self.inner.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::error!(error = %e, "TCP accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            apply_keepalive(&stream);

            // The read bound also covers the handshake so a stalled client
            // cannot pin the acceptor's resources.
            let handshake = self.acceptor.accept(stream);
            let result = if self.timeouts.read.is_zero() {
                handshake.await
            } else {
                match tokio::time::timeout(self.timeouts.read, handshake).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::debug!(%addr, "TLS handshake timed out");
                        continue;
                    }
                }
            };

            match result {
                Ok(tls) => return (TimeoutStream::new(tls, self.timeouts), addr),
                Err(e) => {
                    tracing::debug!(error = %e, %addr, "TLS handshake failed");
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

impl Connected<IncomingStream<'_, TlsListener>> for TlsConnectInfo {
    fn connect_info(stream: IncomingStream<'_, TlsListener>) -> Self {
        let (_, session) = stream.io().get_ref().get_ref();
        let peer_subject = session
            .peer_certificates()
            .and_then(|certs| certs.first())
            .and_then(|cert| peer_subject_from_der(cert.as_ref()));
        Self {
            remote_addr: *stream.remote_addr(),
            peer_subject,
        }
    }
}
