//! Silent TLS listener, grounded in
//! `original_source/go-gost/x/listener/tls/listener.go`'s
//! `silentTLSListener.Accept`: wrap each raw TCP accept in a TLS
//! handshake under a 10s deadline; on handshake failure, close the raw
//! connection without surfacing the error and loop to the next accept.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::error::ForwardError;
use super::Conn;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds a `TlsAcceptor` from a PEM certificate chain and private key on
/// disk. Certificate/chain validation internals are an external
/// collaborator per spec.md §1 — this is a thin, direct load with no
/// reloading or SNI multiplexing.
pub fn build_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, ForwardError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ForwardError::Invalid(format!("building TLS server config from {cert_path}: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, ForwardError> {
    let file = File::open(path).map_err(|e| ForwardError::Invalid(format!("reading cert {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ForwardError::Invalid(format!("parsing cert {path}: {e}")))
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, ForwardError> {
    let file = File::open(path).map_err(|e| ForwardError::Invalid(format!("reading key {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ForwardError::Invalid(format!("parsing key {path}: {e}")))?
        .ok_or_else(|| ForwardError::Invalid(format!("no private key found in {path}")))
}

pub struct TlsListenerHandle {
    inner: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsListenerHandle {
    pub async fn bind(addr: &str, acceptor: TlsAcceptor) -> Result<Self, ForwardError> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|e| ForwardError::Fatal(format!("bind {addr}: {e}")))?;
        Ok(Self { inner, acceptor })
    }

    /// Accepts and handshakes the next TLS connection, silently discarding
    /// any number of raw connections that fail to complete a handshake
    /// within the deadline.
    pub async fn accept(&self) -> std::io::Result<(Conn, SocketAddr)> {
        loop {
            let (raw, peer_addr) = self.inner.accept().await?;
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, self.acceptor.accept(raw)).await {
                Ok(Ok(tls_stream)) => return Ok((Conn::Tls(Box::new(tls_stream)), peer_addr)),
                Ok(Err(e)) => {
                    log::debug!("silent TLS listener: handshake with {peer_addr} failed: {e}");
                    continue;
                }
                Err(_) => {
                    log::debug!("silent TLS listener: handshake with {peer_addr} timed out");
                    continue;
                }
            }
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_acceptor_fails_on_missing_cert_file() {
        let err = build_acceptor("/nonexistent/cert.pem", "/nonexistent/key.pem").unwrap_err();
        assert_eq!(err.kind(), "Invalid");
    }
}
