//! The byte transport: plain TCP or TLS.
//!
//! [`MaybeTlsStream`] implements `AsyncRead`/`AsyncWrite` over either
//! flavor, so everything above this module is transport-agnostic. TLS is
//! rustls: the backend is verified against a CA file when one is
//! configured and the platform trust store otherwise, and a client
//! certificate/key pair enables mutual TLS.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::{Endpoint, TlsConfig};

/// A TCP stream that may or may not be wrapped in TLS.
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

macro_rules! delegate {
    ($self:ident, $method:ident ( $($arg:expr),* )) => {
        match $self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).$method($($arg),*),
            MaybeTlsStream::Tls(s) => Pin::new(s.as_mut()).$method($($arg),*),
        }
    };
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        delegate!(self, poll_read(cx, buf))
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        delegate!(self, poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate!(self, poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate!(self, poll_shutdown(cx))
    }
}

/// Opens a connection to `endpoint`, upgrading to TLS when configured.
///
/// `TCP_NODELAY` is set either way: requests are small and latency-bound,
/// and the pipeline supplies its own batching.
pub async fn connect(endpoint: &Endpoint, tls: &TlsConfig) -> io::Result<MaybeTlsStream> {
    let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
    tcp.set_nodelay(true)?;

    if !tls.enabled {
        return Ok(MaybeTlsStream::Plain(tcp));
    }

    let client_config = build_client_config(tls)?;
    let connector = TlsConnector::from(Arc::new(client_config));

    let server_name = ServerName::try_from(endpoint.host.clone()).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid server name '{}': {e}", endpoint.host),
        )
    })?;

    let tls_stream = connector.connect(server_name, tcp).await?;
    Ok(MaybeTlsStream::Tls(Box::new(tls_stream)))
}

/// Builds a rustls `ClientConfig` from the client's TLS options.
///
/// The certificate and key paths must be configured as a pair; that is
/// checked up front so a half-configured identity fails before any file
/// or trust-store work happens.
fn build_client_config(tls: &TlsConfig) -> io::Result<rustls::ClientConfig> {
    let identity = match (&tls.cert_path, &tls.key_path) {
        (Some(cert), Some(key)) => Some((cert.as_str(), key.as_str())),
        (None, None) => None,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "client certificate and key must be configured together",
            ))
        }
    };

    let mut roots = rustls::RootCertStore::empty();
    match &tls.ca_path {
        Some(path) => {
            // a configured CA file is authoritative; every certificate
            // in it must be usable
            for cert in pem_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| pem_error(path, &format!("rejected CA certificate: {e}")))?;
            }
        }
        None => {
            // platform stores routinely carry a few entries rustls
            // cannot use; those are skipped rather than fatal
            let native = rustls_native_certs::load_native_certs();
            let mut skipped = 0usize;
            for cert in native.certs {
                if roots.add(cert).is_err() {
                    skipped += 1;
                }
            }
            if skipped > 0 {
                debug!(skipped, "skipped unusable platform trust store entries");
            }
        }
    }
    if roots.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "no usable trust roots for TLS verification",
        ));
    }

    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
    match identity {
        Some((cert_path, key_path)) => {
            let certs = pem_certs(cert_path)?;
            let key = PrivateKeyDer::from_pem_slice(&read_file(key_path)?)
                .map_err(|e| pem_error(key_path, &e.to_string()))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
        }
        None => Ok(builder.with_no_client_auth()),
    }
}

/// Reads every certificate in a PEM file; at least one is required.
fn pem_certs(path: &str) -> io::Result<Vec<CertificateDer<'static>>> {
    let pem = read_file(path)?;
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_slice_iter(&pem)
        .collect::<Result<_, _>>()
        .map_err(|e| pem_error(path, &e.to_string()))?;
    if certs.is_empty() {
        return Err(pem_error(path, "no certificates found"));
    }
    Ok(certs)
}

fn read_file(path: &str) -> io::Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| io::Error::new(e.kind(), format!("{path}: {e}")))
}

fn pem_error(path: &str, detail: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("{path}: {detail}"))
}
