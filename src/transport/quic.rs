//! QUIC transport setup
//!
//! The server presents a freshly generated self-signed certificate; the client
//! skips verification. Identity is asserted in-band after the stream opens, so
//! TLS here only provides transport encryption. Each client uses exactly one
//! bidirectional stream, wrapped in [`QuicBiStream`] so the session code can
//! treat it like any other byte stream.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use quinn::{Connection, Endpoint, RecvStream, SendStream};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::error::{ChatError, Result};

/// ALPN protocol id spoken on the QUIC transport
pub const ALPN: &[u8] = b"chatmesh";

/// Server name the client presents; the server certificate is issued for it
pub const SERVER_NAME: &str = "localhost";

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build a QUIC server config around a new self-signed certificate
pub fn self_signed_server_config(names: Vec<String>) -> Result<quinn::ServerConfig> {
    let certified = rcgen::generate_simple_self_signed(names)
        .map_err(|e| ChatError::config(format!("Failed to generate certificate: {}", e)))?;

    let cert_der = CertificateDer::from(certified.cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

    let mut tls = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)?;

    tls.alpn_protocols = vec![ALPN.to_vec()];
    tls.max_early_data_size = 0;

    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls)
        .map_err(|e| ChatError::config(format!("Failed to create QUIC config: {}", e)))?;

    Ok(quinn::ServerConfig::with_crypto(Arc::new(crypto)))
}

/// Build a QUIC client config that accepts any server certificate
pub fn insecure_client_config() -> Result<quinn::ClientConfig> {
    let provider = crypto_provider();
    let mut tls = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
        .with_no_client_auth();

    tls.alpn_protocols = vec![ALPN.to_vec()];

    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
        .map_err(|e| ChatError::config(format!("Failed to create QUIC config: {}", e)))?;

    Ok(quinn::ClientConfig::new(Arc::new(crypto)))
}

/// Bind a server endpoint with a self-signed certificate
pub fn server_endpoint(bind_addr: SocketAddr) -> Result<Endpoint> {
    let config = self_signed_server_config(vec![SERVER_NAME.to_string()])?;
    let endpoint = Endpoint::server(config, bind_addr)
        .map_err(|e| ChatError::transport(format!("Failed to create endpoint: {}", e)))?;
    debug!(addr = %bind_addr, "QUIC server endpoint bound");
    Ok(endpoint)
}

/// Bind a client endpoint on an ephemeral port
pub fn client_endpoint() -> Result<Endpoint> {
    let bind: SocketAddr = ([0, 0, 0, 0], 0).into();
    let mut endpoint = Endpoint::client(bind)
        .map_err(|e| ChatError::transport(format!("Failed to create endpoint: {}", e)))?;
    endpoint.set_default_client_config(insecure_client_config()?);
    Ok(endpoint)
}

/// One bidirectional QUIC stream as a single `AsyncRead + AsyncWrite`
///
/// Holds the connection so it stays open as long as the stream is in use.
pub struct QuicBiStream {
    send: SendStream,
    recv: RecvStream,
    connection: Connection,
}

impl QuicBiStream {
    /// Open the client's stream on an established connection
    pub async fn open(connection: Connection) -> Result<Self> {
        let (send, recv) = connection.open_bi().await?;
        Ok(Self {
            send,
            recv,
            connection,
        })
    }

    /// Accept the stream a client opened
    pub async fn accept(connection: Connection) -> Result<Self> {
        let (send, recv) = connection.accept_bi().await?;
        Ok(Self {
            send,
            recv,
            connection,
        })
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl AsyncRead for QuicBiStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        AsyncRead::poll_read(Pin::new(&mut self.get_mut().recv), cx, buf)
    }
}

impl AsyncWrite for QuicBiStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(Pin::new(&mut self.get_mut().send), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_flush(Pin::new(&mut self.get_mut().send), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncWrite::poll_shutdown(Pin::new(&mut self.get_mut().send), cx)
    }
}

/// Certificate verifier that accepts any certificate (INSECURE - development only)
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
