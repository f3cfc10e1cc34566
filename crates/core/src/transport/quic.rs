//! QUIC transport via `quinn` (present in the retrieval pack as
//! `geeklint-quinn`). Deliberately minimal per SPEC_FULL.md §4.3: one
//! bidirectional QUIC stream per physical carrier, no 0-RTT, no connection
//! migration handling, and a self-signed certificate generated with `rcgen`
//! (the same crate quinn's own `perf` example reaches for) rather than a
//! real PKI — acceptable for a reverse-tunnel transport where the client
//! already authenticates over the application-layer `Login` handshake.

use std::sync::Arc;

use async_trait::async_trait;
use quinn::{ClientConfig, Endpoint, ServerConfig};

use super::{Listener, Transport};
use crate::carrier::BoxedCarrier;
use crate::error::{Error, Result};
use crate::stream::JoinedCarrier;

pub struct QuicTransport;

impl QuicTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for QuicTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for QuicTransport {
    async fn dial(&self, addr: &str) -> Result<BoxedCarrier> {
        let server_addr: std::net::SocketAddr = addr
            .parse()
            .map_err(|_| Error::TransportDial(format!("invalid QUIC address: {addr}")))?;

        let mut endpoint = Endpoint::client("0.0.0.0:0".parse().unwrap())
            .map_err(|e| Error::TransportDial(e.to_string()))?;
        endpoint.set_default_client_config(insecure_client_config());

        let connection = endpoint
            .connect(server_addr, "retun")
            .map_err(|e| Error::TransportDial(e.to_string()))?
            .await
            .map_err(|e| Error::TransportDial(e.to_string()))?;

        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| Error::TransportDial(e.to_string()))?;

        Ok(Box::new(JoinedCarrier::new(recv, send)))
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>> {
        let bind_addr: std::net::SocketAddr = addr
            .parse()
            .map_err(|_| Error::TransportDial(format!("invalid QUIC bind address: {addr}")))?;

        let server_config = self_signed_server_config()?;
        let endpoint = Endpoint::server(server_config, bind_addr)
            .map_err(|e| Error::TransportDial(e.to_string()))?;

        Ok(Box::new(QuicListener { endpoint }))
    }
}

struct QuicListener {
    endpoint: Endpoint,
}

#[async_trait]
impl Listener for QuicListener {
    async fn accept(&mut self) -> Result<BoxedCarrier> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or(Error::PeerClosed)?;
        let connection = incoming
            .await
            .map_err(|e| Error::TransportDial(e.to_string()))?;
        let (send, recv) = connection
            .accept_bi()
            .await
            .map_err(|e| Error::TransportDial(e.to_string()))?;
        Ok(Box::new(JoinedCarrier::new(recv, send)))
    }
}

const ALPN: &[u8] = b"retun";

fn self_signed_server_config() -> Result<ServerConfig> {
    let rcgen::CertifiedKey { cert, signing_key } =
        rcgen::generate_simple_self_signed(vec!["retun".to_string()])
            .map_err(|e| Error::TransportDial(e.to_string()))?;

    let cert_der = cert.der().clone();
    let key_der = rustls::pki_types::PrivatePkcs8KeyDer::from(signing_key.serialize_der());

    let mut crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der.into())
        .map_err(|e| Error::TransportDial(e.to_string()))?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
        .expect("rustls provider supports QUIC");
    Ok(ServerConfig::with_crypto(Arc::new(quic_crypto)))
}

fn insecure_client_config() -> ClientConfig {
    let mut crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerification))
        .with_no_client_auth();
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
            .expect("rustls provider supports QUIC"),
    ))
}

#[derive(Debug)]
struct NoVerification;

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
