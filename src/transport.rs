//! Concrete realization of the abstract byte-stream transport described in §1/§6: a plain or
//! TLS-wrapped `tokio` TCP stream. The Engine is written against `AsyncRead + AsyncWrite`, so it
//! never has to know which variant it is holding — the same shape as the teacher crate's
//! `SocketFlowStream` enum.

use crate::config::SslVerify;
use crate::error::Error;
use crate::url::WsUrl;
use pki_types::ServerName;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{client::TlsStream, TlsConnector};

pub enum WsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for WsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            WsStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            WsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for WsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            WsStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            WsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            WsStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            WsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            WsStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            WsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Opens the transport for `url`, performing the TLS handshake when the scheme is `wss`, all
/// bounded by `connect_timeout` (§5, §9 Open Question (c)).
pub async fn connect(
    url: &WsUrl,
    ssl_verify: &SslVerify,
    connect_timeout: Duration,
) -> Result<WsStream, Error> {
    let tcp = timeout(connect_timeout, TcpStream::connect((url.host.as_str(), url.port)))
        .await??;

    if !url.use_tls {
        return Ok(WsStream::Plain(tcp));
    }

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    let client_config = build_client_config(ssl_verify)?;
    let connector = TlsConnector::from(Arc::new(client_config));
    let server_name = ServerName::try_from(url.host.clone())
        .map_err(|_| Error::TlsSetup(format!("invalid DNS name: {}", url.host)))?;

    let tls = timeout(connect_timeout, connector.connect(server_name, tcp))
        .await?
        .map_err(|err| Error::TlsSetup(err.to_string()))?;

    Ok(WsStream::Tls(Box::new(tls)))
}

fn build_client_config(ssl_verify: &SslVerify) -> Result<ClientConfig, Error> {
    match ssl_verify {
        SslVerify::None => {
            let mut config = ClientConfig::builder()
                .with_root_certificates(RootCertStore::empty())
                .with_no_client_auth();
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoCertificateVerification));
            Ok(config)
        }
        SslVerify::Peer => {
            let roots = default_root_store();
            Ok(ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth())
        }
        SslVerify::Custom(ca_file) => {
            let mut roots = default_root_store();
            let file = File::open(ca_file)?;
            let mut reader = BufReader::new(file);
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert.map_err(|err| Error::TlsSetup(err.to_string()))?;
                roots
                    .add(cert)
                    .map_err(|err| Error::TlsSetup(err.to_string()))?;
            }
            Ok(ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth())
        }
    }
}

fn default_root_store() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

/// Backs `SslVerify::None`. Only for local development against self-signed servers — the
/// connection is no more trustworthy than plaintext `ws://` once this is in use.
#[derive(Debug)]
struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &pki_types::CertificateDer<'_>,
        _intermediates: &[pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: pki_types::UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &pki_types::CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &pki_types::CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
