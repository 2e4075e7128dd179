use chrono::Utc;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

const SIDE_CHANNEL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct CertExpiry {
    /// Whole days until not_after; negative once expired.
    pub days: i64,
    /// Short human form: "30d" at a day or more, else hours floored at "0h".
    pub human: String,
}

/// Read the peer certificate of `host:port` and compute time-to-expiry.
/// Verification is deliberately disabled: expiry must be observable even for
/// certificates that no longer validate. Returns None on any failure.
pub async fn certificate_expiry(host: String, port: u16) -> Option<CertExpiry> {
    tokio::time::timeout(SIDE_CHANNEL_TIMEOUT, fetch_expiry(host, port))
        .await
        .ok()
        .flatten()
}

async fn fetch_expiry(host: String, port: u16) -> Option<CertExpiry> {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerification))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let tcp = TcpStream::connect((host.as_str(), port)).await.ok()?;
    let server_name = ServerName::try_from(host.clone()).ok()?;
    let stream = connector.connect(server_name, tcp).await.ok()?;

    let (_, session) = stream.get_ref();
    let cert = session.peer_certificates()?.first()?;
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref()).ok()?;

    let not_after = parsed.validity().not_after.timestamp();
    let remaining = not_after - Utc::now().timestamp();
    let days = remaining.div_euclid(86_400);
    let human = if days >= 1 {
        format!("{days}d")
    } else {
        format!("{}h", (remaining / 3_600).max(0))
    };
    Some(CertExpiry { days, human })
}

/// Accept-everything verifier for the expiry side channel only. The primary
/// HTTP request keeps full verification.
#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA1,
            SignatureScheme::ECDSA_SHA1_Legacy,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}
