//! TLS context construction for the control channel
//!
//! Both sides authenticate with certificates, but neither side validates a
//! signature chain: the server identifies clients by the SHA-1 digest of
//! their subject public key against an operator-provisioned allow-list, so
//! the allow-list is the trust root. The server therefore requests (without
//! chain-verifying) the client certificate, and the client skips web-PKI
//! verification of the server certificate.

use crate::Error;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Load a TLS certificate chain from a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
    let certs: Vec<_> = rustls_pemfile::certs(&mut file).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load a TLS private key from a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
    rustls_pemfile::private_key(&mut file)?.ok_or_else(|| {
        Error::Config(format!("no private key found in {}", path.display()))
    })
}

/// Build the server-side TLS config: present our certificate, request the
/// client's without requiring a verifiable chain.
pub fn server_config(cert_path: &Path, key_path: &Path) -> Result<rustls::ServerConfig, Error> {
    install_provider();

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(RequestAnyClientCert))
        .with_single_cert(certs, key)?;

    info!("TLS enabled with cert: {}", cert_path.display());
    Ok(config)
}

/// Build the client-side TLS config with our certificate attached
pub fn client_config(cert_path: &Path, key_path: &Path) -> Result<rustls::ClientConfig, Error> {
    install_provider();

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_client_auth_cert(certs, key)?;

    Ok(config)
}

fn install_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn supported_schemes() -> Vec<SignatureScheme> {
    rustls::crypto::ring::default_provider()
        .signature_verification_algorithms
        .supported_schemes()
}

/// Accepts whatever certificate the client presents. Admission decides on
/// the key digest afterwards, so a missing or unknown certificate must get
/// through the handshake to be rejected with a proper close code.
#[derive(Debug)]
struct RequestAnyClientCert;

impl ClientCertVerifier for RequestAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
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
        supported_schemes()
    }
}

/// Skips web-PKI validation of the server certificate
#[derive(Debug)]
struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
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
        supported_schemes()
    }
}
