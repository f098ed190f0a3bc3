//! Peer-certificate admission
//!
//! Every control connection must present a client certificate. The client's
//! identity is the lowercase hex SHA-1 digest of the DER-encoded subject
//! public key, checked against the allow-list snapshot. The digest is a
//! fingerprint of an operator-provisioned key, not a signature primitive.

use super::allowlist::Allowlist;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};
use x509_parser::prelude::*;

/// Close reason when no usable certificate was presented
pub const REASON_NO_CERT: &str = "Client certificate required";

/// Close reason when the key digest is not authorized
pub const REASON_NOT_WHITELISTED: &str = "Client certificate not whitelisted";

/// Digest the subject public key of a DER-encoded certificate.
///
/// Returns `None` when the certificate cannot be parsed.
pub fn key_digest(cert_der: &[u8]) -> Option<String> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| debug!("unparseable client certificate: {:?}", e))
        .ok()?;
    let spki = cert.tbs_certificate.subject_pki.raw;
    Some(hex::encode(Sha1::digest(spki)))
}

/// Decide whether a peer may keep its control channel.
///
/// Returns the admitted key digest, or the rejection reason to close the
/// channel with.
pub fn admit(peer_cert: Option<&[u8]>, allowlist: &Allowlist) -> Result<String, &'static str> {
    let cert = match peer_cert {
        Some(cert) if !cert.is_empty() => cert,
        _ => {
            warn!("rejecting control channel: no client certificate");
            return Err(REASON_NO_CERT);
        }
    };

    let digest = match key_digest(cert) {
        Some(digest) => digest,
        None => {
            warn!("rejecting control channel: certificate has no readable key");
            return Err(REASON_NO_CERT);
        }
    };

    if !allowlist.contains(&digest) {
        warn!("rejecting control channel: key {} not whitelisted", digest);
        return Err(REASON_NOT_WHITELISTED);
    }

    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cert() -> (Vec<u8>, String) {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec!["client.test".to_string()]).unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        let expected = hex::encode(Sha1::digest(key_pair.public_key_der()));
        (cert.der().as_ref().to_vec(), expected)
    }

    fn empty_allowlist() -> std::sync::Arc<Allowlist> {
        let path = std::env::temp_dir().join(format!(
            "portgate-admission-{}-{:x}",
            std::process::id(),
            rand::random::<u64>()
        ));
        Allowlist::load(path).unwrap()
    }

    #[test]
    fn test_digest_matches_subject_public_key_info() {
        let (der, expected) = test_cert();
        assert_eq!(key_digest(&der).unwrap(), expected);
    }

    #[test]
    fn test_digest_rejects_garbage() {
        assert!(key_digest(b"not a certificate").is_none());
    }

    #[test]
    fn test_admit_requires_certificate() {
        let allowlist = empty_allowlist();
        assert_eq!(admit(None, &allowlist), Err(REASON_NO_CERT));
        assert_eq!(admit(Some(&[]), &allowlist), Err(REASON_NO_CERT));
    }

    #[test]
    fn test_admit_checks_allowlist() {
        let (der, digest) = test_cert();
        let allowlist = empty_allowlist();

        assert_eq!(admit(Some(&der), &allowlist), Err(REASON_NOT_WHITELISTED));

        // whitelist the key and retry
        let path = std::env::temp_dir().join(format!(
            "portgate-admission-ok-{}-{:x}",
            std::process::id(),
            rand::random::<u64>()
        ));
        std::fs::write(&path, format!("{}\n", digest)).unwrap();
        let allowlist = Allowlist::load(&path).unwrap();
        assert_eq!(admit(Some(&der), &allowlist), Ok(digest));
        let _ = std::fs::remove_file(&path);
    }
}
