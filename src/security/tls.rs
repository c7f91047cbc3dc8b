//! TLS bundle: the certificate/key material shared by `tls://` and
//! `starttls://` listeners (spec.md §4.2).

use crate::error::{GatewayError, Result};
use rustls::ServerConfig;
use rustls_pemfile::{certs, pkcs8_private_keys};
use std::io::BufReader;
use std::sync::Arc;
use tracing::{debug, info};

/// TLS 1.3 suites plus ECDHE AEAD suites for 1.2, RSA AEAD as a fallback
/// without forward secrecy. `rustls` 0.21 only lets us configure the 1.2
/// suite list explicitly (1.3 suites are fixed by the protocol).
fn cipher_suites() -> Vec<rustls::SupportedCipherSuite> {
    use rustls::cipher_suite::*;
    vec![
        TLS13_AES_128_GCM_SHA256,
        TLS13_AES_256_GCM_SHA384,
        TLS13_CHACHA20_POLY1305_SHA256,
        TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        TLS_RSA_WITH_AES_128_GCM_SHA256,
        TLS_RSA_WITH_AES_256_GCM_SHA384,
    ]
}

/// Certificate bundle shared by every `tls://`/`starttls://` listener.
///
/// Built once at startup (and again on reload, swapped in atomically —
/// never mutated in place). Absent, `tls` and `starttls` listeners refuse
/// to start.
#[derive(Clone)]
pub struct TlsBundle {
    server_config: Arc<ServerConfig>,
    pub force_for_starttls: bool,
}

impl TlsBundle {
    /// Resolution order: inline PEM (key + certificate) wins if both parse;
    /// otherwise fall back to the file paths; otherwise "not configured".
    pub fn new(
        key_pem: &str,
        certificate_pem: &str,
        key_file: &str,
        certificate_file: &str,
        force_for_starttls: bool,
    ) -> Result<Self> {
        if key_pem.is_empty() && certificate_pem.is_empty() && key_file.is_empty() && certificate_file.is_empty() {
            return Err(GatewayError::Tls("TLS not configured".to_string()));
        }

        let (certs, key) = Self::load_inline(key_pem, certificate_pem)
            .or_else(|| Self::load_files(key_file, certificate_file))
            .ok_or_else(|| {
                GatewayError::Tls("invalid TLS configuration: no usable certificate/key pair".to_string())
            })?;

        let config = ServerConfig::builder()
            .with_cipher_suites(&cipher_suites())
            .with_safe_default_kx_groups()
            .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
            .map_err(|e| GatewayError::Tls(format!("unsupported cipher/protocol combination: {e}")))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| GatewayError::Tls(format!("failed to build TLS config: {e}")))?;

        info!("TLS bundle configured");

        Ok(TlsBundle {
            server_config: Arc::new(config),
            force_for_starttls,
        })
    }

    fn load_inline(key_pem: &str, certificate_pem: &str) -> Option<(Vec<rustls::Certificate>, rustls::PrivateKey)> {
        if key_pem.is_empty() || certificate_pem.is_empty() {
            return None;
        }

        let mut cert_reader = BufReader::new(certificate_pem.as_bytes());
        let certs = certs(&mut cert_reader).ok()?;
        if certs.is_empty() {
            return None;
        }

        let mut key_reader = BufReader::new(key_pem.as_bytes());
        let mut keys = pkcs8_private_keys(&mut key_reader).ok()?;
        if keys.is_empty() {
            return None;
        }

        debug!("loaded TLS material from inline PEM");
        Some((
            certs.into_iter().map(rustls::Certificate).collect(),
            rustls::PrivateKey(keys.remove(0)),
        ))
    }

    fn load_files(key_file: &str, certificate_file: &str) -> Option<(Vec<rustls::Certificate>, rustls::PrivateKey)> {
        if key_file.is_empty() || certificate_file.is_empty() {
            return None;
        }

        let cert_bytes = std::fs::read(certificate_file).ok()?;
        let mut cert_reader = BufReader::new(cert_bytes.as_slice());
        let certs = certs(&mut cert_reader).ok()?;
        if certs.is_empty() {
            return None;
        }

        let key_bytes = std::fs::read(key_file).ok()?;
        let mut key_reader = BufReader::new(key_bytes.as_slice());
        let mut keys = pkcs8_private_keys(&mut key_reader).ok()?;
        if keys.is_empty() {
            return None;
        }

        debug!(certificate_file, key_file, "loaded TLS material from files");
        Some((
            certs.into_iter().map(rustls::Certificate).collect(),
            rustls::PrivateKey(keys.remove(0)),
        ))
    }

    pub fn acceptor(&self) -> tokio_rustls::TlsAcceptor {
        tokio_rustls::TlsAcceptor::from(self.server_config.clone())
    }

    /// Client-side config for the outbound relay connection. `verify_tls =
    /// false` maps from `InsecureSkipVerify` on the upstream relay target.
    pub fn client_config(verify_tls: bool) -> Arc<rustls::ClientConfig> {
        if verify_tls {
            let mut roots = rustls::RootCertStore::empty();
            roots.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
                rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
                    ta.subject.to_vec(),
                    ta.spki.to_vec(),
                    ta.name_constraints.map(|nc| nc.to_vec()),
                )
            }));
            Arc::new(
                rustls::ClientConfig::builder()
                    .with_safe_defaults()
                    .with_root_certificates(roots)
                    .with_no_client_auth(),
            )
        } else {
            Arc::new(
                rustls::ClientConfig::builder()
                    .with_safe_defaults()
                    .with_custom_certificate_verifier(Arc::new(NoVerifier))
                    .with_no_client_auth(),
            )
        }
    }
}

/// Accepts any certificate chain. Used only when `verify_tls = false` on an
/// outbound relay connection.
struct NoVerifier;

impl rustls::client::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

/// Self-signed certificate generation, used by tests to exercise
/// [`TlsBundle::new`] without shipping fixture PEM files in the repo.
#[cfg(test)]
fn self_signed_pem(domain: &str) -> (String, String) {
    use rcgen::{CertificateParams, DistinguishedName};

    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params.subject_alt_names = vec![rcgen::SanType::DnsName(domain.to_string())];

    let cert = rcgen::Certificate::from_params(params).unwrap();
    (cert.serialize_private_key_pem(), cert.serialize_pem().unwrap())
}
