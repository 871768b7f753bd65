use std::sync::Arc;
use std::sync::OnceLock;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

/// Builds the client TLS configuration used when upgrading a connection to `host`.
///
/// With `allow_self_signed` unset, certificates are validated against the bundled
/// Mozilla roots. Otherwise any chain is accepted as long as the end-entity
/// certificate names the host.
pub fn build_tls_config(
    allow_self_signed: bool,
    host: &str,
) -> std::io::Result<Arc<rustls::ClientConfig>> {
    let builder = rustls::ClientConfig::builder_with_provider(get_crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| std::io::Error::other(format!("Failed to select TLS versions: {e}")))?;

    let config = if allow_self_signed {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(HostnameOnlyVerifier::new(host)))
            .with_no_client_auth()
    } else {
        let webpki_verifier = rustls::client::WebPkiServerVerifier::builder_with_provider(
            get_root_cert_store(),
            get_crypto_provider(),
        )
        .build()
        .map_err(|e| std::io::Error::other(format!("Failed to build certificate verifier: {e}")))?;
        builder
            .with_webpki_verifier(webpki_verifier)
            .with_no_client_auth()
    };

    Ok(Arc::new(config))
}

pub fn server_name_for(host: &str) -> std::io::Result<ServerName<'static>> {
    ServerName::try_from(host.to_string()).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Invalid TLS server name {host}: {e}"),
        )
    })
}

/// Skips chain validation but still requires the certificate to be issued for
/// the target host, either exactly or through a wildcard on its parent domain.
#[derive(Debug)]
pub struct HostnameOnlyVerifier {
    host: String,
    supported_algs: rustls::crypto::WebPkiSupportedAlgorithms,
}

impl HostnameOnlyVerifier {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            supported_algs: get_supported_algorithms(),
        }
    }

    fn wildcard_name(&self) -> Option<String> {
        self.host
            .split_once('.')
            .map(|(_, parent)| format!("*.{parent}"))
    }

    fn name_matches(&self, name: &str) -> bool {
        if name.eq_ignore_ascii_case(&self.host) {
            return true;
        }
        match self.wildcard_name() {
            Some(wildcard) => name.eq_ignore_ascii_case(&wildcard),
            None => false,
        }
    }

    fn check_names(&self, end_entity: &[u8]) -> Result<(), rustls::Error> {
        let (_, cert) = X509Certificate::from_der(end_entity).map_err(|e| {
            rustls::Error::General(format!("Failed to parse X.509 certificate: {e}"))
        })?;

        let common_name_match = cert
            .subject()
            .iter_common_name()
            .filter_map(|attr| attr.as_str().ok())
            .any(|name| self.name_matches(name));
        if common_name_match {
            return Ok(());
        }

        if let Ok(Some(san)) = cert.subject_alternative_name() {
            let san_match = san.value.general_names.iter().any(|name| match name {
                GeneralName::DNSName(dns) => self.name_matches(dns),
                _ => false,
            });
            if san_match {
                return Ok(());
            }
        }

        Err(rustls::Error::General(format!(
            "no name matching {} found",
            self.host
        )))
    }
}

impl ServerCertVerifier for HostnameOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        self.check_names(end_entity.as_ref())?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported_algs)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported_algs)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.supported_algs.supported_schemes()
    }
}

pub fn get_crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    static INSTANCE: OnceLock<Arc<rustls::crypto::CryptoProvider>> = OnceLock::new();
    INSTANCE
        .get_or_init(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
        .clone()
}

fn get_supported_algorithms() -> rustls::crypto::WebPkiSupportedAlgorithms {
    get_crypto_provider().signature_verification_algorithms
}

fn get_root_cert_store() -> Arc<rustls::RootCertStore> {
    static INSTANCE: OnceLock<Arc<rustls::RootCertStore>> = OnceLock::new();
    INSTANCE
        .get_or_init(|| {
            let root_store = rustls::RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            Arc::new(root_store)
        })
        .clone()
}
