//! Workload identity: SVID source abstraction and identity-bound mTLS
//!
//! The gateway does not talk to a workload API itself; it consumes an
//! [`IdentitySource`] that yields the current certificate and trust
//! bundle. Upstream connections bound to an identity use an mTLS client
//! configuration whose server verification requires a specific peer ID
//! among the presented certificate's URI SANs.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tracing::debug;

use crate::error::{GatewayError, Result};

/// A workload certificate: leaf-first chain plus its private key
pub struct Svid {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// Source of the gateway's own identity material.
///
/// Implementations are expected to be internally synchronized and to
/// return the current (possibly recently rotated) credentials on every
/// call.
pub trait IdentitySource: Send + Sync {
    /// The current workload certificate and key
    fn svid(&self) -> Result<Svid>;

    /// The current trust bundle (DER certificates)
    fn trust_bundle(&self) -> Result<Vec<CertificateDer<'static>>>;
}

/// Authorized-server-ID pattern with `{{namespace}}` and `{{name}}`
/// placeholders resolved against the selected backend
#[derive(Clone, Debug)]
pub struct ServerIdTemplate(String);

impl ServerIdTemplate {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    /// Substitute the placeholders for a concrete backend
    pub fn resolve(&self, namespace: &str, name: &str) -> String {
        self.0
            .replace("{{namespace}}", namespace)
            .replace("{{name}}", name)
    }
}

/// Identity source backed by PEM files in a directory.
///
/// Files follow the conventional names `tls.crt`, `tls.key`, and
/// `ca.crt`. The files are re-read on every call so a rotated
/// certificate is picked up without a restart.
pub struct DiskIdentitySource {
    dir: PathBuf,
}

impl DiskIdentitySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl IdentitySource for DiskIdentitySource {
    fn svid(&self) -> Result<Svid> {
        let cert_pem = fs::read(self.dir.join("tls.crt"))?;
        let key_pem = fs::read(self.dir.join("tls.key"))?;
        Ok(Svid {
            cert_chain: load_certificates(&cert_pem)?,
            key: load_private_key(&key_pem)?,
        })
    }

    fn trust_bundle(&self) -> Result<Vec<CertificateDer<'static>>> {
        let bundle_pem = fs::read(self.dir.join("ca.crt"))?;
        let bundle = load_certificates(&bundle_pem)?;
        if bundle.is_empty() {
            return Err(GatewayError::Identity(
                "no certificates in trust bundle".to_string(),
            ));
        }
        Ok(bundle)
    }
}

/// Parse certificates from PEM-encoded data
pub fn load_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(pem);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|err| GatewayError::Tls(format!("failed to parse certificates: {err}")))
}

/// Parse the first private key from PEM-encoded data
pub fn load_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut reader = std::io::BufReader::new(pem);
    for item in rustls_pemfile::read_all(&mut reader) {
        match item.map_err(|err| GatewayError::Tls(format!("failed to parse private key: {err}")))? {
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            _ => {}
        }
    }
    Err(GatewayError::Tls("no private key found in PEM data".to_string()))
}

/// Build an mTLS client configuration that presents the source's SVID
/// and accepts only servers whose certificate chains to the source's
/// trust bundle and carries `authorized_id` among its URI SANs
pub fn mtls_client_config(
    source: &dyn IdentitySource,
    authorized_id: &str,
) -> Result<ClientConfig> {
    let svid = source.svid()?;
    let bundle = source.trust_bundle()?;
    let verifier = PeerIdVerifier::new(bundle, authorized_id.to_string());

    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(svid.cert_chain, svid.key)
        .map_err(|err| GatewayError::Tls(format!("failed to build client config: {err}")))
}

/// Server certificate verifier for identity-bound upstream dials.
///
/// The chain is validated against the trust bundle; the conventional
/// hostname check is replaced by an exact match of the authorized peer
/// ID against the end-entity certificate's URI SANs.
#[derive(Debug)]
struct PeerIdVerifier {
    roots: Vec<CertificateDer<'static>>,
    authorized_id: String,
    supported: WebPkiSupportedAlgorithms,
}

impl PeerIdVerifier {
    fn new(roots: Vec<CertificateDer<'static>>, authorized_id: String) -> Self {
        Self {
            roots,
            authorized_id,
            supported: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

fn bad_certificate(reason: impl std::fmt::Display) -> rustls::Error {
    debug!("rejecting peer certificate: {}", reason);
    rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding)
}

impl ServerCertVerifier for PeerIdVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let anchors = self
            .roots
            .iter()
            .map(|root| webpki::anchor_from_trusted_cert(root))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(bad_certificate)?;

        let cert = webpki::EndEntityCert::try_from(end_entity).map_err(bad_certificate)?;
        cert.verify_for_usage(
            self.supported.all,
            &anchors,
            intermediates,
            now,
            webpki::KeyUsage::server_auth(),
            None,
            None,
        )
        .map_err(|err| {
            debug!("peer certificate did not verify: {}", err);
            rustls::Error::InvalidCertificate(rustls::CertificateError::NotValidForName)
        })?;

        let sans = uri_sans(end_entity).map_err(bad_certificate)?;
        if !sans.iter().any(|san| san == &self.authorized_id) {
            debug!(
                "peer id {:?} not among presented ids {:?}",
                self.authorized_id, sans
            );
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::NotValidForName,
            ));
        }

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported.supported_schemes()
    }
}

/// Extract the URI subject-alternative-names from a DER certificate
pub(crate) fn uri_sans(der: &CertificateDer<'_>) -> std::result::Result<Vec<String>, String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref())
        .map_err(|err| format!("parsing certificate: {err}"))?;

    let mut sans = Vec::new();
    if let Ok(Some(extension)) = cert.subject_alternative_name() {
        for name in &extension.value.general_names {
            if let x509_parser::extensions::GeneralName::URI(uri) = name {
                sans.push(uri.to_string());
            }
        }
    }
    Ok(sans)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rcgen::{
        BasicConstraints, CertificateParams, ExtendedKeyUsagePurpose, IsCa, KeyPair, SanType,
    };

    /// Self-contained CA + leaf material for identity tests
    pub(crate) struct TestPki {
        pub ca_der: CertificateDer<'static>,
        pub leaf_der: CertificateDer<'static>,
        pub leaf_key_pem: String,
        pub ca_pem: String,
        pub leaf_pem: String,
    }

    pub(crate) fn test_pki(leaf_id: &str) -> TestPki {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let mut leaf_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        leaf_params
            .subject_alt_names
            .push(SanType::URI(leaf_id.try_into().unwrap()));
        leaf_params
            .extended_key_usages
            .push(ExtendedKeyUsagePurpose::ServerAuth);
        let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

        TestPki {
            ca_der: ca_cert.der().clone(),
            leaf_der: leaf_cert.der().clone(),
            leaf_key_pem: leaf_key.serialize_pem(),
            ca_pem: ca_cert.pem(),
            leaf_pem: leaf_cert.pem(),
        }
    }

    pub(crate) struct StaticIdentity {
        pub pki: TestPki,
    }

    impl IdentitySource for StaticIdentity {
        fn svid(&self) -> Result<Svid> {
            Ok(Svid {
                cert_chain: vec![self.pki.leaf_der.clone()],
                key: load_private_key(self.pki.leaf_key_pem.as_bytes())?,
            })
        }

        fn trust_bundle(&self) -> Result<Vec<CertificateDer<'static>>> {
            Ok(vec![self.pki.ca_der.clone()])
        }
    }

    #[test]
    fn test_template_resolution() {
        let template = ServerIdTemplate::new("spiffe://cluster.local/ns/{{namespace}}/sa/{{name}}");
        assert_eq!(
            template.resolve("prod", "backend"),
            "spiffe://cluster.local/ns/prod/sa/backend"
        );
    }

    #[test]
    fn test_template_without_placeholders() {
        let template = ServerIdTemplate::new("spiffe://cluster.local/gateway");
        assert_eq!(template.resolve("prod", "backend"), "spiffe://cluster.local/gateway");
    }

    #[test]
    fn test_uri_san_extraction() {
        let pki = test_pki("spiffe://cluster.local/ns/prod/sa/backend");
        let sans = uri_sans(&pki.leaf_der).unwrap();
        assert_eq!(sans, vec!["spiffe://cluster.local/ns/prod/sa/backend"]);
    }

    #[test]
    fn test_peer_verifier_accepts_authorized_id() {
        let id = "spiffe://cluster.local/ns/prod/sa/backend";
        let pki = test_pki(id);
        let verifier = PeerIdVerifier::new(vec![pki.ca_der.clone()], id.to_string());
        let name = ServerName::try_from("backend.prod").unwrap();
        let result = verifier.verify_server_cert(
            &pki.leaf_der,
            &[],
            &name,
            &[],
            UnixTime::now(),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_peer_verifier_rejects_other_id() {
        let pki = test_pki("spiffe://cluster.local/ns/prod/sa/backend");
        let verifier = PeerIdVerifier::new(
            vec![pki.ca_der.clone()],
            "spiffe://cluster.local/ns/prod/sa/other".to_string(),
        );
        let name = ServerName::try_from("backend.prod").unwrap();
        let result = verifier.verify_server_cert(
            &pki.leaf_der,
            &[],
            &name,
            &[],
            UnixTime::now(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_peer_verifier_rejects_untrusted_chain() {
        let id = "spiffe://cluster.local/ns/prod/sa/backend";
        let pki = test_pki(id);
        let unrelated = test_pki(id);
        let verifier = PeerIdVerifier::new(vec![unrelated.ca_der.clone()], id.to_string());
        let name = ServerName::try_from("backend.prod").unwrap();
        let result = verifier.verify_server_cert(
            &pki.leaf_der,
            &[],
            &name,
            &[],
            UnixTime::now(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_disk_identity_source() {
        let pki = test_pki("spiffe://cluster.local/ns/prod/sa/gateway");
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tls.crt"), &pki.leaf_pem).unwrap();
        std::fs::write(dir.path().join("tls.key"), &pki.leaf_key_pem).unwrap();
        std::fs::write(dir.path().join("ca.crt"), &pki.ca_pem).unwrap();

        let source = DiskIdentitySource::new(dir.path());
        let svid = source.svid().unwrap();
        assert_eq!(svid.cert_chain.len(), 1);
        assert_eq!(source.trust_bundle().unwrap().len(), 1);
    }

    #[test]
    fn test_mtls_client_config_builds() {
        let pki = test_pki("spiffe://cluster.local/ns/prod/sa/gateway");
        let source = StaticIdentity { pki };
        assert!(mtls_client_config(&source, "spiffe://cluster.local/ns/prod/sa/backend").is_ok());
    }
}
