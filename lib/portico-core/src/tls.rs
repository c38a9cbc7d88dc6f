//! HTTPS listener: SNI-driven certificate selection over the same
//! request dispatch as the HTTP listener

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use hyper_util::rt::TokioIo;
use rustls::{RootCertStore, ServerConfig};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use crate::error::{GatewayError, Result};
use crate::identity::{load_certificates, load_private_key};
use crate::instance::Instance;
use crate::listener::{serve_connection, ConnInfo, HttpListener, ServerTimeouts};

/// A `host:directory` TLS configuration entry. The directory holds a
/// PEM pair under the conventional names `tls.crt` and `tls.key`.
#[derive(Clone, Debug, PartialEq)]
pub struct TlsEntry {
    pub host: String,
    pub dir: PathBuf,
}

impl FromStr for TlsEntry {
    type Err = GatewayError;

    fn from_str(value: &str) -> Result<Self> {
        match value.split_once(':') {
            Some((host, dir)) if !host.is_empty() && !dir.is_empty() => Ok(TlsEntry {
                host: host.to_string(),
                dir: PathBuf::from(dir),
            }),
            _ => Err(GatewayError::Tls(format!(
                "unexpected tls value {value:?}, want host:directory"
            ))),
        }
    }
}

/// One loaded certificate, matched by exact hostname equality against
/// the SNI server name
struct CertificateEntry {
    host: String,
    certified: Arc<CertifiedKey>,
}

impl CertificateEntry {
    fn load(entry: &TlsEntry) -> Result<Self> {
        let cert_pem = fs::read(entry.dir.join("tls.crt"))?;
        let key_pem = fs::read(entry.dir.join("tls.key"))?;

        let chain = load_certificates(&cert_pem)?;
        if chain.is_empty() {
            return Err(GatewayError::Tls(format!(
                "no certificates found in {:?}",
                entry.dir.join("tls.crt")
            )));
        }
        let key = load_private_key(&key_pem)?;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|err| GatewayError::Tls(format!("unsupported private key: {err}")))?;

        Ok(Self {
            host: entry.host.clone(),
            certified: Arc::new(CertifiedKey::new(chain, signing_key)),
        })
    }

    fn matches(&self, hostname: &str) -> bool {
        self.host == hostname
    }
}

/// Returns the first certificate whose host equals the SNI server
/// name; no wildcard expansion. No match means no certificate, which
/// fails the handshake downstream.
struct SniCertResolver {
    certificates: Vec<CertificateEntry>,
}

impl SniCertResolver {
    fn find(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        for certificate in &self.certificates {
            if certificate.matches(server_name) {
                return Some(certificate.certified.clone());
            }
        }
        info!("no certificate found for https server name {:?}", server_name);
        None
    }
}

impl fmt::Debug for SniCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hosts: Vec<&str> = self
            .certificates
            .iter()
            .map(|certificate| certificate.host.as_str())
            .collect();
        f.debug_struct("SniCertResolver").field("hosts", &hosts).finish()
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name()?;
        self.find(server_name)
    }
}

/// TLS listener wrapping the HTTP listener's dispatch. Client
/// certificates are requested but not required; client roots come from
/// the instance's identity source when one is configured.
pub struct HttpsListener {
    instance: Arc<Instance>,
    timeouts: ServerTimeouts,
    tls_config: Arc<ServerConfig>,
}

impl HttpsListener {
    pub(crate) fn new(
        instance: Arc<Instance>,
        http: &HttpListener,
        entries: &[TlsEntry],
    ) -> Result<Self> {
        let mut certificates = Vec::new();
        for entry in entries {
            certificates.push(CertificateEntry::load(entry)?);
        }
        let resolver = Arc::new(SniCertResolver { certificates });

        let builder = ServerConfig::builder();
        let config = match instance.identity() {
            Some(source) => {
                let mut roots = RootCertStore::empty();
                for cert in source.trust_bundle()? {
                    roots
                        .add(cert)
                        .map_err(|err| GatewayError::Tls(format!("adding trust bundle root: {err}")))?;
                }
                let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                    .allow_unauthenticated()
                    .build()
                    .map_err(|err| GatewayError::Tls(format!("building client verifier: {err}")))?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        }
        .with_cert_resolver(resolver);

        Ok(Self {
            instance,
            timeouts: http.timeouts().clone(),
            tls_config: Arc::new(config),
        })
    }

    /// Bind the address and serve TLS connections until process exit
    pub async fn start(&self, listen: &str) -> Result<()> {
        let listener = TcpListener::bind(listen).await?;
        let acceptor = TlsAcceptor::from(self.tls_config.clone());
        info!("listening for https on {}", listen);

        let instance = self.instance.clone();
        let timeouts = self.timeouts.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        debug!("error accepting connection: {}", err);
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let instance = instance.clone();
                let timeouts = timeouts.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(tls_stream) => tls_stream,
                        Err(err) => {
                            debug!("tls handshake failed from {}: {}", peer_addr, err);
                            return;
                        }
                    };

                    let peer_certificates = tls_stream
                        .get_ref()
                        .1
                        .peer_certificates()
                        .map(|certs| certs.to_vec())
                        .unwrap_or_default();
                    let conn = ConnInfo {
                        tls: true,
                        peer_certificates,
                    };

                    serve_connection(TokioIo::new(tls_stream), instance, timeouts, conn, peer_addr)
                        .await;
                });
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::tests::{test_pki, StaticIdentity};

    fn write_cert_dir(dir: &std::path::Path, id: &str) {
        let pki = test_pki(id);
        fs::write(dir.join("tls.crt"), &pki.leaf_pem).unwrap();
        fs::write(dir.join("tls.key"), &pki.leaf_key_pem).unwrap();
    }

    #[test]
    fn test_tls_entry_parsing() {
        let entry: TlsEntry = "a.example.com:/etc/certs/a".parse().unwrap();
        assert_eq!(entry.host, "a.example.com");
        assert_eq!(entry.dir, PathBuf::from("/etc/certs/a"));

        assert!("no-separator".parse::<TlsEntry>().is_err());
        assert!(":/etc/certs".parse::<TlsEntry>().is_err());
        assert!("host:".parse::<TlsEntry>().is_err());
    }

    #[test]
    fn test_certificate_loading_and_sni_match() {
        let dir = tempfile::tempdir().unwrap();
        write_cert_dir(dir.path(), "spiffe://cluster.local/ns/prod/sa/a");

        let entry = CertificateEntry::load(&TlsEntry {
            host: "a.example.com".to_string(),
            dir: dir.path().to_path_buf(),
        })
        .unwrap();
        assert!(entry.matches("a.example.com"));
        assert!(!entry.matches("b.example.com"));
        assert!(!entry.matches("sub.a.example.com"));
    }

    #[test]
    fn test_certificate_load_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let result = CertificateEntry::load(&TlsEntry {
            host: "a.example.com".to_string(),
            dir: dir.path().to_path_buf(),
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_sni_resolver_exact_match_only() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        write_cert_dir(dir_a.path(), "spiffe://cluster.local/ns/prod/sa/a");
        write_cert_dir(dir_b.path(), "spiffe://cluster.local/ns/prod/sa/b");

        let resolver = SniCertResolver {
            certificates: vec![
                CertificateEntry::load(&TlsEntry {
                    host: "a.example.com".to_string(),
                    dir: dir_a.path().to_path_buf(),
                })
                .unwrap(),
                CertificateEntry::load(&TlsEntry {
                    host: "b.example.com".to_string(),
                    dir: dir_b.path().to_path_buf(),
                })
                .unwrap(),
            ],
        };

        assert!(resolver.find("a.example.com").is_some());
        assert!(resolver.find("b.example.com").is_some());
        // SNI for an unknown host gets no certificate at all.
        assert!(resolver.find("c.example.com").is_none());
    }

    #[tokio::test]
    async fn test_https_listener_config_with_identity() {
        let dir = tempfile::tempdir().unwrap();
        write_cert_dir(dir.path(), "spiffe://cluster.local/ns/prod/sa/gw");

        let source: Arc<dyn crate::identity::IdentitySource> = Arc::new(StaticIdentity {
            pki: test_pki("spiffe://cluster.local/ns/prod/sa/gw"),
        });
        let instance = Arc::new(Instance::new(Some(source), None).unwrap());
        let http = instance.add_http_listener();
        let https = instance.add_https_listener(
            &http,
            &[TlsEntry {
                host: "a.example.com".to_string(),
                dir: dir.path().to_path_buf(),
            }],
        );
        assert!(https.is_ok());
    }
}
