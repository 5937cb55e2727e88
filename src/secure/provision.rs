// src/secure/provision.rs

//! TLS provisioning: turning per-host credential material into a ready
//! `rustls::ClientConfig`, restricted to the approved TLS 1.3 suites.

use crate::config::HostInfo;
use crate::core::FabricError;
use async_trait::async_trait;
use dashmap::DashMap;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, SupportedCipherSuite};
use std::sync::Arc;
use tracing::{debug, warn};

/// The cipher suites this client will offer.
static ALLOWED_SUITES: &[SupportedCipherSuite] = &[
    rustls::crypto::aws_lc_rs::cipher_suite::TLS13_AES_256_GCM_SHA384,
    rustls::crypto::aws_lc_rs::cipher_suite::TLS13_AES_128_GCM_SHA256,
    rustls::crypto::aws_lc_rs::cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
];

/// PEM material for one secure host.
#[derive(Debug, Default, Clone)]
pub struct Credentials {
    /// Extra trust anchors, appended to the built-in webpki roots.
    pub ca_pem: Option<Vec<u8>>,
    /// Client identity certificate chain, if the fabric requires one.
    pub cert_pem: Option<Vec<u8>>,
    /// Private key matching `cert_pem`.
    pub key_pem: Option<Vec<u8>>,
}

/// Supplies credentials for secure hosts. Implementations may prompt a
/// user, read a keystore, or consult an agent; a denial is final and
/// aborts the connection attempt rather than retrying.
#[async_trait]
pub trait CredentialAssistant: Send + Sync {
    async fn credentials(&self, host: &HostInfo) -> Result<Credentials, FabricError>;
}

/// Builds client TLS configurations on demand.
#[async_trait]
pub trait TlsProvisioner: Send + Sync {
    async fn client_config(&self, host: &HostInfo) -> Result<Arc<ClientConfig>, FabricError>;
}

/// Default provisioner: webpki trust anchors plus whatever the assistant
/// supplies, one cached config per endpoint.
pub struct DefaultTlsProvisioner {
    assistant: Option<Arc<dyn CredentialAssistant>>,
    cache: DashMap<String, Arc<ClientConfig>>,
}

impl DefaultTlsProvisioner {
    pub fn new(assistant: Option<Arc<dyn CredentialAssistant>>) -> Self {
        Self {
            assistant,
            cache: DashMap::new(),
        }
    }

    fn build_config(credentials: Credentials) -> Result<Arc<ClientConfig>, FabricError> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(ca_pem) = &credentials.ca_pem {
            let anchors = parse_certs(ca_pem)?;
            let (added, rejected) = roots.add_parsable_certificates(anchors);
            if rejected > 0 {
                warn!("TLS: {rejected} supplied trust anchors were unusable");
            }
            debug!("TLS: added {added} supplied trust anchors");
        }

        let provider = CryptoProvider {
            cipher_suites: ALLOWED_SUITES.to_vec(),
            ..rustls::crypto::aws_lc_rs::default_provider()
        };
        let builder = ClientConfig::builder_with_provider(provider.into())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| FabricError::Tls(e.to_string()))?
            .with_root_certificates(roots);

        let config = match (&credentials.cert_pem, &credentials.key_pem) {
            (Some(cert_pem), Some(key_pem)) => {
                let chain = parse_certs(cert_pem)?;
                let key = parse_key(key_pem)?;
                builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| FabricError::Tls(format!("client identity rejected: {e}")))?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(FabricError::Tls(
                    "client identity needs both certificate and key".into(),
                ));
            }
        };
        Ok(Arc::new(config))
    }
}

#[async_trait]
impl TlsProvisioner for DefaultTlsProvisioner {
    async fn client_config(&self, host: &HostInfo) -> Result<Arc<ClientConfig>, FabricError> {
        let endpoint = host.endpoint();
        if let Some(config) = self.cache.get(&endpoint) {
            return Ok(config.clone());
        }

        let credentials = match &self.assistant {
            Some(assistant) => assistant.credentials(host).await?,
            None => Credentials::default(),
        };
        let config = Self::build_config(credentials)?;
        self.cache.insert(endpoint, config.clone());
        Ok(config)
    }
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, FabricError> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<_, _>>()
        .map_err(|e| FabricError::Tls(format!("bad certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(FabricError::Tls("no certificates in PEM input".into()));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, FabricError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| FabricError::Tls(format!("bad private key PEM: {e}")))?
        .ok_or_else(|| FabricError::Tls("no private key in PEM input".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_tls13_aead_suites_are_offered() {
        let names: Vec<_> = ALLOWED_SUITES.iter().map(|s| s.suite()).collect();
        assert_eq!(
            names,
            vec![
                rustls::CipherSuite::TLS13_AES_256_GCM_SHA384,
                rustls::CipherSuite::TLS13_AES_128_GCM_SHA256,
                rustls::CipherSuite::TLS13_CHACHA20_POLY1305_SHA256,
            ]
        );
    }

    #[tokio::test]
    async fn config_without_assistant_uses_webpki_roots() {
        let provisioner = DefaultTlsProvisioner::new(None);
        let host = HostInfo {
            host: "fe.example.net".into(),
            port: 3245,
            secure: true,
        };
        let config = provisioner.client_config(&host).await.unwrap();
        // Cached on second request.
        let again = provisioner.client_config(&host).await.unwrap();
        assert!(Arc::ptr_eq(&config, &again));
    }

    #[tokio::test]
    async fn denied_credentials_propagate() {
        struct Refusing;

        #[async_trait]
        impl CredentialAssistant for Refusing {
            async fn credentials(&self, host: &HostInfo) -> Result<Credentials, FabricError> {
                Err(FabricError::CredentialsDenied(host.endpoint()))
            }
        }

        let provisioner = DefaultTlsProvisioner::new(Some(Arc::new(Refusing)));
        let host = HostInfo {
            host: "fe.example.net".into(),
            port: 3245,
            secure: true,
        };
        let err = provisioner.client_config(&host).await.unwrap_err();
        assert!(matches!(err, FabricError::CredentialsDenied(_)));
    }

    #[test]
    fn half_identity_is_rejected() {
        let creds = Credentials {
            cert_pem: Some(b"-----BEGIN CERTIFICATE-----".to_vec()),
            ..Default::default()
        };
        assert!(DefaultTlsProvisioner::build_config(creds).is_err());
    }
}
