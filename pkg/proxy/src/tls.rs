use async_trait::async_trait;
use pingora::listeners::TlsAccept;
use pingora::tls::ext;
use pingora::tls::pkey::PKey;
use pingora::tls::ssl::{NameType, SslRef};
use pingora::tls::x509::X509;
use std::sync::Arc;
use tracing::{debug, warn};

use pkg_pki::IssuedCert;
use pkg_router::Router;
use pkg_types::ingress::normalize_host;

/// Chooses the certificate for each ClientHello from its SNI.
pub struct SniCertificates {
    router: Arc<Router>,
}

impl SniCertificates {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl TlsAccept for SniCertificates {
    async fn certificate_callback(&self, ssl: &mut SslRef) {
        let host = ssl
            .servername(NameType::HOST_NAME)
            .map(normalize_host)
            .unwrap_or_default();

        let cert = match self.router.certificate(&host).await {
            Ok(cert) => cert,
            Err(e) => {
                // No certificate installed: the handshake fails.
                warn!(host = %host, stage = "certificate", error = %e, "Certificate unavailable");
                return;
            }
        };
        if let Err(e) = install(ssl, &cert) {
            warn!(host = %host, stage = "certificate", error = %e, "Certificate install failed");
            return;
        }
        debug!(host = %host, "certificate installed");
    }
}

fn install(ssl: &mut SslRef, cert: &IssuedCert) -> anyhow::Result<()> {
    let mut chain = X509::stack_from_pem(cert.cert_chain_pem.as_bytes())?.into_iter();
    let leaf = chain
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty certificate chain"))?;
    let key = PKey::private_key_from_pem(cert.key_pem.as_bytes())?;

    ext::ssl_use_certificate(ssl, &leaf)?;
    ext::ssl_use_private_key(ssl, &key)?;
    for intermediate in chain {
        ext::ssl_add_chain_cert(ssl, &intermediate)?;
    }
    Ok(())
}
