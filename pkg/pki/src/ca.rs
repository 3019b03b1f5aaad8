use async_trait::async_trait;
use chrono::{Datelike, Utc};
use dashmap::DashMap;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use std::sync::Arc;
use tracing::{debug, info};

use pkg_constants::tls::LEAF_VALIDITY_DAYS;

use crate::{Certificates, IssuedCert, pem_not_after};

/// Root Certificate Authority that signs per-host leaf certificates.
pub struct ClusterCA {
    ca_cert_pem: String,
    ca_key_pair: KeyPair,
    ca_cert: rcgen::Certificate,
}

impl ClusterCA {
    /// Create a CA with a freshly-generated self-signed root certificate.
    pub fn new() -> anyhow::Result<Self> {
        info!("Generating router CA");

        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, "Router CA");
        params
            .distinguished_name
            .push(DnType::OrganizationName, "convox");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let key_pair = KeyPair::generate()?;
        let ca_cert = params.self_signed(&key_pair)?;
        let ca_cert_pem = ca_cert.pem();

        Ok(Self {
            ca_cert_pem,
            ca_key_pair: key_pair,
            ca_cert,
        })
    }

    /// Load an existing root from PEM cert + key (e.g. a cluster secret).
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> anyhow::Result<Self> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| anyhow::anyhow!("invalid CA private key: {}", e))?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| anyhow::anyhow!("invalid CA certificate: {}", e))?;

        // Re-signing with the same key and subject yields an issuer that
        // leaves chain to the original root.
        let ca_cert = params.self_signed(&key_pair)?;

        info!("Loaded router CA from PEM");
        Ok(Self {
            ca_cert_pem: cert_pem.to_string(),
            ca_key_pair: key_pair,
            ca_cert,
        })
    }

    /// Mint a leaf for `host` with SAN `{host, *.host}`, valid for one year.
    pub fn issue_leaf(&self, host: &str) -> anyhow::Result<IssuedCert> {
        debug!(host = %host, "minting leaf certificate");

        let mut params =
            CertificateParams::new(vec![host.to_string(), format!("*.{}", host)])?;
        params.distinguished_name.push(DnType::CommonName, host);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        set_validity(&mut params);

        let leaf_key = KeyPair::generate()?;
        let leaf = params.signed_by(&leaf_key, &self.ca_cert, &self.ca_key_pair)?;
        let cert_chain_pem = leaf.pem();

        Ok(IssuedCert {
            not_after: pem_not_after(&cert_chain_pem)?,
            cert_chain_pem,
            key_pem: leaf_key.serialize_pem(),
        })
    }

    /// Return the CA certificate PEM so clients can trust minted leaves.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }
}

/// Valid from yesterday until `LEAF_VALIDITY_DAYS` from now, at day granularity.
fn set_validity(params: &mut CertificateParams) {
    let start = Utc::now() - chrono::Duration::days(1);
    let end = Utc::now() + chrono::Duration::days(LEAF_VALIDITY_DAYS);
    params.not_before = rcgen::date_time_ymd(start.year(), start.month() as u8, start.day() as u8);
    params.not_after = rcgen::date_time_ymd(end.year(), end.month() as u8, end.day() as u8);
}

/// Self-signed certificate presented when a ClientHello carries no SNI.
pub fn self_signed_fallback() -> anyhow::Result<IssuedCert> {
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, "");
    set_validity(&mut params);

    let key = KeyPair::generate()?;
    let cert = params.self_signed(&key)?;
    let cert_chain_pem = cert.pem();
    Ok(IssuedCert {
        not_after: pem_not_after(&cert_chain_pem)?,
        cert_chain_pem,
        key_pem: key.serialize_pem(),
    })
}

/// CA policy: mint on first ClientHello, memoize by SNI for the process lifetime.
pub struct CaCertificates {
    ca: ClusterCA,
    issued: DashMap<String, Arc<IssuedCert>>,
}

impl CaCertificates {
    pub fn new(ca: ClusterCA) -> Self {
        Self {
            ca,
            issued: DashMap::new(),
        }
    }
}

#[async_trait]
impl Certificates for CaCertificates {
    async fn certificate(&self, host: &str) -> anyhow::Result<Arc<IssuedCert>> {
        if let Some(cert) = self.issued.get(host) {
            return Ok(cert.clone());
        }

        // Two handshakes racing here both mint; the later insert wins.
        let cert = if host.is_empty() {
            self_signed_fallback()?
        } else {
            self.ca.issue_leaf(host)?
        };
        let cert = Arc::new(cert);
        self.issued.insert(host.to_string(), cert.clone());
        info!(host = %host, not_after = %cert.not_after, "issued leaf certificate");
        Ok(cert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::extensions::GeneralName;

    fn parse_leaf(pem: &str) -> (String, Vec<String>, String) {
        let (_, pem) = x509_parser::pem::parse_x509_pem(pem.as_bytes()).unwrap();
        let cert = pem.parse_x509().unwrap();
        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|c| c.as_str().ok())
            .unwrap_or_default()
            .to_string();
        let sans = cert
            .subject_alternative_name()
            .unwrap()
            .map(|ext| {
                ext.value
                    .general_names
                    .iter()
                    .filter_map(|n| match n {
                        GeneralName::DNSName(d) => Some(d.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        (cn, sans, cert.issuer().to_string())
    }

    #[test]
    fn test_issue_leaf_carries_host_and_wildcard() {
        let ca = ClusterCA::new().unwrap();
        let leaf = ca.issue_leaf("svc.example.com").unwrap();

        let (cn, sans, issuer) = parse_leaf(&leaf.cert_chain_pem);
        assert_eq!(cn, "svc.example.com");
        assert_eq!(sans, vec!["svc.example.com", "*.svc.example.com"]);
        assert!(issuer.contains("Router CA"));
        assert!(leaf.key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_leaf_valid_for_a_year() {
        let ca = ClusterCA::new().unwrap();
        let leaf = ca.issue_leaf("svc.example.com").unwrap();
        let not_after = crate::pem_not_after(&leaf.cert_chain_pem).unwrap();
        let days = (not_after - Utc::now()).num_days();
        assert!((363..=365).contains(&days), "validity was {} days", days);
    }

    #[test]
    fn test_recorded_expiry_matches_certificate() {
        let ca = ClusterCA::new().unwrap();
        let leaf = ca.issue_leaf("svc.example.com").unwrap();
        assert_eq!(leaf.not_after, pem_not_after(&leaf.cert_chain_pem).unwrap());

        let fallback = self_signed_fallback().unwrap();
        assert_eq!(fallback.not_after, pem_not_after(&fallback.cert_chain_pem).unwrap());
    }

    #[test]
    fn test_from_pem_round_trip() {
        let original = ClusterCA::new().unwrap();
        let key_pem = original.ca_key_pair.serialize_pem();
        let loaded = ClusterCA::from_pem(original.ca_cert_pem(), &key_pem).unwrap();
        let leaf = loaded.issue_leaf("app.example.com").unwrap();
        let (_, _, issuer) = parse_leaf(&leaf.cert_chain_pem);
        assert!(issuer.contains("Router CA"));
        assert_eq!(loaded.ca_cert_pem(), original.ca_cert_pem());
    }

    #[test]
    fn test_from_pem_rejects_garbage() {
        assert!(ClusterCA::from_pem("not a cert", "not a key").is_err());
    }

    #[tokio::test]
    async fn test_certificates_are_memoized() {
        let certs = CaCertificates::new(ClusterCA::new().unwrap());
        let first = certs.certificate("svc.example.com").await.unwrap();
        let second = certs.certificate("svc.example.com").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = certs.certificate("other.example.com").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[tokio::test]
    async fn test_empty_sni_gets_fallback() {
        let certs = CaCertificates::new(ClusterCA::new().unwrap());
        let cert = certs.certificate("").await.unwrap();
        let (cn, sans, _) = parse_leaf(&cert.cert_chain_pem);
        assert_eq!(cn, "");
        assert!(sans.is_empty());
    }
}
