//! Certificates for the HTTPS listener.
//!
//! Two interchangeable policies implement [`Certificates`]:
//! [`ca::CaCertificates`] mints per-host leaves from a root CA, and
//! [`acme::AcmeCertificates`] issues through an ACME directory with
//! material cached in a [`cache::CertCache`].

pub mod acme;
pub mod ca;
pub mod cache;
pub mod challenge;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A PEM certificate chain and its private key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCert {
    /// Leaf first, then any intermediates.
    pub cert_chain_pem: String,
    pub key_pem: String,
    pub not_after: DateTime<Utc>,
}

/// Certificate policy consulted on every TLS ClientHello.
#[async_trait]
pub trait Certificates: Send + Sync {
    /// Certificate to present for the SNI `host` (may be empty).
    async fn certificate(&self, host: &str) -> anyhow::Result<Arc<IssuedCert>>;

    /// Key authorization for a pending HTTP-01 challenge token.
    fn challenge_response(&self, _token: &str) -> Option<String> {
        None
    }
}

/// Read the `notAfter` of the first certificate in a PEM chain.
pub fn pem_not_after(cert_chain_pem: &str) -> anyhow::Result<DateTime<Utc>> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_chain_pem.as_bytes())
        .map_err(|e| anyhow::anyhow!("invalid certificate PEM: {:?}", e))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| anyhow::anyhow!("invalid certificate DER: {:?}", e))?;
    let ts = cert.validity().not_after.timestamp();
    DateTime::from_timestamp(ts, 0).ok_or_else(|| anyhow::anyhow!("notAfter out of range: {}", ts))
}
