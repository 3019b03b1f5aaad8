use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, KeyPair};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use pkg_constants::tls::{ACME_ACCOUNT_KEY, ACME_RENEW_BEFORE_DAYS, ACME_RENEW_RETRY_SECS};
use pkg_storage::locks::KeyedLocks;

use crate::cache::CertCache;
use crate::challenge::ChallengeManager;
use crate::{Certificates, IssuedCert, ca::self_signed_fallback, pem_not_after};

/// Order polling: first delay, cap, and number of attempts.
const POLL_INITIAL: Duration = Duration::from_millis(250);
const POLL_MAX: Duration = Duration::from_secs(10);
const POLL_ATTEMPTS: u32 = 20;

/// ACME policy: serve cached chains and issue through the directory on miss.
///
/// A chain inside the renewal window is still served while it is valid; the
/// renewal runs in the background and a failure only gets logged.
pub struct AcmeCertificates {
    inner: Arc<Acme>,
}

struct Acme {
    cache: Arc<dyn CertCache>,
    challenges: ChallengeManager,
    directory_url: String,
    contact: Option<String>,
    account: OnceCell<Account>,
    issued: DashMap<String, Arc<IssuedCert>>,
    locks: KeyedLocks,
    /// Hosts with a background renewal running.
    renewing: DashSet<String>,
    last_renewal: DashMap<String, Instant>,
    fallback: OnceCell<Arc<IssuedCert>>,
}

impl AcmeCertificates {
    pub fn new(cache: Arc<dyn CertCache>, directory_url: &str, email: Option<&str>) -> Self {
        Self {
            inner: Arc::new(Acme {
                cache,
                challenges: ChallengeManager::new(),
                directory_url: directory_url.to_string(),
                contact: email.map(|e| format!("mailto:{}", e)),
                account: OnceCell::new(),
                issued: DashMap::new(),
                locks: KeyedLocks::new(),
                renewing: DashSet::new(),
                last_renewal: DashMap::new(),
                fallback: OnceCell::new(),
            }),
        }
    }

    pub fn challenges(&self) -> &ChallengeManager {
        &self.inner.challenges
    }

    /// Start a background renewal unless one is running or the last attempt
    /// was within the retry interval.
    fn schedule_renewal(&self, host: &str) {
        let retry = Duration::from_secs(ACME_RENEW_RETRY_SECS);
        if self
            .inner
            .last_renewal
            .get(host)
            .is_some_and(|at| at.elapsed() < retry)
        {
            return;
        }
        if !self.inner.renewing.insert(host.to_string()) {
            return;
        }
        self.inner
            .last_renewal
            .insert(host.to_string(), Instant::now());

        let acme = self.inner.clone();
        let host = host.to_string();
        tokio::spawn(async move {
            match acme.renew(&host).await {
                Ok(cert) => {
                    info!(host = %host, not_after = %cert.not_after, "Renewed ACME certificate")
                }
                Err(e) => {
                    warn!(host = %host, stage = "renew", error = %e, "ACME renewal failed, serving current certificate")
                }
            }
            acme.renewing.remove(&host);
        });
    }

    /// Whether a background renewal is running for `host`.
    pub fn is_renewing(&self, host: &str) -> bool {
        self.inner.renewing.contains(host)
    }
}

impl Acme {
    async fn account(&self) -> anyhow::Result<&Account> {
        self.account
            .get_or_try_init(|| self.load_or_register())
            .await
    }

    /// Load the account from the cache, registering a new one on first use.
    async fn load_or_register(&self) -> anyhow::Result<Account> {
        if let Some(data) = self.cache.get(ACME_ACCOUNT_KEY).await? {
            let credentials: AccountCredentials = serde_json::from_slice(&data)?;
            debug!("Restored ACME account from cache");
            return Ok(Account::from_credentials(credentials).await?);
        }

        info!(directory = %self.directory_url, "Registering ACME account");
        let contact: Vec<&str> = self.contact.iter().map(String::as_str).collect();
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await?;
        self.cache
            .put(ACME_ACCOUNT_KEY, &serde_json::to_vec(&credentials)?)
            .await?;
        Ok(account)
    }

    async fn cached(&self, host: &str) -> anyhow::Result<Option<IssuedCert>> {
        let Some(data) = self.cache.get(host).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<IssuedCert>(&data) {
            Ok(cert) => Ok(Some(cert)),
            Err(e) => {
                warn!(host = %host, error = %e, "Discarding unreadable cached certificate");
                self.cache.delete(host).await?;
                Ok(None)
            }
        }
    }

    async fn issue(&self, host: &str) -> anyhow::Result<IssuedCert> {
        let account = self.account().await?;
        info!(host = %host, "Ordering ACME certificate");

        let identifiers = [Identifier::Dns(host.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let mut tokens = Vec::new();
        let result = self.complete_order(host, &mut order, &mut tokens).await;
        for token in &tokens {
            self.challenges.remove_challenge(token);
        }
        result
    }

    async fn complete_order(
        &self,
        host: &str,
        order: &mut Order,
        tokens: &mut Vec<String>,
    ) -> anyhow::Result<IssuedCert> {
        for authz in order.authorizations().await? {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| anyhow::anyhow!("no HTTP-01 challenge offered for {}", host))?;

            let key_auth = order.key_authorization(challenge);
            self.challenges
                .add_challenge(&challenge.token, key_auth.as_str());
            tokens.push(challenge.token.clone());
            order.set_challenge_ready(&challenge.url).await?;
        }

        let mut delay = POLL_INITIAL;
        let mut status = order.refresh().await?.status;
        for _ in 0..POLL_ATTEMPTS {
            if matches!(status, OrderStatus::Ready | OrderStatus::Invalid | OrderStatus::Valid) {
                break;
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(POLL_MAX);
            status = order.refresh().await?.status;
        }
        if status != OrderStatus::Ready {
            anyhow::bail!("ACME order for {} ended in {:?}", host, status);
        }

        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.distinguished_name = rcgen::DistinguishedName::new();
        let csr = params.serialize_request(&key)?;
        order.finalize(csr.der()).await?;

        let mut delay = POLL_INITIAL;
        for _ in 0..POLL_ATTEMPTS {
            if let Some(chain) = order.certificate().await? {
                let not_after = pem_not_after(&chain)?;
                return Ok(IssuedCert {
                    cert_chain_pem: chain,
                    key_pem: key.serialize_pem(),
                    not_after,
                });
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(POLL_MAX);
        }
        anyhow::bail!("ACME order for {} did not produce a certificate", host)
    }

    async fn renew(&self, host: &str) -> anyhow::Result<Arc<IssuedCert>> {
        let _guard = self.locks.lock(host).await;
        self.issue_and_store(host).await
    }

    async fn issue_and_store(&self, host: &str) -> anyhow::Result<Arc<IssuedCert>> {
        let cert = self.issue(host).await?;
        self.cache.put(host, &serde_json::to_vec(&cert)?).await?;
        let cert = Arc::new(cert);
        self.issued.insert(host.to_string(), cert.clone());
        Ok(cert)
    }

    fn memoised(&self, host: &str) -> Option<Arc<IssuedCert>> {
        self.issued
            .get(host)
            .map(|c| c.clone())
            .filter(|c| !is_expired(c))
    }
}

/// True when `cert` expires within the renewal window.
pub fn needs_renewal(cert: &IssuedCert) -> bool {
    cert.not_after - Utc::now() < chrono::Duration::days(ACME_RENEW_BEFORE_DAYS)
}

pub fn is_expired(cert: &IssuedCert) -> bool {
    cert.not_after <= Utc::now()
}

#[async_trait]
impl Certificates for AcmeCertificates {
    async fn certificate(&self, host: &str) -> anyhow::Result<Arc<IssuedCert>> {
        let acme = &self.inner;
        if host.is_empty() {
            let cert = acme
                .fallback
                .get_or_try_init(|| async { self_signed_fallback().map(Arc::new) })
                .await?;
            return Ok(cert.clone());
        }

        if let Some(cert) = acme.memoised(host) {
            if needs_renewal(&cert) {
                self.schedule_renewal(host);
            }
            return Ok(cert);
        }

        // One issuance per host at a time; latecomers pick up the result.
        let _guard = acme.locks.lock(host).await;

        if let Some(cert) = acme.memoised(host) {
            return Ok(cert);
        }

        if let Some(cert) = acme.cached(host).await? {
            if !is_expired(&cert) {
                let cert = Arc::new(cert);
                acme.issued.insert(host.to_string(), cert.clone());
                if needs_renewal(&cert) {
                    debug!(host = %host, not_after = %cert.not_after, "Cached certificate due for renewal");
                    self.schedule_renewal(host);
                }
                return Ok(cert);
            }
            debug!(host = %host, not_after = %cert.not_after, "Cached certificate expired");
        }

        let cert = acme.issue_and_store(host).await?;
        info!(host = %host, not_after = %cert.not_after, "Issued ACME certificate");
        Ok(cert)
    }

    fn challenge_response(&self, token: &str) -> Option<String> {
        self.inner.challenges.get_response(token)
    }
}
