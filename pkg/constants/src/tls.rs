//! Certificate constants.

/// Validity of a leaf certificate minted by the in-process CA.
pub const LEAF_VALIDITY_DAYS: i64 = 365;

/// Cached ACME certificates this close to expiry are re-issued.
pub const ACME_RENEW_BEFORE_DAYS: i64 = 30;

/// Let's Encrypt production directory.
pub const DEFAULT_ACME_DIRECTORY: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Cache key of the ACME account credentials.
pub const ACME_ACCOUNT_KEY: &str = "acme_account+key";

/// Path prefix of HTTP-01 challenge requests.
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Minimum spacing between background renewal attempts for one host.
pub const ACME_RENEW_RETRY_SECS: u64 = 60 * 60;
