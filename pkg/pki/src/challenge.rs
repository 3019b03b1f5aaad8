use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, trace};

use pkg_constants::tls::ACME_CHALLENGE_PREFIX;

/// Pending ACME HTTP-01 challenges, token → key authorization.
///
/// The issuing task registers a token before telling the ACME server it is
/// ready; the port-80 listener answers `/.well-known/acme-challenge/<token>`
/// from here.
#[derive(Debug, Clone, Default)]
pub struct ChallengeManager {
    challenges: Arc<DashMap<String, String>>,
}

impl ChallengeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_challenge(&self, token: &str, key_authorization: &str) {
        debug!(token = %token, "Registering ACME HTTP-01 challenge");
        self.challenges
            .insert(token.to_string(), key_authorization.to_string());
    }

    pub fn remove_challenge(&self, token: &str) {
        if self.challenges.remove(token).is_some() {
            debug!(token = %token, "Removed ACME challenge");
        }
    }

    pub fn get_response(&self, token: &str) -> Option<String> {
        let result = self.challenges.get(token).map(|v| v.clone());
        trace!(token = %token, found = result.is_some(), "ACME challenge lookup");
        result
    }

    /// `Some(token)` if `path` is an HTTP-01 challenge path.
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
            .filter(|t| !t.is_empty() && !t.contains('/'))
    }

    pub fn pending_count(&self) -> usize {
        self.challenges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_get_remove() {
        let manager = ChallengeManager::new();
        manager.add_challenge("tok", "tok.thumb");
        assert_eq!(manager.get_response("tok"), Some("tok.thumb".to_string()));
        assert_eq!(manager.pending_count(), 1);

        manager.remove_challenge("tok");
        assert_eq!(manager.get_response("tok"), None);
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn test_clones_share_state() {
        let manager = ChallengeManager::new();
        let clone = manager.clone();
        manager.add_challenge("tok", "auth");
        assert_eq!(clone.get_response("tok"), Some("auth".to_string()));
    }

    #[test]
    fn test_extract_token() {
        assert_eq!(
            ChallengeManager::extract_token("/.well-known/acme-challenge/abc123"),
            Some("abc123")
        );
        assert_eq!(ChallengeManager::extract_token("/.well-known/acme-challenge/"), None);
        assert_eq!(ChallengeManager::extract_token("/.well-known/acme-challenge/a/b"), None);
        assert_eq!(ChallengeManager::extract_token("/index.html"), None);
    }
}
