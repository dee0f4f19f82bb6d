//! Token authentication seam consulted before a session starts.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::errors::RelayError;

/// Caller identity resolved from a session token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("authentication rejected: {reason}")]
pub struct AuthRejected {
    pub reason: String,
}

impl AuthRejected {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Resolves raw bearer tokens to identities.
#[async_trait::async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<Identity, AuthRejected>;
}

/// Hex-encoded SHA-256 of a token, as stored by `DigestAuthenticator`.
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.trim().as_bytes()))
}

/// Accepts tokens whose SHA-256 digest is registered. Plaintext tokens are
/// never kept.
#[derive(Clone, Debug, Default)]
pub struct DigestAuthenticator {
    subjects: HashMap<String, String>,
}

impl DigestAuthenticator {
    /// Registers a hex-encoded SHA-256 digest for `subject`.
    pub fn with_digest(
        mut self,
        subject: impl Into<String>,
        hex_digest: &str,
    ) -> Result<Self, RelayError> {
        let normalized = hex_digest.trim().to_ascii_lowercase();
        let decoded = hex::decode(&normalized)
            .map_err(|e| RelayError::Config(format!("invalid token digest: {e}")))?;
        if decoded.len() != 32 {
            return Err(RelayError::Config(format!(
                "token digest must be 32 bytes, got {}",
                decoded.len()
            )));
        }
        self.subjects.insert(normalized, subject.into());
        Ok(self)
    }
}

#[async_trait::async_trait]
impl Authenticator for DigestAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<Identity, AuthRejected> {
        if token.trim().is_empty() {
            return Err(AuthRejected::new("missing token"));
        }
        self.subjects
            .get(&token_digest(token))
            .map(|subject| Identity {
                subject: subject.clone(),
            })
            .ok_or_else(|| AuthRejected::new("unknown token"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registered_digest_resolves_subject() {
        let auth = DigestAuthenticator::default()
            .with_digest("alice", &token_digest("s3cret").to_uppercase())
            .expect("valid digest");
        let identity = auth.authenticate(" s3cret ").await.expect("accepted");
        assert_eq!(identity.subject, "alice");
        assert_eq!(
            auth.authenticate("other").await,
            Err(AuthRejected::new("unknown token"))
        );
        assert_eq!(
            auth.authenticate("").await,
            Err(AuthRejected::new("missing token"))
        );
    }

    #[test]
    fn malformed_digests_are_config_errors() {
        assert!(DigestAuthenticator::default().with_digest("a", "zz").is_err());
        assert!(DigestAuthenticator::default().with_digest("a", "abcd").is_err());
    }
}
