//! Client authentication.
//!
//! The `init` frame carries a bearer token. The default verifier checks it
//! against SHA-256 digests listed in the config, so plaintext tokens never
//! need to be stored on the daemon host.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::TokenEntry;

/// Authentication failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing authentication token")]
    MissingToken,

    #[error("invalid authentication token")]
    InvalidToken,
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Name recorded in audit events and used as the session id prefix.
    pub principal: String,
}

/// Checks tokens from the `init` frame.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Hex-encoded SHA-256 of a token, as stored in `[[auth.tokens]]`.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Verifier backed by `[[auth.tokens]]` entries.
#[derive(Debug, Default)]
pub struct TokenVerifier {
    entries: Vec<(String, [u8; 32])>,
}

impl TokenVerifier {
    /// Build from config entries. Entries with malformed digests are skipped
    /// with a warning; config validation normally rejects them first.
    pub fn from_entries(entries: &[TokenEntry]) -> Self {
        let mut verifier = Self::default();
        for entry in entries {
            match decode_digest(&entry.sha256) {
                Some(digest) => verifier.entries.push((entry.principal.clone(), digest)),
                None => tracing::warn!(principal = %entry.principal, "Ignoring token with malformed digest"),
            }
        }
        verifier
    }

    /// Register a plaintext token for `principal`.
    pub fn with_token(mut self, principal: impl Into<String>, token: &str) -> Self {
        self.entries.push((principal.into(), sha256(token)));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IdentityVerifier for TokenVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let digest = sha256(token);

        // Compare against every entry so timing does not reveal which matched.
        let mut found = None;
        for (principal, expected) in &self.entries {
            if digests_equal(&digest, expected) && found.is_none() {
                found = Some(principal);
            }
        }

        found
            .map(|principal| Identity {
                principal: principal.clone(),
            })
            .ok_or(AuthError::InvalidToken)
    }
}

fn sha256(token: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(token.as_bytes()));
    out
}

fn decode_digest(hex_digest: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(hex_digest.trim()).ok()?;
    bytes.try_into().ok()
}

fn digests_equal(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_token_known_vector() {
        assert_eq!(
            hash_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_verify_configured_token() {
        let verifier = TokenVerifier::from_entries(&[TokenEntry {
            principal: "admin".to_string(),
            sha256: hash_token("s3cret"),
        }]);
        assert_eq!(verifier.len(), 1);

        let identity = verifier.verify("s3cret").unwrap();
        assert_eq!(identity.principal, "admin");
        assert_eq!(verifier.verify("wrong"), Err(AuthError::InvalidToken));
        assert_eq!(verifier.verify(""), Err(AuthError::MissingToken));
    }

    #[test]
    fn test_malformed_digest_skipped() {
        let verifier = TokenVerifier::from_entries(&[TokenEntry {
            principal: "broken".to_string(),
            sha256: "not-hex".to_string(),
        }]);
        assert!(verifier.is_empty());
        assert_eq!(verifier.verify("anything"), Err(AuthError::InvalidToken));
    }

    #[test]
    fn test_with_token_builder() {
        let verifier = TokenVerifier::default()
            .with_token("alice", "one")
            .with_token("bob", "two");
        assert_eq!(verifier.verify("two").unwrap().principal, "bob");
    }
}
