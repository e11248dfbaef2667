//! Credential verification boundary.
//!
//! Identity issuance lives outside this service; the hub only checks that a
//! presented credential was minted by the trusted issuer. [`CredentialVerifier`]
//! is the seam; [`HmacCredentialVerifier`] is the bundled implementation for
//! deployments where hub and issuer share a secret.
//!
//! Token format: `identity.signature` where
//! `signature = hex(HMAC-SHA256(secret, identity))`. Verification uses
//! `ring`'s constant-time comparison.

use ring::hmac;

use crate::errors::HubError;

/// Verifies a connect-time credential and resolves it to an identity.
pub trait CredentialVerifier: Send + Sync {
    /// Returns the verified identity, or [`HubError::AuthenticationFailed`].
    fn verify(&self, token: &str) -> Result<String, HubError>;
}

/// HMAC-SHA256 credential verifier backed by a shared secret.
pub struct HmacCredentialVerifier {
    key: hmac::Key,
}

impl HmacCredentialVerifier {
    /// Create a verifier from the shared secret.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Config`] if the secret is shorter than 32 bytes.
    pub fn new(secret: &[u8]) -> Result<Self, HubError> {
        if secret.len() < 32 {
            return Err(HubError::Config(
                "credential secret must be at least 32 bytes".to_string(),
            ));
        }
        Ok(Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
        })
    }

    /// Mint a token for the given identity.
    ///
    /// Used by the operational token-mint path and by tests; production
    /// clients obtain tokens from the external issuer.
    #[must_use]
    pub fn mint_token(&self, identity: &str) -> String {
        let tag = hmac::sign(&self.key, identity.as_bytes());
        format!("{identity}.{}", hex::encode(tag.as_ref()))
    }
}

impl CredentialVerifier for HmacCredentialVerifier {
    fn verify(&self, token: &str) -> Result<String, HubError> {
        let (identity, signature_hex) = token
            .rsplit_once('.')
            .ok_or(HubError::AuthenticationFailed)?;

        if identity.is_empty() {
            return Err(HubError::AuthenticationFailed);
        }

        let signature =
            hex::decode(signature_hex).map_err(|_| HubError::AuthenticationFailed)?;

        hmac::verify(&self.key, identity.as_bytes(), &signature)
            .map_err(|_| HubError::AuthenticationFailed)?;

        Ok(identity.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn test_verifier() -> HmacCredentialVerifier {
        HmacCredentialVerifier::new(&[7u8; 32]).expect("32-byte secret is valid")
    }

    #[test]
    fn test_mint_and_verify_round_trip() {
        let verifier = test_verifier();
        let token = verifier.mint_token("alice");

        assert_eq!(verifier.verify(&token).unwrap(), "alice");
    }

    #[test]
    fn test_identity_may_contain_dots() {
        let verifier = test_verifier();
        let token = verifier.mint_token("alice.example");

        assert_eq!(verifier.verify(&token).unwrap(), "alice.example");
    }

    #[test]
    fn test_tampered_identity_is_rejected() {
        let verifier = test_verifier();
        let token = verifier.mint_token("alice");
        let tampered = token.replacen("alice", "mallory", 1);

        assert!(matches!(
            verifier.verify(&tampered),
            Err(HubError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let minter = test_verifier();
        let other = HmacCredentialVerifier::new(&[9u8; 32]).unwrap();

        let token = minter.mint_token("alice");
        assert!(matches!(
            other.verify(&token),
            Err(HubError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_garbage_tokens_are_rejected() {
        let verifier = test_verifier();

        for token in ["", "no-separator", ".abcdef", "alice.not-hex", "alice."] {
            assert!(
                matches!(verifier.verify(token), Err(HubError::AuthenticationFailed)),
                "token {token:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_short_secret_is_rejected() {
        assert!(matches!(
            HmacCredentialVerifier::new(&[1u8; 16]),
            Err(HubError::Config(_))
        ));
    }
}
