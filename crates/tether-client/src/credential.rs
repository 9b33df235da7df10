//! The bearer credential as the client sees it.

use std::time::Duration;

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use tether_protocol::{Claims, Identity, unix_secs};

use crate::CredentialError;

/// A bearer token plus the claims read out of it.
///
/// The client never holds the signing key, so the claims are decoded
/// without signature verification. They are only used locally to decide
/// when to renew and what identity to present; the server is the one
/// that verifies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    token: String,
    claims: Claims,
}

impl Credential {
    /// Reads the claims out of `token`.
    ///
    /// # Errors
    /// [`CredentialError::Malformed`] if `token` isn't a decodable JWT
    /// carrying `sub` and `exp`.
    pub fn parse(token: impl Into<String>) -> Result<Self, CredentialError> {
        let token = token.into();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let claims = jsonwebtoken::decode::<Claims>(&token, &DecodingKey::from_secret(&[]), &validation)
            .map_err(|e| CredentialError::Malformed(e.to_string()))?
            .claims;
        Ok(Self { token, claims })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    pub fn identity(&self) -> Identity {
        self.claims.identity()
    }

    /// Expiry, in Unix seconds.
    pub fn expires_at(&self) -> u64 {
        self.claims.exp
    }

    /// Time left before expiry as of `now_secs`; zero once expired.
    pub fn remaining_at(&self, now_secs: u64) -> Duration {
        Duration::from_secs(self.claims.exp.saturating_sub(now_secs))
    }

    /// Time left before expiry by the wall clock.
    pub fn remaining(&self) -> Duration {
        self.remaining_at(unix_secs())
    }

    pub fn is_expired(&self) -> bool {
        self.claims.is_expired_at(unix_secs())
    }
}

#[cfg(test)]
mod tests {
    use jsonwebtoken::{EncodingKey, Header};

    use super::*;

    fn token(exp: u64) -> String {
        let claims = Claims {
            sub: "driver-7".into(),
            role: "driver".into(),
            username: "ana".into(),
            exp,
            iat: 0,
        };
        jsonwebtoken::encode(&Header::default(), &claims, &EncodingKey::from_secret(b"k")).unwrap()
    }

    #[test]
    fn test_parse_reads_claims_without_key() {
        let cred = Credential::parse(token(5_000)).unwrap();
        assert_eq!(cred.claims().sub, "driver-7");
        assert_eq!(cred.expires_at(), 5_000);
        assert_eq!(cred.identity().username, "ana");
    }

    #[test]
    fn test_parse_expired_token_still_parses() {
        let cred = Credential::parse(token(1)).unwrap();
        assert!(cred.is_expired());
        assert_eq!(cred.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_parse_garbage_is_malformed() {
        assert!(matches!(
            Credential::parse("definitely-not-a-jwt"),
            Err(CredentialError::Malformed(_))
        ));
    }

    #[test]
    fn test_remaining_at_counts_down_to_zero() {
        let cred = Credential::parse(token(1_000)).unwrap();
        assert_eq!(cred.remaining_at(900), Duration::from_secs(100));
        assert_eq!(cred.remaining_at(1_000), Duration::ZERO);
        assert_eq!(cred.remaining_at(2_000), Duration::ZERO);
    }
}
