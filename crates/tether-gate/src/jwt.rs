//! HS256 JSON Web Token keys.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use tether_protocol::{Claims, unix_secs};
use tracing::debug;

use crate::{GateError, TokenValidator, TokenVerdict};

/// A shared-secret key pair that can both issue and classify tokens.
///
/// Expiry is checked here rather than by `jsonwebtoken`, because the gate
/// needs to tell "expired but authentic" apart from "garbage"; the library
/// folds both into one error.
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtKeys {
    pub fn from_secret(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Signs `claims` into a compact JWT.
    ///
    /// # Errors
    /// [`GateError::Issue`] if serialization or signing fails.
    pub fn issue(&self, claims: &Claims) -> Result<String, GateError> {
        jsonwebtoken::encode(&Header::default(), claims, &self.encoding).map_err(GateError::Issue)
    }

    /// Classifies `token` against the current wall clock.
    pub fn verify(&self, token: &str) -> TokenVerdict {
        self.verify_at(token, unix_secs())
    }

    /// Classifies `token` as of `now_secs` (Unix seconds).
    pub fn verify_at(&self, token: &str, now_secs: u64) -> TokenVerdict {
        match jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation) {
            Ok(data) if data.claims.is_expired_at(now_secs) => {
                debug!(sub = %data.claims.sub, exp = data.claims.exp, "token expired");
                TokenVerdict::Expired(data.claims)
            }
            Ok(data) => TokenVerdict::Valid(data.claims),
            Err(e) => TokenVerdict::Invalid(e.to_string()),
        }
    }
}

impl std::fmt::Debug for JwtKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtKeys").finish_non_exhaustive()
    }
}

impl TokenValidator for JwtKeys {
    async fn validate(&self, token: &str) -> Result<TokenVerdict, GateError> {
        Ok(self.verify(token))
    }
}
