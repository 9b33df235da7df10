//! Credential validation hook.
//!
//! Tether doesn't issue credentials; that's the job of your auth
//! service. It only needs to *classify* the bearer token a connection
//! presents, which is what the [`TokenValidator`] trait does. The default
//! implementation is [`JwtKeys`](crate::JwtKeys); tests and alternative
//! issuers plug in their own.

use std::future::Future;

use tether_protocol::{AuthErrorKind, Claims};

use crate::GateError;

/// The three mutually exclusive states a presented credential can be in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenVerdict {
    /// Signature checks out and `exp` is in the future.
    Valid(Claims),
    /// Signature checks out but `exp` has passed. The claims are still
    /// trustworthy, which is what makes a grace window safe to grant.
    Expired(Claims),
    /// Malformed, wrong key, or missing required claims. Nothing inside
    /// can be trusted.
    Invalid(String),
}

impl TokenVerdict {
    /// The auth error this verdict surfaces as, or `None` when valid.
    pub fn error_kind(&self) -> Option<AuthErrorKind> {
        match self {
            Self::Valid(_) => None,
            Self::Expired(_) => Some(AuthErrorKind::TokenExpired),
            Self::Invalid(_) => Some(AuthErrorKind::InvalidToken),
        }
    }

    /// The verified claims, if the signature was valid.
    pub fn claims(&self) -> Option<&Claims> {
        match self {
            Self::Valid(c) | Self::Expired(c) => Some(c),
            Self::Invalid(_) => None,
        }
    }
}

/// Classifies a bearer token.
///
/// `Send + Sync + 'static` because one validator is shared by every
/// connection task on the server.
///
/// # Example
///
/// ```rust
/// use tether_gate::{GateError, TokenValidator, TokenVerdict};
/// use tether_protocol::Claims;
///
/// /// Accepts the literal token "ok" for subject "dev". Tests only.
/// struct DevValidator;
///
/// impl TokenValidator for DevValidator {
///     async fn validate(&self, token: &str) -> Result<TokenVerdict, GateError> {
///         if token == "ok" {
///             Ok(TokenVerdict::Valid(Claims {
///                 sub: "dev".into(),
///                 role: "admin".into(),
///                 username: "dev".into(),
///                 exp: u64::MAX,
///                 iat: 0,
///             }))
///         } else {
///             Ok(TokenVerdict::Invalid("unknown token".into()))
///         }
///     }
/// }
/// ```
pub trait TokenValidator: Send + Sync + 'static {
    /// Classifies `token`.
    ///
    /// # Errors
    /// [`GateError::ValidatorUnavailable`] when no verdict can be reached.
    /// The gate reports that to the client as `AUTH_ERROR`.
    fn validate(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<TokenVerdict, GateError>> + Send;
}
