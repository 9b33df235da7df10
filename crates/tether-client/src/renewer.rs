//! Credential renewal.

use std::future::Future;

use serde::Deserialize;

use crate::{Credential, GuardError};

/// Exchanges the current credential for a fresh one.
///
/// The guard calls this at most once at a time, however many callers are
/// waiting on it.
pub trait CredentialRenewer: Send + Sync + 'static {
    /// # Errors
    /// [`GuardError`] if no fresh credential could be obtained.
    fn renew(
        &self,
        current: &Credential,
    ) -> impl Future<Output = Result<Credential, GuardError>> + Send;
}

#[derive(Debug, Deserialize)]
struct RenewResponse {
    token: String,
}

/// Renews over HTTP.
///
/// Sends `POST <endpoint>` with `Authorization: Bearer <current token>`
/// and expects `{"token": "<new jwt>"}` back.
#[derive(Debug, Clone)]
pub struct HttpRenewer {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpRenewer {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    /// Uses an existing `reqwest::Client` (shared connection pool, custom
    /// TLS roots, proxies).
    pub fn with_client(http: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl CredentialRenewer for HttpRenewer {
    async fn renew(&self, current: &Credential) -> Result<Credential, GuardError> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(current.token())
            .send()
            .await
            .map_err(|e| GuardError::Renewal(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GuardError::Renewal(format!("issuer answered {status}")));
        }

        let body: RenewResponse = response
            .json()
            .await
            .map_err(|e| GuardError::Renewal(format!("unreadable renewal response: {e}")))?;
        Ok(Credential::parse(body.token)?)
    }
}
