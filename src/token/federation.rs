//! Workload identity federation.
//!
//! Mints Google access tokens from an external OIDC identity without a
//! long-lived service account key. Two phases: exchange the caller-supplied
//! OIDC JWT at the Security Token Service (RFC 8693), then optionally trade
//! the federated token for a service-account token via the IAM credentials
//! API when impersonation is configured.

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::{AccessToken, TokenSource, CLOUD_PLATFORM_SCOPE};
use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::retry::cancellable;

const TOKEN_EXCHANGE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";
const JWT_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:jwt";

/// Supplies the external OIDC identity for the exchange.
#[async_trait]
pub trait OidcTokenProvider: Send + Sync {
    async fn id_token(&self, cancel: &CancellationToken) -> Result<String>;
}

/// Response from sts.googleapis.com's token endpoint.
#[derive(Deserialize)]
struct StsTokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Response from the IAM credentials generateAccessToken endpoint.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateAccessTokenResponse {
    access_token: String,
    expire_time: DateTime<Utc>,
}

pub struct FederatedTokenSource {
    oidc: Arc<dyn OidcTokenProvider>,
    audience: String,
    /// Service account to impersonate with the federated token, if any.
    impersonate: Option<String>,
    sts_token_url: Url,
    iam_credentials_base: Url,
    http: reqwest::Client,
    skew: Duration,
    cached: RwLock<Option<AccessToken>>,
    refresh: tokio::sync::Mutex<()>,
}

impl fmt::Debug for FederatedTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FederatedTokenSource")
            .field("audience", &self.audience)
            .field("impersonate", &self.impersonate)
            .finish()
    }
}

impl FederatedTokenSource {
    pub fn new(
        oidc: Arc<dyn OidcTokenProvider>,
        audience: impl Into<String>,
        impersonate: Option<String>,
        http: reqwest::Client,
        config: &BrokerConfig,
    ) -> Self {
        Self {
            oidc,
            audience: audience.into(),
            impersonate,
            sts_token_url: config.sts_token_url.clone(),
            iam_credentials_base: config.iam_credentials_base.clone(),
            http,
            skew: config.token_expiry_skew(),
            cached: RwLock::new(None),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    fn cached_token(&self) -> Option<AccessToken> {
        let cached = self.cached.read().unwrap();
        cached.as_ref().filter(|t| !t.expired(self.skew)).cloned()
    }

    /// Phase one: trade the OIDC JWT for a federated access token.
    async fn exchange_sts(&self, subject_token: &str) -> Result<StsTokenResponse> {
        let response = self
            .http
            .post(self.sts_token_url.clone())
            .form(&[
                ("grant_type", TOKEN_EXCHANGE_GRANT_TYPE),
                ("requested_token_type", ACCESS_TOKEN_TYPE),
                ("subject_token_type", JWT_TOKEN_TYPE),
                ("subject_token", subject_token),
                ("audience", self.audience.as_str()),
                ("scope", CLOUD_PLATFORM_SCOPE),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                endpoint: "sts",
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json().await?)
    }

    /// Phase two: impersonate the configured service account.
    async fn impersonate_service_account(
        &self,
        email: &str,
        federated_token: &str,
    ) -> Result<AccessToken> {
        let url = self
            .iam_credentials_base
            .join(&format!(
                "v1/projects/-/serviceAccounts/{email}:generateAccessToken"
            ))
            .map_err(|e| Error::TokenExchange(format!("bad impersonation url: {e}")))?;

        let response = self
            .http
            .post(url)
            .bearer_auth(federated_token)
            .json(&serde_json::json!({ "scope": [CLOUD_PLATFORM_SCOPE] }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                endpoint: "iamcredentials",
                status: status.as_u16(),
                message,
            });
        }

        let body: GenerateAccessTokenResponse = response.json().await?;
        Ok(AccessToken::new(body.access_token, body.expire_time))
    }

    async fn exchange(&self, cancel: &CancellationToken) -> Result<AccessToken> {
        let subject_token = self.oidc.id_token(cancel).await?;
        if subject_token.is_empty() {
            return Err(Error::TokenExchange(
                "identity provider returned an empty OIDC token".into(),
            ));
        }

        let sts = self.exchange_sts(&subject_token).await?;

        match &self.impersonate {
            Some(email) => self.impersonate_service_account(email, &sts.access_token).await,
            None => Ok(AccessToken::new(
                sts.access_token,
                Utc::now() + TimeDelta::seconds(sts.expires_in),
            )),
        }
    }
}

#[async_trait]
impl TokenSource for FederatedTokenSource {
    async fn token(&self, cancel: &CancellationToken) -> Result<AccessToken> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }

        let _guard = self.refresh.lock().await;
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }

        debug!(audience = %self.audience, "refreshing federated token");
        let token = cancellable(cancel, self.exchange(cancel)).await?;
        // a failed exchange leaves the cache untouched so the next call retries
        *self.cached.write().unwrap() = Some(token.clone());
        Ok(token)
    }
}
