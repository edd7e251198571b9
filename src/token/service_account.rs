//! Service-account key file token source.
//!
//! Implements the standard Google credential flow for a JSON key file: sign
//! an RS256 JWT assertion with the account's private key and exchange it for
//! a bearer token at the key file's `token_uri`.

use std::fmt;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{AccessToken, TokenSource, CLOUD_PLATFORM_SCOPE};
use crate::error::{Error, Result};
use crate::retry::cancellable;

/// The grant type for JWT bearer assertions (RFC 7523).
const JWT_BEARER_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Assertion lifetime requested from the token endpoint.
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// The subset of a service account key file needed to mint assertions.
#[derive(Deserialize)]
struct ServiceAccountKey {
    private_key: String,
    private_key_id: String,
    client_email: String,
    token_uri: String,
}

/// JWT claims for the service account assertion.
#[derive(Debug, Serialize)]
struct AssertionClaims {
    iss: String,
    scope: String,
    aud: String,
    iat: i64,
    exp: i64,
}

/// Response from the OAuth token endpoint.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    token_type: String,
}

pub struct ServiceAccountTokenSource {
    client_email: String,
    private_key_id: String,
    token_uri: String,
    encoding_key: EncodingKey,
    http: reqwest::Client,
    skew: Duration,
    cached: RwLock<Option<AccessToken>>,
    refresh: tokio::sync::Mutex<()>,
}

impl fmt::Debug for ServiceAccountTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountTokenSource")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

impl ServiceAccountTokenSource {
    /// Loads a key file from disk.
    pub fn from_file(path: &Path, http: reqwest::Client, skew: Duration) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::Credentials(format!("failed to read key file {}: {e}", path.display()))
        })?;
        Self::from_json(&json, http, skew)
    }

    /// Parses an inline key file body.
    pub fn from_json(json: &str, http: reqwest::Client, skew: Duration) -> Result<Self> {
        let key: ServiceAccountKey = serde_json::from_str(json)
            .map_err(|e| Error::Credentials(format!("failed to parse service account key: {e}")))?;

        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| Error::Credentials(format!("failed to parse private key: {e}")))?;

        Ok(Self {
            client_email: key.client_email,
            private_key_id: key.private_key_id,
            token_uri: key.token_uri,
            encoding_key,
            http,
            skew,
            cached: RwLock::new(None),
            refresh: tokio::sync::Mutex::new(()),
        })
    }

    fn cached_token(&self) -> Option<AccessToken> {
        let cached = self.cached.read().unwrap();
        cached.as_ref().filter(|t| !t.expired(self.skew)).cloned()
    }

    async fn exchange(&self) -> Result<AccessToken> {
        let now = Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: self.client_email.clone(),
            scope: CLOUD_PLATFORM_SCOPE.to_string(),
            aud: self.token_uri.clone(),
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.private_key_id.clone());

        let assertion = encode(&header, &claims, &self.encoding_key)
            .map_err(|e| Error::Credentials(format!("failed to sign assertion: {e}")))?;

        let response = self
            .http
            .post(&self.token_uri)
            .form(&[
                ("grant_type", JWT_BEARER_GRANT_TYPE),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                endpoint: "oauth token endpoint",
                status: status.as_u16(),
                message,
            });
        }

        let body: TokenResponse = response.json().await?;
        if body.token_type != "Bearer" {
            return Err(Error::TokenExchange(format!(
                "unexpected token type {:?}",
                body.token_type
            )));
        }

        Ok(AccessToken::new(
            body.access_token,
            Utc::now() + TimeDelta::seconds(body.expires_in),
        ))
    }
}

#[async_trait]
impl TokenSource for ServiceAccountTokenSource {
    async fn token(&self, cancel: &CancellationToken) -> Result<AccessToken> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }

        let _guard = self.refresh.lock().await;
        // another caller may have refreshed while we waited for the lock
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }

        debug!(client_email = %self.client_email, "refreshing service account token");
        let token = cancellable(cancel, self.exchange()).await?;
        *self.cached.write().unwrap() = Some(token.clone());
        Ok(token)
    }
}
