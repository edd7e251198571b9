//! OAuth2 token sources.
//!
//! Every credential strategy boils down to the same capability: produce a
//! bearer token that is still valid under the expiry skew. Three strategies
//! are provided — a service-account key file ([`ServiceAccountTokenSource`]),
//! a host-fed token swapped in from outside the process
//! ([`SwappableTokenSource`]), and workload identity federation
//! ([`FederatedTokenSource`]). The cached sources share one refresh
//! discipline: return the cached token while fresh, otherwise let exactly one
//! caller perform the network exchange while the rest wait on it.

use std::fmt;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

mod federation;
mod service_account;

pub use federation::{FederatedTokenSource, OidcTokenProvider};
pub use service_account::ServiceAccountTokenSource;

/// OAuth scope requested for every token exchange.
pub(crate) const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// A bearer token and the instant it stops being valid.
#[derive(Clone)]
pub struct AccessToken {
    token: SecretString,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: SecretString::from(token.into()),
            expires_at,
        }
    }

    /// The raw bearer value, for an `Authorization` header.
    pub fn expose(&self) -> &str {
        self.token.expose_secret()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// A token is expired once `now >= expires_at - skew`. A token stamped
    /// with the epoch origin is always expired.
    pub fn expired(&self, skew: Duration) -> bool {
        if self.expires_at == DateTime::UNIX_EPOCH {
            return true;
        }
        let skew = TimeDelta::from_std(skew).unwrap_or_default();
        Utc::now() >= self.expires_at - skew
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Produces a valid bearer token on demand.
#[async_trait]
pub trait TokenSource: Send + Sync + fmt::Debug {
    async fn token(&self, cancel: &CancellationToken) -> Result<AccessToken>;
}

/// Token holder updated atomically by the embedding host.
///
/// `token` returns the current value unconditionally: expiry policy belongs
/// to whoever mints the tokens outside this process.
pub struct SwappableTokenSource {
    current: RwLock<AccessToken>,
}

impl SwappableTokenSource {
    pub fn new(initial: AccessToken) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    /// Replaces the held token. Readers see either the old or new value,
    /// never a torn one.
    pub fn update(&self, next: AccessToken) {
        *self.current.write().unwrap() = next;
    }
}

impl fmt::Debug for SwappableTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwappableTokenSource")
            .field("expires_at", &self.current.read().unwrap().expires_at())
            .finish()
    }
}

#[async_trait]
impl TokenSource for SwappableTokenSource {
    async fn token(&self, _cancel: &CancellationToken) -> Result<AccessToken> {
        Ok(self.current.read().unwrap().clone())
    }
}
