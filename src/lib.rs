//! Client-side connection broker for managed Cloud SQL instances.
//!
//! A caller names an instance by its `project:region:name` triple and gets a
//! local loopback listener back; ordinary database clients connect to it and
//! speak their native wire protocol while the broker splices every
//! connection to the instance over mutually-authenticated TLS. Ephemeral
//! client certificates (signed by the Cloud SQL control plane), OAuth2
//! bearer tokens, and server-CA pinning are handled internally.
//!
//! ```no_run
//! use cloudsql_broker::{AuthMethod, Broker, BrokerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> cloudsql_broker::Result<()> {
//! let broker = Broker::new(BrokerConfig::default());
//! let proxy = broker
//!     .start_proxy(
//!         AuthMethod::CredentialFile("/secrets/sa.json".into()),
//!         "my-project:us-central1:prod-db",
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//!
//! // hand proxy.data_source() ("tcp:127.0.0.1,<port>") to the db client
//!
//! broker.stop_proxy(&proxy).await;
//! # Ok(())
//! # }
//! ```
//!
//! Repeated `start_proxy` calls for the same key share one proxy instance
//! under a refcount; the instance is torn down when the last holder calls
//! [`Broker::stop_proxy`] (or at [`Broker::stop_all`]).

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

pub mod admin;
pub mod certs;
pub mod config;
pub mod error;
mod proxy;
mod registry;
mod retry;
pub mod token;

pub use admin::{InstanceMetadata, SqlAdminClient};
pub use config::{BrokerConfig, InstanceKey};
pub use error::{Error, Result};
pub use proxy::ProxyInstance;
pub use registry::AuthMode;
pub use token::{
    AccessToken, FederatedTokenSource, OidcTokenProvider, ServiceAccountTokenSource,
    SwappableTokenSource, TokenSource,
};

use certs::CertManager;
use registry::Registry;

/// How `start_proxy` should authenticate to the control plane.
pub enum AuthMethod {
    /// Path to a service account key file.
    CredentialFile(PathBuf),
    /// Inline service account key JSON.
    CredentialJson(String),
    /// Caller-supplied token source (swappable, federated, or custom).
    TokenSource(Arc<dyn TokenSource>),
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::CredentialFile(path) => {
                f.debug_tuple("CredentialFile").field(path).finish()
            }
            AuthMethod::CredentialJson(_) => f.debug_tuple("CredentialJson").field(&"…").finish(),
            AuthMethod::TokenSource(source) => {
                f.debug_tuple("TokenSource").field(source).finish()
            }
        }
    }
}

/// The broker facade: owns the registry and translates `start`/`stop` calls
/// into registry operations.
pub struct Broker {
    config: BrokerConfig,
    http: reqwest::Client,
    registry: Arc<Registry>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            registry: Arc::new(Registry::new()),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Starts (or joins) the proxy for `instance`, blocking until it is
    /// ready to accept connections or its construction fails.
    pub async fn start_proxy(
        &self,
        auth: AuthMethod,
        instance: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<ProxyInstance>> {
        let key: InstanceKey = instance.parse()?;
        let skew = self.config.token_expiry_skew();

        let (mode, tokens): (AuthMode, Arc<dyn TokenSource>) = match auth {
            AuthMethod::CredentialFile(path) => (
                AuthMode::CredentialFile,
                Arc::new(ServiceAccountTokenSource::from_file(
                    &path,
                    self.http.clone(),
                    skew,
                )?),
            ),
            AuthMethod::CredentialJson(json) => (
                AuthMode::CredentialFile,
                Arc::new(ServiceAccountTokenSource::from_json(
                    &json,
                    self.http.clone(),
                    skew,
                )?),
            ),
            AuthMethod::TokenSource(source) => (AuthMode::TokenSource, source),
        };

        let admin = Arc::new(SqlAdminClient::new(
            self.http.clone(),
            tokens,
            self.config.admin_api_base.clone(),
        ));

        let factory_key = key.clone();
        let remote_port = self.config.remote_port;
        let refresh_window = self.config.cert_refresh_window();
        let rotation_interval = self.config.cert_rotation_interval();

        self.registry
            .get_or_create(
                &key,
                mode,
                move |shutdown| async move {
                    let certs = CertManager::new(
                        Arc::clone(&admin),
                        factory_key.clone(),
                        refresh_window,
                        rotation_interval,
                    );
                    Ok(Arc::new(ProxyInstance::new(
                        factory_key,
                        certs,
                        admin,
                        remote_port,
                        shutdown,
                    )))
                },
                cancel,
            )
            .await
    }

    /// Releases one reference to `instance`; the last holder's release tears
    /// the proxy down.
    pub async fn stop_proxy(&self, instance: &Arc<ProxyInstance>) {
        self.registry.release(instance).await;
    }

    /// Stops every proxy this broker started. Process-shutdown convenience.
    pub async fn stop_all(&self) {
        self.registry.stop_all().await;
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

static DEFAULT_BROKER: OnceLock<Broker> = OnceLock::new();

/// The process-wide default broker.
pub fn broker() -> &'static Broker {
    DEFAULT_BROKER.get_or_init(Broker::default)
}

/// [`Broker::start_proxy`] on the process-wide default broker.
pub async fn start_proxy(
    auth: AuthMethod,
    instance: &str,
    cancel: &CancellationToken,
) -> Result<Arc<ProxyInstance>> {
    broker().start_proxy(auth, instance, cancel).await
}

/// [`Broker::stop_proxy`] on the process-wide default broker.
pub async fn stop_proxy(instance: &Arc<ProxyInstance>) {
    broker().stop_proxy(instance).await;
}

/// [`Broker::stop_all`] on the process-wide default broker.
pub async fn stop_all() {
    broker().stop_all().await;
}
