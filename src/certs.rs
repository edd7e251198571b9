//! Ephemeral client certificate manager.
//!
//! Owns one RSA-2048 keypair per manager lifetime and the most recent
//! certificate the control plane signed for it. The keypair is generated
//! lazily and reused across renewals; only the certificate rotates. A
//! background task pre-warms the cache so connections rarely pay the
//! signing round-trip.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::admin::{parse_cert_pem, SqlAdminClient};
use crate::config::InstanceKey;
use crate::error::{Error, Result};
use crate::retry::{with_backoff, BackoffPolicy};

const RSA_KEY_BITS: usize = 2048;

/// A signed client certificate re-associated with the manager's private key,
/// ready for one TLS handshake (stores raw bytes for Clone).
pub struct ClientIdentity {
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
    not_after: DateTime<Utc>,
}

impl ClientIdentity {
    pub fn cert(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.cert_der.clone())
    }

    pub fn key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }
}

/// The generated keypair in the two encodings the manager needs: PKCS#8 DER
/// for the TLS stack, SPKI PEM for the signing request.
struct KeyMaterial {
    private_pkcs8: Vec<u8>,
    public_spki_pem: String,
}

struct RotationTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct CertManager {
    admin: Arc<SqlAdminClient>,
    key: InstanceKey,
    refresh_window: Duration,
    rotation_interval: Duration,
    backoff: BackoffPolicy,
    keypair: tokio::sync::Mutex<Option<Arc<KeyMaterial>>>,
    current: tokio::sync::Mutex<Option<Arc<ClientIdentity>>>,
    rotation: std::sync::Mutex<Option<RotationTask>>,
}

impl CertManager {
    /// Creates the manager and starts its background rotation task.
    pub fn new(
        admin: Arc<SqlAdminClient>,
        key: InstanceKey,
        refresh_window: Duration,
        rotation_interval: Duration,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            admin,
            key,
            refresh_window,
            rotation_interval,
            backoff: BackoffPolicy::default(),
            keypair: tokio::sync::Mutex::new(None),
            current: tokio::sync::Mutex::new(None),
            rotation: std::sync::Mutex::new(None),
        });
        manager.spawn_rotation();
        manager
    }

    /// Returns a certificate whose `notAfter` clears the refresh window,
    /// renewing through the admin API when the cached one is stale.
    ///
    /// Holding the cache lock across the admin call is what makes the
    /// refresh single-flight: concurrent callers queue behind the one doing
    /// the network round-trip and all observe its result.
    pub async fn get_valid_client_certificate(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<ClientIdentity>> {
        let mut current = self.current.lock().await;

        let window = TimeDelta::from_std(self.refresh_window).unwrap_or_default();
        if let Some(identity) = current.as_ref() {
            if identity.not_after > Utc::now() + window {
                return Ok(Arc::clone(identity));
            }
        }

        let keypair = self.keypair().await?;
        let cert_pem = with_backoff(&self.backoff, cancel, || {
            self.admin
                .generate_ephemeral_cert(&self.key, &keypair.public_spki_pem, cancel)
        })
        .await?;

        let identity = Arc::new(bind_identity(&cert_pem, &keypair)?);
        debug!(key = %self.key, not_after = %identity.not_after, "refreshed ephemeral certificate");
        *current = Some(Arc::clone(&identity));
        Ok(identity)
    }

    /// Cancels and joins the background rotation task.
    pub async fn stop_background_refresh(&self) {
        let task = self.rotation.lock().unwrap().take();
        if let Some(task) = task {
            task.cancel.cancel();
            let _ = task.handle.await;
        }
    }

    /// Drops the cached certificate and keypair.
    pub(crate) async fn dispose(&self) {
        *self.current.lock().await = None;
        *self.keypair.lock().await = None;
    }

    /// The RSA keypair, generated on first use and reused for every renewal.
    async fn keypair(&self) -> Result<Arc<KeyMaterial>> {
        let mut slot = self.keypair.lock().await;
        if let Some(material) = slot.as_ref() {
            return Ok(Arc::clone(material));
        }

        debug!(key = %self.key, "generating rsa keypair");
        let material = tokio::task::spawn_blocking(generate_key_material)
            .await
            .map_err(|e| Error::Certificate(format!("keygen task failed: {e}")))??;
        let material = Arc::new(material);
        *slot = Some(Arc::clone(&material));
        Ok(material)
    }

    fn spawn_rotation(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = tokio::time::sleep(manager.rotation_interval) => {
                        if let Err(e) = manager.get_valid_client_certificate(&child).await {
                            warn!(key = %manager.key, error = %e, "background certificate refresh failed");
                        }
                    }
                }
            }
        });
        *self.rotation.lock().unwrap() = Some(RotationTask { cancel, handle });
    }
}

fn generate_key_material() -> Result<KeyMaterial> {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
        .map_err(|e| Error::Certificate(format!("failed to generate rsa key: {e}")))?;

    let private_pkcs8 = private_key
        .to_pkcs8_der()
        .map_err(|e| Error::Certificate(format!("failed to encode private key: {e}")))?
        .as_bytes()
        .to_vec();

    let public_spki_pem = private_key
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| Error::Certificate(format!("failed to encode public key: {e}")))?;

    Ok(KeyMaterial {
        private_pkcs8,
        public_spki_pem,
    })
}

/// Re-associates the signed certificate with the held private key. The
/// control plane produces the certificate detached from the key; rustls
/// accepts the pair directly, so no container serialization is involved.
fn bind_identity(cert_pem: &str, keypair: &KeyMaterial) -> Result<ClientIdentity> {
    let mut certs = parse_cert_pem(cert_pem)?;
    let cert = certs.remove(0);
    let not_after = cert_not_after(cert.as_ref())?;

    Ok(ClientIdentity {
        cert_der: cert.as_ref().to_vec(),
        key_der: keypair.private_pkcs8.clone(),
        not_after,
    })
}

fn cert_not_after(der: &[u8]) -> Result<DateTime<Utc>> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| Error::Certificate(format!("failed to parse ephemeral certificate: {e}")))?;
    let timestamp = cert.validity().not_after.timestamp();
    DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| Error::Certificate("ephemeral certificate notAfter out of range".into()))
}
