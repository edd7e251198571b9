//! Per-instance proxy: a loopback listener spliced to the remote instance
//! over mTLS.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock};

use rustls::pki_types::CertificateDer;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admin::SqlAdminClient;
use crate::certs::CertManager;
use crate::config::InstanceKey;
use crate::error::Result;
use crate::retry::{with_backoff, BackoffPolicy};

pub(crate) mod tls;

/// Where and how to reach the instance, resolved once at startup.
struct RemoteEndpoint {
    addr: SocketAddr,
    server_ca: Vec<CertificateDer<'static>>,
    expected_cn: String,
}

/// One running proxy for one instance key.
///
/// Constructed by the registry, started once, stopped once. Holders share a
/// read-only view; teardown is mediated by the registry's refcount.
pub struct ProxyInstance {
    key: InstanceKey,
    certs: Arc<CertManager>,
    admin: Arc<SqlAdminClient>,
    remote_port: u16,
    backoff: BackoffPolicy,
    data_source: OnceLock<String>,
    local_addr: OnceLock<SocketAddr>,
    shutdown: CancellationToken,
    accept_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ProxyInstance {
    pub(crate) fn new(
        key: InstanceKey,
        certs: Arc<CertManager>,
        admin: Arc<SqlAdminClient>,
        remote_port: u16,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            key,
            certs,
            admin,
            remote_port,
            backoff: BackoffPolicy::default(),
            data_source: OnceLock::new(),
            local_addr: OnceLock::new(),
            shutdown,
            accept_task: std::sync::Mutex::new(None),
        }
    }

    pub fn key(&self) -> &InstanceKey {
        &self.key
    }

    /// Local endpoint in the form the database client expects:
    /// `tcp:<host>,<port>`. Empty until the proxy has started.
    pub fn data_source(&self) -> &str {
        self.data_source.get().map(String::as_str).unwrap_or("")
    }

    /// The bound loopback address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Resolves the instance, warms the client certificate, binds the
    /// loopback listener and launches the accept loop.
    pub(crate) async fn start(self: &Arc<Self>, cancel: &CancellationToken) -> Result<()> {
        let metadata = with_backoff(&self.backoff, cancel, || {
            self.admin.instance_metadata(&self.key, cancel)
        })
        .await?;

        // obtain the first identity up front so a broken credential setup
        // fails the start instead of every later connection
        self.certs.get_valid_client_certificate(cancel).await?;

        let remote = Arc::new(RemoteEndpoint {
            addr: SocketAddr::new(metadata.ip_address, self.remote_port),
            server_ca: metadata.server_ca,
            expected_cn: self.key.server_cn(),
        });

        let listener = TcpListener::bind((IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await?;
        let addr = listener.local_addr()?;
        let _ = self.local_addr.set(addr);
        let _ = self
            .data_source
            .set(format!("tcp:{},{}", addr.ip(), addr.port()));

        info!(
            key = %self.key,
            data_source = %self.data_source(),
            remote = %remote.addr,
            "proxy started"
        );

        let instance = Arc::clone(self);
        let handle = tokio::spawn(async move { instance.accept_loop(listener, remote).await });
        *self.accept_task.lock().unwrap() = Some(handle);

        Ok(())
    }

    /// Signals the accept loop and splices to exit, joins the loop, and
    /// tears down the certificate machinery. Safe to call more than once.
    pub(crate) async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.accept_task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.certs.stop_background_refresh().await;
        self.certs.dispose().await;
        debug!(key = %self.key, "proxy stopped");
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, remote: Arc<RemoteEndpoint>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!(key = %self.key, "accept loop shutting down");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let instance = Arc::clone(&self);
                            let remote = Arc::clone(&remote);
                            tokio::spawn(async move {
                                if let Err(e) = instance.splice(stream, &remote).await {
                                    warn!(key = %instance.key, client = %peer, error = %e, "connection failed");
                                }
                            });
                        }
                        Err(e) => {
                            error!(key = %self.key, error = %e, "accept error");
                        }
                    }
                }
            }
        }
    }

    /// Carries one client connection: fresh identity, mTLS dial, then copy
    /// bytes both ways until either side closes.
    async fn splice(&self, mut local: TcpStream, remote: &RemoteEndpoint) -> Result<()> {
        let identity = self
            .certs
            .get_valid_client_certificate(&self.shutdown)
            .await?;
        let config = tls::client_config(&identity, &remote.server_ca, &remote.expected_cn)?;
        let mut upstream = tls::connect_instance(remote.addr, Arc::new(config)).await?;

        tokio::select! {
            _ = self.shutdown.cancelled() => {
                debug!(key = %self.key, "splice interrupted by shutdown");
                Ok(())
            }
            result = tokio::io::copy_bidirectional(&mut local, &mut upstream) => {
                let (to_remote, to_local) = result?;
                debug!(key = %self.key, to_remote, to_local, "connection closed");
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for ProxyInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyInstance")
            .field("key", &self.key.to_string())
            .field("data_source", &self.data_source())
            .finish()
    }
}
