//! Instance registry: at-most-one live proxy per instance key.
//!
//! A concurrent map holds one entry per key; the entry combines atomics, a
//! `watch` channel acting as a one-shot readiness future every waiter
//! shares, and a short mutex that elects the builder. The mutex is held only
//! to flip the election flag and clear a failed generation's outcome — never
//! across the (network-heavy) startup, which runs in a detached task.

use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::InstanceKey;
use crate::error::{Error, Result};
use crate::proxy::ProxyInstance;

/// How the proxy authenticates to the control plane. Set by the first
/// insertion for a key; later requests must match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Service account key file (or inline JSON body).
    CredentialFile,
    /// Caller-supplied token source.
    TokenSource,
}

const MODE_UNSET: u8 = 0;

impl AuthMode {
    fn as_u8(self) -> u8 {
        match self {
            AuthMode::CredentialFile => 1,
            AuthMode::TokenSource => 2,
        }
    }
}

type Readiness = Option<std::result::Result<Arc<ProxyInstance>, Arc<Error>>>;

struct Entry {
    refcount: AtomicI64,
    /// Whether a builder has been elected for the current generation.
    /// Election and the clearing of a failed generation's readiness value
    /// happen in one critical section, so an arrival that loses the
    /// election can never observe a stale failure it did not wait on.
    create_started: Mutex<bool>,
    auth_mode: AtomicU8,
    readiness: watch::Sender<Readiness>,
}

impl Entry {
    fn new() -> Self {
        let (readiness, _) = watch::channel(None);
        Self {
            refcount: AtomicI64::new(0),
            create_started: Mutex::new(false),
            auth_mode: AtomicU8::new(MODE_UNSET),
            readiness,
        }
    }

    /// Elects the caller as this generation's builder. True for exactly one
    /// caller per generation; the stale outcome of a failed previous
    /// generation is cleared before the lock is released.
    fn try_elect_builder(&self) -> bool {
        let mut started = self.create_started.lock().unwrap();
        if *started {
            return false;
        }
        *started = true;
        self.readiness.send_replace(None);
        true
    }

    /// Re-opens the election after a failed construction so the next
    /// arrival can retry.
    fn reopen_election(&self) {
        *self.create_started.lock().unwrap() = false;
    }

    fn published_instance(&self) -> Option<Arc<ProxyInstance>> {
        match &*self.readiness.borrow() {
            Some(Ok(instance)) => Some(Arc::clone(instance)),
            _ => None,
        }
    }
}

pub(crate) struct Registry {
    instances: DashMap<String, Arc<Entry>>,
    /// Construction tasks and accept loops are children of this token so
    /// nothing outlives `stop_all`.
    root: CancellationToken,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            instances: DashMap::new(),
            root: CancellationToken::new(),
        }
    }

    /// Returns the proxy for `key`, constructing it if this is the first
    /// request. Concurrent callers for the same key share one construction
    /// and one outcome; every successful return is counted and must be paired
    /// with a `release`.
    pub(crate) async fn get_or_create<F, Fut>(
        self: &Arc<Self>,
        key: &InstanceKey,
        mode: AuthMode,
        factory: F,
        cancel: &CancellationToken,
    ) -> Result<Arc<ProxyInstance>>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Arc<ProxyInstance>>> + Send + 'static,
    {
        let map_key = key.to_string();
        let entry = self
            .instances
            .entry(map_key.clone())
            .or_insert_with(|| Arc::new(Entry::new()))
            .clone();

        // the mode check precedes the refcount bump so a rejected request
        // does not leak a count
        let observed = entry.auth_mode.load(Ordering::Acquire);
        if observed != MODE_UNSET && observed != mode.as_u8() {
            return Err(Error::AuthModeConflict(map_key));
        }
        // once-only initializer; losing the race is fine
        let _ = entry.auth_mode.compare_exchange(
            MODE_UNSET,
            mode.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        entry.refcount.fetch_add(1, Ordering::AcqRel);

        if entry.try_elect_builder() {
            self.spawn_builder(map_key.clone(), Arc::clone(&entry), factory);
        }

        self.await_readiness(&map_key, entry, cancel).await
    }

    /// Runs construction in a detached task so no caller (and no lock) is
    /// pinned to it; the readiness watch broadcasts the single outcome.
    fn spawn_builder<F, Fut>(self: &Arc<Self>, map_key: String, entry: Arc<Entry>, factory: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Arc<ProxyInstance>>> + Send + 'static,
    {
        let registry = Arc::clone(self);
        let token = self.root.child_token();
        tokio::spawn(async move {
            let built: Result<Arc<ProxyInstance>> = match factory(token.clone()).await {
                Ok(instance) => match instance.start(&token).await {
                    Ok(()) => Ok(instance),
                    Err(e) => {
                        // best-effort teardown of the partial construction
                        instance.stop().await;
                        Err(e)
                    }
                },
                Err(e) => Err(e),
            };

            match built {
                Ok(instance) => {
                    info!(key = %map_key, "proxy instance ready");
                    // send_replace records the outcome even if every waiter
                    // has already detached
                    entry.readiness.send_replace(Some(Ok(instance)));
                }
                Err(e) => {
                    warn!(key = %map_key, error = %e, "proxy construction failed");
                    let shared = Arc::new(e);
                    entry.readiness.send_replace(Some(Err(shared)));
                    let removed = registry
                        .instances
                        .remove_if(&map_key, |_, v| Arc::ptr_eq(v, &entry));
                    if removed.is_none() {
                        // someone re-inserted already; let the next arrival retry
                        entry.reopen_election();
                    }
                }
            }
        });
    }

    async fn await_readiness(
        &self,
        map_key: &str,
        entry: Arc<Entry>,
        cancel: &CancellationToken,
    ) -> Result<Arc<ProxyInstance>> {
        let mut rx = entry.readiness.subscribe();
        let outcome = loop {
            {
                let current = rx.borrow_and_update();
                if let Some(outcome) = current.as_ref() {
                    break outcome.clone();
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    // abandoned: undo our count, leave construction running
                    // for the remaining waiters
                    let remaining = entry.refcount.fetch_sub(1, Ordering::AcqRel) - 1;
                    debug_assert!(remaining >= 0, "refcount underflow for {map_key}");
                    debug!(key = %map_key, "caller detached from pending construction");
                    return Err(Error::Cancelled);
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(Error::Cancelled);
                    }
                }
            }
        };

        match outcome {
            Ok(instance) => Ok(instance),
            Err(shared) => {
                let remaining = entry.refcount.fetch_sub(1, Ordering::AcqRel) - 1;
                debug_assert!(remaining >= 0, "refcount underflow for {map_key}");
                if remaining == 0 {
                    self.instances
                        .remove_if(map_key, |_, v| Arc::ptr_eq(v, &entry));
                }
                Err(Error::Startup(shared))
            }
        }
    }

    /// Drops one reference to `instance`. The last release removes the entry
    /// and stops the proxy. A handle from a superseded generation is ignored.
    pub(crate) async fn release(&self, instance: &Arc<ProxyInstance>) {
        let map_key = instance.key().to_string();
        let Some(entry) = self.instances.get(&map_key).map(|e| Arc::clone(e.value())) else {
            return;
        };

        let current_generation = entry
            .published_instance()
            .is_some_and(|current| Arc::ptr_eq(&current, instance));
        if !current_generation {
            debug!(key = %map_key, "release of a stale proxy handle ignored");
            return;
        }

        let remaining = entry.refcount.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            let removed = self
                .instances
                .remove_if(&map_key, |_, v| Arc::ptr_eq(v, &entry));
            if removed.is_some() {
                instance.stop().await;
                debug!(key = %map_key, "last holder released, proxy torn down");
            }
        } else if remaining < 0 {
            debug_assert!(false, "refcount underflow for {map_key}");
            error!(key = %map_key, "refcount underflow on release");
        }
    }

    /// Stops every registered proxy. Best-effort: not synchronized with
    /// concurrent `get_or_create` calls; meant for process shutdown.
    pub(crate) async fn stop_all(&self) {
        self.root.cancel();
        let keys: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, entry)) = self.instances.remove(&key) {
                if let Some(instance) = entry.published_instance() {
                    instance.stop().await;
                    info!(key = %key, "proxy stopped");
                }
            }
        }
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.instances.len()
    }
}
