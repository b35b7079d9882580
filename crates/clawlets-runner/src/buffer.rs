//! Loopback secrets buffer lifecycle.
//!
//! [`LocalSecretsBuffer::start`] binds `127.0.0.1`, serves the submit route,
//! and spawns a reaper that sweeps expired entries. Secrets come out through
//! [`take`](LocalSecretsBuffer::take) or
//! [`wait_or_prompt`](LocalSecretsBuffer::wait_or_prompt).
//! [`stop`](LocalSecretsBuffer::stop) shuts both tasks down and returns once
//! the listener is closed. Dropping the buffer without `stop` also shuts the
//! tasks down, just without waiting for them.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use clawlets_core::exec::deadline_after;

use crate::config::BufferConfig;
use crate::error::BufferError;
use crate::prompt::{SecretPrompt, StdinPrompt};
use crate::routes::{self, SUBMIT_PATH};
use crate::state::AppState;
use crate::store::{SecretMap, SecretStore};

/// How often [`LocalSecretsBuffer::wait_or_prompt`] checks the store.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// A running loopback secrets buffer.
pub struct LocalSecretsBuffer {
    store: Arc<SecretStore>,
    prompt: Arc<dyn SecretPrompt>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    server: JoinHandle<std::io::Result<()>>,
    reaper: JoinHandle<()>,
}

impl LocalSecretsBuffer {
    /// Start a buffer that falls back to reading secrets from stdin.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::InvalidConfig`] for a bad config and
    /// [`BufferError::Bind`] if the port cannot be bound.
    pub async fn start(config: BufferConfig) -> Result<Self, BufferError> {
        Self::start_with_prompt(config, Arc::new(StdinPrompt::stdin())).await
    }

    /// Start a buffer with a custom interactive fallback.
    ///
    /// # Errors
    ///
    /// Same as [`start`](Self::start).
    pub async fn start_with_prompt(
        config: BufferConfig,
        prompt: Arc<dyn SecretPrompt>,
    ) -> Result<Self, BufferError> {
        let allowed_origin = config.validate()?;

        let bind_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, config.port));
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| BufferError::Bind {
                addr: bind_addr.to_string(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr().map_err(|e| BufferError::Bind {
            addr: bind_addr.to_string(),
            reason: e.to_string(),
        })?;

        let store = Arc::new(SecretStore::new(config.ttl));
        let state = Arc::new(AppState {
            store: Arc::clone(&store),
            nonce: Zeroizing::new(config.nonce),
            allowed_origin,
            max_body_bytes: config.max_body_bytes,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let server = {
            let app = routes::router(state);
            let mut rx = shutdown_rx.clone();
            tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        rx.changed().await.ok();
                    })
                    .await
            })
        };

        let reaper = {
            let store = Arc::clone(&store);
            let mut rx = shutdown_rx;
            tokio::spawn(async move {
                reaper(&store, &mut rx).await;
            })
        };

        info!(
            addr = %local_addr,
            ttl_secs = store.ttl().as_secs(),
            sweep_ms = u64::try_from(store.sweep_interval().as_millis()).unwrap_or(u64::MAX),
            "secrets buffer listening"
        );

        Ok(Self {
            store,
            prompt,
            local_addr,
            shutdown_tx,
            server,
            reaper,
        })
    }

    /// Address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Full URL of the submit endpoint.
    #[must_use]
    pub fn submit_url(&self) -> String {
        format!("http://{}{SUBMIT_PATH}", self.local_addr)
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<SecretStore> {
        &self.store
    }

    /// Remove and return the live secrets for `job_id`, if any.
    pub fn take(&self, job_id: &str) -> Option<SecretMap> {
        self.store.take(job_id)
    }

    /// Wait up to `timeout` for secrets for `job_id`, checking every
    /// [`POLL_INTERVAL`]. On timeout, either ask the interactive prompt or
    /// fail, depending on `allow_prompt`.
    ///
    /// # Errors
    ///
    /// - [`BufferError::Timeout`] if nothing arrived and `allow_prompt` is
    ///   false. The message names the submit URL.
    /// - [`BufferError::Prompt`] if the prompt fails.
    pub async fn wait_or_prompt(
        &self,
        job_id: &str,
        timeout: Duration,
        allow_prompt: bool,
    ) -> Result<SecretMap, BufferError> {
        let started = Instant::now();
        let deadline = deadline_after(started, timeout);
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Some(secrets) = self.take(job_id) {
                debug!(job_id, count = secrets.len(), "secrets received");
                return Ok(secrets);
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if !allow_prompt {
            warn!(job_id, waited_ms, "no secrets submitted in time");
            return Err(BufferError::Timeout {
                job_id: job_id.to_owned(),
                waited_ms,
                submit_url: self.submit_url(),
            });
        }

        info!(job_id, waited_ms, "no secrets submitted, falling back to prompt");
        Ok(self.prompt.prompt(job_id).await?)
    }

    /// Stop the reaper and the HTTP server, waiting for the listener to
    /// close.
    ///
    /// Call between jobs; a submission still being handled may be cut off.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::Server`] if the server task failed.
    pub async fn stop(self) -> Result<(), BufferError> {
        self.shutdown_tx.send(true).ok();

        if let Err(e) = self.reaper.await {
            warn!(error = %e, "secrets reaper task failed");
        }

        let result = self
            .server
            .await
            .map_err(|e| BufferError::Server {
                reason: e.to_string(),
            })?
            .map_err(|e| BufferError::Server {
                reason: e.to_string(),
            });

        info!(addr = %self.local_addr, "secrets buffer stopped");
        result
    }
}

impl std::fmt::Debug for LocalSecretsBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSecretsBuffer")
            .field("local_addr", &self.local_addr)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

/// Periodically drop expired entries until shutdown.
async fn reaper(store: &SecretStore, shutdown: &mut watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(store.sweep_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                store.purge_expired();
            }
            _ = shutdown.changed() => {
                debug!("secrets reaper shutting down");
                return;
            }
        }
    }
}
