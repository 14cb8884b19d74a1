//! Bounded pools for outbound fetch work.
//!
//! Three kinds of pool: one global request pool, one pool per host that has
//! a configured limit (created lazily on first use), and one pool for browser
//! instances. A capacity-1 lock plus a one-shot flag serialises the browser
//! runtime installation.
//!
//! Slots are owned permits: dropping the guard releases the slot, so every
//! exit path (success, error, timeout, unwinding) gives it back exactly once.
//! The governor never retries. It blocks, times out, or grants.

use crate::types::{CarveError, CarveResult};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Default capacity of the global request pool.
pub const DEFAULT_HTTP_WORKERS: usize = 1000;

/// Pool capacities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    #[serde(default = "default_http_workers")]
    pub http_workers: usize,
    /// Concurrent browser instances; unlimited when unset.
    #[serde(default)]
    pub browser_instances: Option<usize>,
    /// Per-host capacities keyed by host name.
    #[serde(default)]
    pub host_limits: HashMap<String, usize>,
    /// Capacity for hosts without an explicit entry; unlimited when unset.
    #[serde(default)]
    pub default_host_limit: Option<usize>,
}

fn default_http_workers() -> usize {
    DEFAULT_HTTP_WORKERS
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            http_workers: DEFAULT_HTTP_WORKERS,
            browser_instances: None,
            host_limits: HashMap::new(),
            default_host_limit: None,
        }
    }
}

impl GovernorConfig {
    /// Defaults overridden by `CARVE_HTTP_WORKERS` and `CARVE_BROWSER_INSTANCES`.
    ///
    /// Unparseable or non-positive values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = env_limit("CARVE_HTTP_WORKERS") {
            config.http_workers = n;
        }
        if let Some(n) = env_limit("CARVE_BROWSER_INSTANCES") {
            config.browser_instances = Some(n);
        }
        config
    }
}

fn env_limit(key: &str) -> Option<usize> {
    parse_limit(&std::env::var(key).ok()?)
}

fn parse_limit(raw: &str) -> Option<usize> {
    raw.trim().parse::<usize>().ok().filter(|n| *n > 0)
}

/// Global slot plus, when the host is limited, a host slot.
#[derive(Debug)]
pub struct RequestPermit {
    _global: OwnedSemaphorePermit,
    _host: Option<OwnedSemaphorePermit>,
}

/// Owner of every concurrency pool used by fetchers.
pub struct Governor {
    config: GovernorConfig,
    global: Arc<Semaphore>,
    hosts: DashMap<String, Arc<Semaphore>>,
    browser: Option<Arc<Semaphore>>,
    install_lock: Mutex<()>,
    installed: AtomicBool,
}

impl Governor {
    pub fn new(config: GovernorConfig) -> Self {
        let global = Arc::new(Semaphore::new(config.http_workers.max(1)));
        let browser = config
            .browser_instances
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        Self {
            config,
            global,
            hosts: DashMap::new(),
            browser,
            install_lock: Mutex::new(()),
            installed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Acquire the global slot, then the host slot, in that order.
    pub async fn acquire_request(&self, host: &str, deadline: Instant) -> CarveResult<RequestPermit> {
        let global = acquire(&self.global, deadline, "global request pool").await?;
        let host_slot = match self.host_pool(host) {
            Some(pool) => Some(acquire(&pool, deadline, "host pool").await?),
            None => None,
        };
        Ok(RequestPermit {
            _global: global,
            _host: host_slot,
        })
    }

    /// Acquire a browser-instance slot. `None` when browsers are unlimited.
    pub async fn acquire_browser(&self, deadline: Instant) -> CarveResult<Option<OwnedSemaphorePermit>> {
        match &self.browser {
            Some(pool) => acquire(pool, deadline, "browser pool").await.map(Some),
            None => Ok(None),
        }
    }

    /// Run `install` at most once for the lifetime of this governor.
    ///
    /// Check, lock, check again: once the flag is set callers never touch the
    /// lock. A failed install leaves the flag clear so the next caller retries.
    pub async fn install_once<F, Fut>(&self, deadline: Instant, install: F) -> CarveResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CarveResult<()>>,
    {
        if self.installed.load(Ordering::Acquire) {
            return Ok(());
        }

        let _guard = tokio::time::timeout_at(deadline, self.install_lock.lock())
            .await
            .map_err(|_| CarveError::Timeout("waiting for the install lock".to_string()))?;

        if self.installed.load(Ordering::Acquire) {
            tracing::debug!("browser runtime already installed");
            return Ok(());
        }

        tracing::info!("running one-shot browser runtime installation");
        install().await?;
        self.installed.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    /// Global slots currently held.
    pub fn in_flight(&self) -> usize {
        self.config.http_workers.max(1) - self.global.available_permits()
    }

    fn host_pool(&self, host: &str) -> Option<Arc<Semaphore>> {
        let limit = self
            .config
            .host_limits
            .get(host)
            .copied()
            .or(self.config.default_host_limit)?;
        let pool = self
            .hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(limit.max(1))));
        Some(Arc::clone(pool.value()))
    }
}

async fn acquire(pool: &Arc<Semaphore>, deadline: Instant, label: &str) -> CarveResult<OwnedSemaphorePermit> {
    match tokio::time::timeout_at(deadline, Arc::clone(pool).acquire_owned()).await {
        Ok(Ok(permit)) => Ok(permit),
        Ok(Err(_)) => Err(CarveError::Transport(format!("{label} is closed"))),
        Err(_) => {
            tracing::warn!(pool = label, "slot acquisition hit the deadline");
            Err(CarveError::Timeout(format!("waiting for a slot in the {label}")))
        }
    }
}
