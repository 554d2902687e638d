//! Notification registry
//!
//! Tracks live dependencies, correlates them with server-side subscriptions,
//! fans out invalidations and expires dependencies whose deadline passed.
//!
//! # Locking
//!
//! One mutex guards every map and the timeout horizon. `Dependency::invalidate`
//! runs user code and is never called with that mutex held: each batch is
//! removed from the maps under one lock acquisition, the lock is released,
//! and only then are the callbacks invoked. A concurrent `add_command_entry`
//! for the same dependency therefore sees it either fully present or fully
//! gone.
//!
//! # Timeout sweep
//!
//! ```text
//! lock   : empty or horizon in the future? -> return
//!          snapshot all dependencies
//! unlock : invalidate expired ones (Change, Error, Timeout)
//!          compute the next horizon from the survivors
//! lock   : remove expired ones, store the horizon (never later than a
//!          horizon another thread set meanwhile)
//! ```
//!
//! A dependency may outlive its deadline by up to one sweep interval.

use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::dependency::Dependency;
use super::dispatcher::ProcessDispatcher;
use super::{NotificationInfo, NotificationSource, NotificationType, SqlNotification};
use crate::error::{Error, Result};

/// Default interval between timeout sweeps
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 15_000;

/// Registry configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Interval between timeout sweeps in milliseconds
    pub sweep_interval_ms: u64,
    /// Fixed domain key (generated when unset)
    pub domain_key: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            domain_key: None,
        }
    }
}

impl RegistryConfig {
    /// Default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sweep interval
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set a fixed domain key
    pub fn with_domain_key(mut self, key: impl Into<String>) -> Self {
        self.domain_key = Some(key.into());
        self
    }

    /// Sweep interval (at least one millisecond)
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

/// Registry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Dependencies registered
    pub dependencies_added: u64,
    /// Dependencies invalidated by notification or server loss
    pub dependencies_invalidated: u64,
    /// Dependencies expired by the sweep
    pub dependencies_timed_out: u64,
    /// Invalidation callbacks that returned a non-fatal error
    pub callback_failures: u64,
    /// Sweeps that scanned the registry
    pub sweeps: u64,
}

/// Atomic registry stats for concurrent updates
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicRegistryStats {
    pub dependencies_added: AtomicU64,
    pub dependencies_invalidated: AtomicU64,
    pub dependencies_timed_out: AtomicU64,
    pub callback_failures: AtomicU64,
    pub sweeps: AtomicU64,
}

impl AtomicRegistryStats {
    /// Create new atomic stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a registration
    pub fn record_added(&self) {
        self.dependencies_added.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an invalidation
    pub fn record_invalidated(&self) {
        self.dependencies_invalidated.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an expiry
    pub fn record_timed_out(&self) {
        self.dependencies_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed callback
    pub fn record_callback_failure(&self) {
        self.callback_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a scanning sweep
    pub fn record_sweep(&self) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot current stats
    pub fn snapshot(&self) -> RegistryStats {
        RegistryStats {
            dependencies_added: self.dependencies_added.load(Ordering::Relaxed),
            dependencies_invalidated: self.dependencies_invalidated.load(Ordering::Relaxed),
            dependencies_timed_out: self.dependencies_timed_out.load(Ordering::Relaxed),
            callback_failures: self.callback_failures.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
        }
    }
}

/// Earlier of two deadlines, `None` meaning never
fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

struct RegistryState {
    dependency_by_id: HashMap<String, Arc<dyn Dependency>>,
    command_to_correlation_id: HashMap<String, String>,
    key_to_dependencies: HashMap<String, Vec<Arc<dyn Dependency>>>,
    next_timeout: Option<Instant>,
    /// Bumped whenever a dependency or deadline is added
    horizon_epoch: u64,
    timer_enabled: bool,
    timer_started: bool,
}

impl RegistryState {
    /// Drop `id` from every map; disables the timer once empty
    fn remove_dependency(&mut self, id: &str) {
        self.dependency_by_id.remove(id);
        self.strip_from_keys(id);
        if self.dependency_by_id.is_empty() {
            self.timer_enabled = false;
        }
    }

    fn strip_from_keys(&mut self, id: &str) {
        self.key_to_dependencies.retain(|_, deps| {
            deps.retain(|d| d.id() != id);
            !deps.is_empty()
        });
    }

    /// Forget fingerprints whose subscription has no dependencies left
    fn prune_commands(&mut self, domain_key: &str) {
        let live_keys = &self.key_to_dependencies;
        self.command_to_correlation_id.retain(|_, correlation_id| {
            live_keys.contains_key(&format!("{};{}", domain_key, correlation_id))
        });
    }
}

/// Per-process registry of query-notification dependencies
pub struct NotificationRegistry {
    config: RegistryConfig,
    domain_key: String,
    state: Mutex<RegistryState>,
    stats: Arc<AtomicRegistryStats>,
    dispatcher: Option<Arc<dyn ProcessDispatcher>>,
    timer_wake: Arc<Notify>,
    shutdown: broadcast::Sender<()>,
    is_shutdown: AtomicBool,
    self_ref: Weak<Self>,
}

impl NotificationRegistry {
    /// Create a registry
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        Self::build(config, None)
    }

    /// Create a registry that reports teardown to `dispatcher`
    pub fn with_dispatcher(
        config: RegistryConfig,
        dispatcher: Arc<dyn ProcessDispatcher>,
    ) -> Arc<Self> {
        Self::build(config, Some(dispatcher))
    }

    fn build(config: RegistryConfig, dispatcher: Option<Arc<dyn ProcessDispatcher>>) -> Arc<Self> {
        let domain_key = config
            .domain_key
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let (shutdown, _) = broadcast::channel(1);

        Arc::new_cyclic(|weak| Self {
            config,
            domain_key,
            state: Mutex::new(RegistryState {
                dependency_by_id: HashMap::new(),
                command_to_correlation_id: HashMap::new(),
                key_to_dependencies: HashMap::new(),
                next_timeout: None,
                horizon_epoch: 0,
                timer_enabled: false,
                timer_started: false,
            }),
            stats: Arc::new(AtomicRegistryStats::new()),
            dispatcher,
            timer_wake: Arc::new(Notify::new()),
            shutdown,
            is_shutdown: AtomicBool::new(false),
            self_ref: weak.clone(),
        })
    }

    /// Key identifying this registry in correlation keys
    pub fn domain_key(&self) -> &str {
        &self.domain_key
    }

    /// Registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Statistics snapshot
    pub fn stats(&self) -> RegistryStats {
        self.stats.snapshot()
    }

    /// Number of tracked dependencies
    pub fn len(&self) -> usize {
        self.state.lock().dependency_by_id.len()
    }

    /// Whether no dependency is tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest deadline the sweep is waiting for
    pub fn next_timeout(&self) -> Option<Instant> {
        self.state.lock().next_timeout
    }

    /// Whether the sweep timer is enabled
    pub fn is_timer_enabled(&self) -> bool {
        self.state.lock().timer_enabled
    }

    /// Number of command fingerprints with a live subscription
    pub fn command_count(&self) -> usize {
        self.state.lock().command_to_correlation_id.len()
    }

    /// Ids of the dependencies sharing the subscription under `key`
    pub fn dependencies_for_key(&self, key: &str) -> Vec<String> {
        self.state
            .lock()
            .key_to_dependencies
            .get(key)
            .map(|deps| deps.iter().map(|d| d.id().to_string()).collect())
            .unwrap_or_default()
    }

    /// Track `dependency` under its id
    pub fn add_dependency_entry(&self, dependency: Arc<dyn Dependency>) -> Result<()> {
        let id = dependency.id().to_string();
        if id.is_empty() {
            return Err(Error::argument_null("dependency id"));
        }

        let mut state = self.state.lock();
        match state.dependency_by_id.entry(id) {
            Entry::Occupied(entry) => {
                return Err(Error::DuplicateDependency {
                    id: entry.key().clone(),
                })
            }
            Entry::Vacant(entry) => {
                debug!(dependency_id = %entry.key(), "dependency added");
                entry.insert(dependency);
            }
        }
        state.horizon_epoch += 1;
        drop(state);

        self.stats.record_added();
        Ok(())
    }

    /// Attach `dependency` to the subscription for `fingerprint`.
    ///
    /// Returns the correlation key to send with the command, or `None` when
    /// the dependency was already invalidated. Dependencies whose commands
    /// share a fingerprint share one key.
    pub fn add_command_entry(&self, fingerprint: &str, dependency: &dyn Dependency) -> Option<String> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(registered) = state.dependency_by_id.get(dependency.id()).cloned() else {
            debug!(
                dependency_id = dependency.id(),
                "dependency already invalidated; not registering command"
            );
            return None;
        };

        let correlation_id = state
            .command_to_correlation_id
            .entry(fingerprint.to_string())
            .or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        let key = format!("{};{}", self.domain_key, correlation_id);

        let dependencies = state.key_to_dependencies.entry(key.clone()).or_default();
        if !dependencies.iter().any(|d| d.id() == registered.id()) {
            dependencies.push(registered);
        }
        Some(key)
    }

    /// Find a tracked dependency.
    ///
    /// Missing entries are not an error: the dependency may already have
    /// fired or expired.
    pub fn lookup_dependency_entry(&self, id: &str) -> Result<Option<Arc<dyn Dependency>>> {
        if id.is_empty() {
            return Err(Error::DependencyIdMismatch { id: id.to_string() });
        }

        let found = self.state.lock().dependency_by_id.get(id).cloned();
        if found.is_none() {
            debug!(dependency_id = id, "dependency not found");
        }
        Ok(found)
    }

    /// Strip a dependency that fired on its own from every subscription,
    /// dropping subscriptions left without dependencies
    pub fn remove_dependency_from_command_map(&self, id: &str) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        state.strip_from_keys(id);
        state.prune_commands(&self.domain_key);
    }

    /// Invalidate every dependency sharing `notification.key`
    pub fn invalidate_by_correlation_key(&self, notification: &SqlNotification) -> Result<()> {
        let Some(key) = notification.key.as_deref() else {
            debug!("notification without correlation key ignored");
            return Ok(());
        };

        let dependencies = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match state.key_to_dependencies.remove(key) {
                Some(dependencies) => {
                    for dep in &dependencies {
                        state.remove_dependency(dep.id());
                    }
                    state.prune_commands(&self.domain_key);
                    dependencies
                }
                None => {
                    debug!(key, "no dependencies for key; already invalidated");
                    return Ok(());
                }
            }
        };

        debug!(key, count = dependencies.len(), "invalidating dependencies");
        self.fan_out(
            &dependencies,
            notification.kind,
            notification.info,
            notification.source,
        )
    }

    /// Invalidate every dependency subscribed on `server`
    pub fn invalidate_by_server(&self, server: &str, notification: &SqlNotification) -> Result<()> {
        let dependencies: Vec<Arc<dyn Dependency>> = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let affected: Vec<Arc<dyn Dependency>> = state
                .dependency_by_id
                .values()
                .filter(|d| d.server_list().iter().any(|s| s == server))
                .cloned()
                .collect();
            for dep in &affected {
                state.remove_dependency(dep.id());
            }
            if !affected.is_empty() {
                state.prune_commands(&self.domain_key);
            }
            affected
        };

        if dependencies.is_empty() {
            return Ok(());
        }
        info!(server, count = dependencies.len(), "invalidating dependencies for server");
        self.fan_out(
            &dependencies,
            notification.kind,
            notification.info,
            notification.source,
        )
    }

    /// Enable the sweep and pull the horizon in to `dependency`'s deadline.
    ///
    /// No-op once the registry is shut down.
    pub fn start_timer(&self, dependency: &dyn Dependency) {
        if self.is_shutdown.load(Ordering::Acquire) {
            debug!(dependency_id = dependency.id(), "registry shut down; timer not started");
            return;
        }
        let expiration = dependency.expiration_time();
        let first_start = {
            let mut state = self.state.lock();
            if state.timer_enabled {
                state.next_timeout = earliest(state.next_timeout, expiration);
            } else {
                state.timer_enabled = true;
                state.next_timeout = expiration;
            }
            state.horizon_epoch += 1;

            let first = !state.timer_started;
            state.timer_started = true;
            first
        };

        if first_start && !self.spawn_sweeper() {
            self.state.lock().timer_started = false;
        }
        self.timer_wake.notify_one();
    }

    /// Expire dependencies past their deadline.
    ///
    /// Returns how many expired. Only a fatal callback error is returned;
    /// dependencies already marked are still removed first.
    pub fn sweep_timeouts(&self) -> Result<usize> {
        let (snapshot, epoch) = {
            let state = self.state.lock();
            if state.dependency_by_id.is_empty() {
                return Ok(0);
            }
            match state.next_timeout {
                Some(deadline) if deadline <= Instant::now() => {}
                _ => return Ok(0),
            }
            let snapshot: Vec<Arc<dyn Dependency>> =
                state.dependency_by_id.values().cloned().collect();
            (snapshot, state.horizon_epoch)
        };
        self.stats.record_sweep();

        let now = Instant::now();
        let mut expired = Vec::new();
        let mut next_timeout = None;
        let mut fatal = None;

        for dep in &snapshot {
            match dep.expiration_time() {
                Some(deadline) if deadline <= now => {
                    expired.push(dep.id().to_string());
                    self.stats.record_timed_out();
                    if let Err(e) = self.invalidate_one(
                        dep.as_ref(),
                        NotificationType::Change,
                        NotificationInfo::Error,
                        NotificationSource::Timeout,
                    ) {
                        fatal = Some(e);
                        break;
                    }
                }
                deadline => next_timeout = earliest(next_timeout, deadline),
            }
        }

        {
            let mut state = self.state.lock();
            for id in &expired {
                state.remove_dependency(id);
            }
            if !expired.is_empty() {
                state.prune_commands(&self.domain_key);
            }
            state.next_timeout = if fatal.is_none() && state.horizon_epoch == epoch {
                next_timeout
            } else {
                earliest(state.next_timeout, next_timeout)
            };
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "dependencies timed out");
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(expired.len()),
        }
    }

    /// Stop the sweep timer and report teardown to the dispatcher
    pub fn shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(());
        self.state.lock().timer_enabled = false;

        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.queue_app_domain_unloading(&self.domain_key);
        }
        info!(domain_key = %self.domain_key, "notification registry shut down");
    }

    fn fan_out(
        &self,
        dependencies: &[Arc<dyn Dependency>],
        kind: NotificationType,
        info: NotificationInfo,
        source: NotificationSource,
    ) -> Result<()> {
        for dep in dependencies {
            self.stats.record_invalidated();
            self.invalidate_one(dep.as_ref(), kind, info, source)?;
        }
        Ok(())
    }

    /// Run one callback; swallow and trace anything short of fatal
    fn invalidate_one(
        &self,
        dependency: &dyn Dependency,
        kind: NotificationType,
        info: NotificationInfo,
        source: NotificationSource,
    ) -> Result<()> {
        match dependency.invalidate(kind, info, source) {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => {
                error!(dependency_id = dependency.id(), error = %e, "fatal error during invalidation");
                Err(e)
            }
            Err(e) => {
                self.stats.record_callback_failure();
                warn!(dependency_id = dependency.id(), error = %e, "invalidation callback failed");
                Ok(())
            }
        }
    }

    /// Spawn the sweep task on the current runtime
    fn spawn_sweeper(&self) -> bool {
        if self.is_shutdown.load(Ordering::Acquire) {
            return false;
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("no tokio runtime; timeouts are swept only on demand");
                return false;
            }
        };

        let registry = self.self_ref.clone();
        let wake = self.timer_wake.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let period = self.config.sweep_interval();

        handle.spawn(async move {
            loop {
                // Parked while disabled
                loop {
                    match registry.upgrade() {
                        Some(r) if r.is_timer_enabled() => break,
                        Some(_) => {}
                        None => return,
                    }
                    tokio::select! {
                        _ = wake.notified() => {}
                        _ = shutdown_rx.recv() => return,
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = shutdown_rx.recv() => return,
                }

                let Some(r) = registry.upgrade() else { return };
                if let Err(e) = r.sweep_timeouts() {
                    error!(error = %e, "timeout sweep aborted");
                }
            }
        });
        debug!(domain_key = %self.domain_key, ?period, "timeout sweep started");
        true
    }
}

impl Drop for NotificationRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for NotificationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationRegistry")
            .field("domain_key", &self.domain_key)
            .field("config", &self.config)
            .field("dependencies", &self.len())
            .field("timer_enabled", &self.is_timer_enabled())
            .finish()
    }
}
