//! Dependencies tracked by the notification registry

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

use super::{NotificationInfo, NotificationSource, NotificationType};
use crate::error::Result;

/// Something that wants to hear when a command's results change.
///
/// `invalidate` runs user code; the registry never calls it while holding
/// its lock.
pub trait Dependency: Send + Sync {
    /// Unique id
    fn id(&self) -> &str;

    /// Servers the dependency has subscriptions on
    fn server_list(&self) -> Vec<String>;

    /// Deadline; `None` never expires
    fn expiration_time(&self) -> Option<Instant>;

    /// Deliver a notification
    fn invalidate(
        &self,
        kind: NotificationType,
        info: NotificationInfo,
        source: NotificationSource,
    ) -> Result<()>;
}

/// Identity of a command for subscription sharing: a digest of the command
/// text and its parameter values
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandFingerprint(String);

impl CommandFingerprint {
    /// Fingerprint `text` with `(name, value)` parameters
    pub fn new<'a>(text: &str, parameters: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update((text.len() as u64).to_le_bytes());
        hasher.update(text.as_bytes());
        for (name, value) in parameters {
            hasher.update((name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            hasher.update((value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Hex digest
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CommandFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Arguments passed to change handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationEventArgs {
    /// Event kind
    pub kind: NotificationType,
    /// Reason
    pub info: NotificationInfo,
    /// Origin
    pub source: NotificationSource,
}

type ChangeHandler = Arc<dyn Fn(&NotificationEventArgs) -> Result<()> + Send + Sync>;

struct DependencyState {
    servers: BTreeSet<String>,
    handlers: Vec<ChangeHandler>,
    fired: Option<NotificationEventArgs>,
}

/// Dependency that fires its change handlers exactly once
pub struct SqlDependency {
    id: String,
    expiration: Option<Instant>,
    state: Mutex<DependencyState>,
}

impl SqlDependency {
    /// Create a dependency for the registry identified by `domain_key`.
    ///
    /// `timeout` of `None` never expires.
    pub fn new(domain_key: &str, timeout: Option<Duration>) -> Self {
        Self {
            id: format!("{};{}", Uuid::new_v4(), domain_key),
            expiration: timeout.map(|t| Instant::now() + t),
            state: Mutex::new(DependencyState {
                servers: BTreeSet::new(),
                handlers: Vec::new(),
                fired: None,
            }),
        }
    }

    /// Create a dependency with an explicit deadline
    pub fn with_expiration(domain_key: &str, expiration: Instant) -> Self {
        let mut dep = Self::new(domain_key, None);
        dep.expiration = Some(expiration);
        dep
    }

    /// Record a server the dependency subscribed on
    pub fn add_server(&self, server: impl Into<String>) {
        self.state.lock().servers.insert(server.into());
    }

    /// Whether the dependency has fired
    pub fn has_changes(&self) -> bool {
        self.state.lock().fired.is_some()
    }

    /// Register a change handler.
    ///
    /// A handler added after the dependency fired runs immediately.
    pub fn on_change<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&NotificationEventArgs) -> Result<()> + Send + Sync + 'static,
    {
        let handler: ChangeHandler = Arc::new(handler);
        let fired = {
            let mut state = self.state.lock();
            if state.fired.is_none() {
                state.handlers.push(handler.clone());
            }
            state.fired
        };
        match fired {
            Some(args) => handler(&args),
            None => Ok(()),
        }
    }
}

impl Dependency for SqlDependency {
    fn id(&self) -> &str {
        &self.id
    }

    fn server_list(&self) -> Vec<String> {
        self.state.lock().servers.iter().cloned().collect()
    }

    fn expiration_time(&self) -> Option<Instant> {
        self.expiration
    }

    fn invalidate(
        &self,
        kind: NotificationType,
        info: NotificationInfo,
        source: NotificationSource,
    ) -> Result<()> {
        let args = NotificationEventArgs { kind, info, source };
        let handlers = {
            let mut state = self.state.lock();
            if state.fired.is_some() {
                return Ok(());
            }
            state.fired = Some(args);
            std::mem::take(&mut state.handlers)
        };

        debug!(dependency_id = %self.id, %kind, %info, %source, "dependency fired");

        let mut first_error = None;
        for handler in handlers {
            if let Err(e) = handler(&args) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for SqlDependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlDependency")
            .field("id", &self.id)
            .field("expiration", &self.expiration)
            .field("has_changes", &self.has_changes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fingerprint_depends_on_parameters() {
        let a = CommandFingerprint::new("SELECT id FROM dbo.orders WHERE c = @c", [("@c", "1")]);
        let b = CommandFingerprint::new("SELECT id FROM dbo.orders WHERE c = @c", [("@c", "1")]);
        let c = CommandFingerprint::new("SELECT id FROM dbo.orders WHERE c = @c", [("@c", "2")]);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_fingerprint_is_length_delimited() {
        let a = CommandFingerprint::new("ab", [("c", "")]);
        let b = CommandFingerprint::new("a", [("bc", "")]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_dependency_fires_once() {
        let dep = SqlDependency::new("domain", Some(Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        dep.on_change(move |args| {
            assert_eq!(args.info, NotificationInfo::Insert);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        dep.invalidate(
            NotificationType::Change,
            NotificationInfo::Insert,
            NotificationSource::Data,
        )
        .unwrap();
        dep.invalidate(
            NotificationType::Change,
            NotificationInfo::Delete,
            NotificationSource::Data,
        )
        .unwrap();

        assert!(dep.has_changes());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_handler_runs_immediately() {
        let dep = SqlDependency::new("domain", None);
        dep.invalidate(
            NotificationType::Change,
            NotificationInfo::Error,
            NotificationSource::Timeout,
        )
        .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        dep.on_change(move |args| {
            assert_eq!(args.source, NotificationSource::Timeout);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_error_surfaces_after_all_handlers_run() {
        let dep = SqlDependency::new("domain", None);
        let calls = Arc::new(AtomicUsize::new(0));

        dep.on_change(|_| Err(Error::notification("first handler failed")))
            .unwrap();
        let counter = calls.clone();
        dep.on_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        let result = dep.invalidate(
            NotificationType::Change,
            NotificationInfo::Update,
            NotificationSource::Data,
        );
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_server_list_and_expiration() {
        let dep = SqlDependency::new("domain", None);
        dep.add_server("db02");
        dep.add_server("db01");
        dep.add_server("db01");

        assert_eq!(dep.server_list(), vec!["db01".to_string(), "db02".to_string()]);
        assert!(dep.expiration_time().is_none());
        assert!(dep.id().ends_with(";domain"));
    }
}
