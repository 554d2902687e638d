//! Routing of notifications to registries
//!
//! Server notifications arrive on a listener shared by the whole process and
//! must reach the registry whose domain key prefixes the correlation key.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use super::registry::NotificationRegistry;
use super::SqlNotification;
use crate::error::Result;

/// Process-level side of the notification pipeline
pub trait ProcessDispatcher: Send + Sync {
    /// A registry is going away; stop routing to `domain_key`
    fn queue_app_domain_unloading(&self, domain_key: &str);
}

/// In-process dispatcher keyed by registry domain key
#[derive(Default)]
pub struct LocalProcessDispatcher {
    registries: RwLock<HashMap<String, Weak<NotificationRegistry>>>,
}

impl LocalProcessDispatcher {
    /// Create an empty dispatcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Route notifications for `registry`'s domain key to it
    pub fn register(&self, registry: &Arc<NotificationRegistry>) {
        self.registries
            .write()
            .insert(registry.domain_key().to_string(), Arc::downgrade(registry));
    }

    /// Number of registered domains
    pub fn len(&self) -> usize {
        self.registries.read().len()
    }

    /// Whether no domain is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver a server notification to the registry named in its key
    pub fn dispatch(&self, notification: &SqlNotification) -> Result<()> {
        let Some(domain_key) = notification.domain_key() else {
            warn!(key = ?notification.key, "notification without domain key dropped");
            return Ok(());
        };

        let registry = self
            .registries
            .read()
            .get(domain_key)
            .and_then(Weak::upgrade);
        match registry {
            Some(registry) => registry.invalidate_by_correlation_key(notification),
            None => {
                debug!(domain_key, "no registry for domain; notification dropped");
                Ok(())
            }
        }
    }

    /// A server went away: invalidate its dependencies in every registry
    pub fn server_down(&self, server: &str) -> Result<()> {
        let registries: Vec<Arc<NotificationRegistry>> = self
            .registries
            .read()
            .values()
            .filter_map(Weak::upgrade)
            .collect();

        let notification = SqlNotification::server_down();
        for registry in registries {
            registry.invalidate_by_server(server, &notification)?;
        }
        Ok(())
    }
}

impl ProcessDispatcher for LocalProcessDispatcher {
    fn queue_app_domain_unloading(&self, domain_key: &str) {
        if self.registries.write().remove(domain_key).is_some() {
            debug!(domain_key, "domain unregistered");
        }
    }
}

impl std::fmt::Debug for LocalProcessDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProcessDispatcher")
            .field("domains", &self.len())
            .finish()
    }
}
