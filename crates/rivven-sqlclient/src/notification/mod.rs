//! Query notifications
//!
//! Dependencies register interest in the result of a command; the server (or
//! the client-side timeout sweep) later tells them the result changed.
//!
//! ```text
//!   SqlDependency ──add_dependency_entry──> NotificationRegistry
//!        │                                      │
//!        └──add_command_entry(fingerprint)──────┤──> correlation key sent with the command
//!                                               │
//!   server notification ──> ProcessDispatcher ──┴──> invalidate_by_correlation_key
//!   server down ──────────> ProcessDispatcher ─────> invalidate_by_server
//!   sweep timer ───────────────────────────────────> sweep_timeouts
//! ```

pub mod dependency;
pub mod dispatcher;
pub mod registry;

use std::str::FromStr;

use crate::error::{Error, Result};

pub use dependency::{CommandFingerprint, Dependency, NotificationEventArgs, SqlDependency};
pub use dispatcher::{LocalProcessDispatcher, ProcessDispatcher};
pub use registry::{AtomicRegistryStats, NotificationRegistry, RegistryConfig, RegistryStats};

/// What kind of event a notification reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationType {
    /// Data changed
    Change,
    /// Subscription failed
    Subscribe,
    /// Unrecognized
    Unknown,
}

/// Why the notification fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum NotificationInfo {
    AlreadyChanged,
    Unknown,
    Truncate,
    Insert,
    Update,
    Delete,
    Drop,
    Alter,
    Restart,
    Error,
    Query,
    Invalid,
    Options,
    Isolation,
    Expired,
    Resource,
    PreviousFire,
    TemplateLimit,
    Merge,
}

/// Who raised the notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum NotificationSource {
    Data,
    Timeout,
    Object,
    Database,
    System,
    Statement,
    Environment,
    Execution,
    Owner,
    Unknown,
    Client,
}

macro_rules! wire_names {
    ($ty:ident { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            /// Name used in server notification messages
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($name => Ok(Self::$variant),)+
                    _ => Err(Error::notification(format!(
                        "unknown {} value: {}",
                        stringify!($ty),
                        s
                    ))),
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }
    };
}

wire_names!(NotificationType {
    Change => "change",
    Subscribe => "subscribe",
    Unknown => "unknown",
});

wire_names!(NotificationInfo {
    AlreadyChanged => "alreadychanged",
    Unknown => "unknown",
    Truncate => "truncate",
    Insert => "insert",
    Update => "update",
    Delete => "delete",
    Drop => "drop",
    Alter => "alter",
    Restart => "restart",
    Error => "error",
    Query => "query",
    Invalid => "invalid",
    Options => "options",
    Isolation => "isolation",
    Expired => "expired",
    Resource => "resource",
    PreviousFire => "previousfire",
    TemplateLimit => "templatelimit",
    Merge => "merge",
});

wire_names!(NotificationSource {
    Data => "data",
    Timeout => "timeout",
    Object => "object",
    Database => "database",
    System => "system",
    Statement => "statement",
    Environment => "environment",
    Execution => "execution",
    Owner => "owner",
    Unknown => "unknown",
    Client => "client",
});

/// A notification delivered to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlNotification {
    /// Reason
    pub info: NotificationInfo,
    /// Origin
    pub source: NotificationSource,
    /// Event kind
    pub kind: NotificationType,
    /// Correlation key the subscription was registered under
    pub key: Option<String>,
}

impl SqlNotification {
    /// Create a notification
    pub fn new(
        info: NotificationInfo,
        source: NotificationSource,
        kind: NotificationType,
        key: Option<String>,
    ) -> Self {
        Self {
            info,
            source,
            kind,
            key,
        }
    }

    /// A data change for the subscription under `key`
    pub fn change(key: impl Into<String>, info: NotificationInfo) -> Self {
        Self::new(
            info,
            NotificationSource::Data,
            NotificationType::Change,
            Some(key.into()),
        )
    }

    /// Client-raised error, used when a server goes away
    pub fn server_down() -> Self {
        Self::new(
            NotificationInfo::Error,
            NotificationSource::Client,
            NotificationType::Change,
            None,
        )
    }

    /// Domain-key prefix of the correlation key
    pub fn domain_key(&self) -> Option<&str> {
        self.key
            .as_deref()
            .and_then(|k| k.split_once(';'))
            .map(|(domain, _)| domain)
    }
}
