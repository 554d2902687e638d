//! # rivven-sqlclient
//!
//! Transaction coordination and query notifications for SQL Server client
//! sessions.
//!
//! This crate sits between a connection pool and the wire protocol. It does
//! not speak TDS itself; the protocol layer plugs in through
//! [`ServerChannel`](channel::ServerChannel) and the ambient transaction
//! system through [`TransactionManager`](transaction::TransactionManager).
//!
//! ## Features
//!
//! - **Local transactions**: begin, commit, rollback and savepoints with
//!   zombie detection when the server ends the transaction on its own
//! - **Ambient enlistment**: promotable delegation to the server with
//!   fallback to cookie propagation
//! - **Transaction binding**: explicit-unbind validation of the ambient
//!   transaction before execution
//! - **Pool lifecycle**: activate/deactivate with abandoned-transaction
//!   rollback and doom-on-failure
//! - **Query notifications**: dependency registry with correlation keys,
//!   server-loss invalidation and a background timeout sweep
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rivven_sqlclient::prelude::*;
//!
//! let conn = InternalConnection::open(
//!     ConnectionConfig::from_connection_string("Data Source=db01;Initial Catalog=orders")?,
//!     channel,
//!     transaction_manager,
//! )
//! .await?;
//!
//! // Local transaction
//! let tx = conn.begin_transaction(IsolationLevel::ReadCommitted, None).await?;
//! tx.save("before_update").await?;
//! tx.commit().await?;
//!
//! // Ambient transaction
//! conn.enlist_transaction(Some(&ambient)).await?;
//!
//! // Query notifications
//! let registry = NotificationRegistry::new(RegistryConfig::default());
//! let dep = Arc::new(SqlDependency::new(registry.domain_key(), Some(Duration::from_secs(30))));
//! registry.add_dependency_entry(dep.clone())?;
//! registry.start_timer(dep.as_ref());
//! let key = registry.add_command_entry(fingerprint.as_str(), dep.as_ref());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod channel;
pub mod connection;
pub mod coordinator;
pub mod delegated;
pub mod error;
pub mod notification;
pub mod testing;
pub mod transaction;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorCategory, FatalKind, Result};

    // Connection config and state
    pub use crate::channel::{ServerChannel, ServerTransaction, TransactionRequest};
    pub use crate::connection::{
        ConnectionConfig, ConnectionState, IsolationLevel, TransactionBinding,
    };

    // Transaction coordination
    pub use crate::coordinator::{InternalConnection, TransactionMode};
    pub use crate::delegated::DelegatedTransaction;
    pub use crate::transaction::{
        AmbientTransaction, InternalTransaction, PromotableSinglePhaseNotification,
        SqlTransaction, TransactionKind, TransactionManager, TransactionStatus,
    };

    // Query notifications
    pub use crate::notification::{
        CommandFingerprint, Dependency, LocalProcessDispatcher, NotificationEventArgs,
        NotificationInfo, NotificationRegistry, NotificationSource, NotificationType,
        ProcessDispatcher, RegistryConfig, RegistryStats, SqlDependency, SqlNotification,
    };
}

// Re-export commonly used items at crate root
pub use coordinator::InternalConnection;
pub use error::{Error, Result};
pub use notification::NotificationRegistry;
