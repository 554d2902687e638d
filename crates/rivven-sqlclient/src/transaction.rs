//! Transaction types for rivven-sqlclient
//!
//! Two sides meet here:
//! - The ambient side: [`AmbientTransaction`] handles and the
//!   [`TransactionManager`] that coordinates them across resources
//! - The connection side: [`InternalTransaction`] (what the server thinks is
//!   current) and [`SqlTransaction`], the handle returned to callers that
//!   begin a local transaction
//!
//! ## Connection transaction states
//!
//! ```text
//! NoTransaction ──begin──> LocalTransaction ──commit/rollback──> NoTransaction
//!       │   ▲
//!  enlist   enlist(None)
//!       ▼   │
//! EnlistedCookie
//!
//! NoTransaction ──enlist (promotion accepted)──> DelegatedPromotable
//!       ▲                                               │
//!       └──────── ambient completion callback ──────────┘
//! ```

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::channel::TransactionRequest;
use crate::connection::IsolationLevel;
use crate::coordinator::InternalConnection;
use crate::error::{Error, Result};

/// Outcome state of an ambient transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    /// Still running
    Active,
    /// Committed
    Committed,
    /// Rolled back
    Aborted,
    /// Outcome unknown
    InDoubt,
}

impl TransactionStatus {
    /// Whether the transaction has reached an outcome
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// Handle to an ambient (distributed-capable) transaction.
///
/// Clones share identity and status; equality is identity.
#[derive(Clone)]
pub struct AmbientTransaction {
    id: Uuid,
    isolation: IsolationLevel,
    status: Arc<RwLock<TransactionStatus>>,
}

impl AmbientTransaction {
    /// Create a new active transaction
    pub fn new(isolation: IsolationLevel) -> Self {
        Self {
            id: Uuid::new_v4(),
            isolation: isolation.resolve(),
            status: Arc::new(RwLock::new(TransactionStatus::Active)),
        }
    }

    /// Local identifier
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Isolation level requested for the transaction
    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation
    }

    /// Current status
    pub fn status(&self) -> TransactionStatus {
        *self.status.read()
    }

    /// Record an outcome (driven by the transaction manager)
    pub fn set_status(&self, status: TransactionStatus) {
        *self.status.write() = status;
    }

    /// Whether the transaction is still active
    pub fn is_active(&self) -> bool {
        self.status() == TransactionStatus::Active
    }
}

impl PartialEq for AmbientTransaction {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for AmbientTransaction {}

impl std::fmt::Debug for AmbientTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmbientTransaction")
            .field("id", &self.id)
            .field("isolation", &self.isolation)
            .field("status", &self.status())
            .finish()
    }
}

/// Resource that can take over an ambient transaction as long as it stays
/// single-phase, and promote it to a distributed one on demand
#[async_trait]
pub trait PromotableSinglePhaseNotification: Send + Sync {
    /// Start the server-side transaction that backs the delegation
    async fn initialize(&self) -> Result<()>;

    /// Promote to a distributed transaction; returns the propagation token
    async fn promote(&self) -> Result<Vec<u8>>;

    /// Commit as the only participant
    async fn single_phase_commit(&self) -> Result<()>;

    /// Roll back
    async fn rollback(&self) -> Result<()>;
}

/// Coordinator of ambient transactions
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Ambient transaction visible to the caller, if any
    fn current(&self) -> Option<AmbientTransaction>;

    /// Offer `notification` as the promotable single-phase participant of `tx`.
    ///
    /// Returns `false` when another resource already holds the delegation.
    /// On acceptance the manager calls `initialize` before returning.
    async fn enlist_promotable_single_phase(
        &self,
        tx: &AmbientTransaction,
        notification: Arc<dyn PromotableSinglePhaseNotification>,
    ) -> Result<bool>;

    /// Export a propagation cookie for `tx` addressed to `whereabouts`
    async fn export_cookie(&self, tx: &AmbientTransaction, whereabouts: &[u8]) -> Result<Vec<u8>>;
}

/// Origin of the transaction currently open on a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    /// Started through `begin_transaction`
    LocalFromApi,
    /// Started by SQL text on the server
    LocalFromServer,
    /// Backing a delegated ambient transaction
    Delegated,
    /// Joined through a propagated cookie
    Distributed,
}

/// The connection's view of the server's current transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalTransaction {
    /// Origin
    pub kind: TransactionKind,
    /// Server transaction id
    pub transaction_id: u64,
}

impl InternalTransaction {
    /// Whether this is a local transaction
    pub fn is_local(&self) -> bool {
        matches!(
            self.kind,
            TransactionKind::LocalFromApi | TransactionKind::LocalFromServer
        )
    }
}

/// Local transaction started with [`InternalConnection::begin_transaction`].
///
/// Tied to one server transaction id. Once committed or rolled back the
/// handle is dead; an abandoned handle is rolled back when the connection
/// is deactivated.
pub struct SqlTransaction {
    connection: Arc<InternalConnection>,
    transaction_id: u64,
    isolation: IsolationLevel,
    name: Option<String>,
    completed: AtomicBool,
}

impl SqlTransaction {
    pub(crate) fn new(
        connection: Arc<InternalConnection>,
        transaction_id: u64,
        isolation: IsolationLevel,
        name: Option<String>,
    ) -> Self {
        Self {
            connection,
            transaction_id,
            isolation,
            name,
            completed: AtomicBool::new(false),
        }
    }

    /// Server transaction id
    pub fn transaction_id(&self) -> u64 {
        self.transaction_id
    }

    /// Isolation level the transaction runs under
    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation
    }

    /// Transaction name, if one was given
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether the transaction has been committed, rolled back or zombied
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
            || !self.connection.is_current_transaction(self.transaction_id)
    }

    /// Commit the transaction
    pub async fn commit(&self) -> Result<()> {
        self.request(TransactionRequest::Commit, self.name.as_deref(), true)
            .await
    }

    /// Roll back the whole transaction
    pub async fn rollback(&self) -> Result<()> {
        self.request(TransactionRequest::IfRollback, self.name.as_deref(), true)
            .await
    }

    /// Create a savepoint
    pub async fn save(&self, savepoint: &str) -> Result<()> {
        if savepoint.is_empty() {
            return Err(Error::argument_null("savepoint"));
        }
        self.request(TransactionRequest::Save, Some(savepoint), false)
            .await
    }

    /// Roll back to a savepoint; the transaction stays open
    pub async fn rollback_to(&self, savepoint: &str) -> Result<()> {
        if savepoint.is_empty() {
            return Err(Error::argument_null("savepoint"));
        }
        self.request(TransactionRequest::Rollback, Some(savepoint), false)
            .await
    }

    async fn request(
        &self,
        request: TransactionRequest,
        name: Option<&str>,
        completes: bool,
    ) -> Result<()> {
        if self.is_completed() {
            return Err(Error::TransactionCompleted);
        }

        let result = self
            .connection
            .execute_transaction(
                request,
                name,
                self.isolation,
                false,
                TransactionKind::LocalFromApi,
            )
            .await;

        // A server that dropped the transaction zombies the handle either way.
        if (completes && result.is_ok())
            || !self.connection.is_current_transaction(self.transaction_id)
        {
            self.completed.store(true, Ordering::Release);
        }
        result.map(|_| ())
    }
}

impl std::fmt::Debug for SqlTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlTransaction")
            .field("transaction_id", &self.transaction_id)
            .field("isolation", &self.isolation)
            .field("name", &self.name)
            .field("completed", &self.completed.load(Ordering::Relaxed))
            .finish()
    }
}
