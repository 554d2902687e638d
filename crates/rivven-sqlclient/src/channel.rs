//! Server channel abstraction
//!
//! The coordinator never talks to the wire itself. Everything that needs a
//! server round trip (transaction manager requests, cookie propagation,
//! database switches) goes through a [`ServerChannel`].

use async_trait::async_trait;

use crate::connection::IsolationLevel;
use crate::error::Result;

/// Transaction manager request sent to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionRequest {
    /// Begin a transaction
    Begin,
    /// Promote a delegated transaction to a distributed one
    Promote,
    /// Commit the current transaction
    Commit,
    /// Roll back the current transaction (or to a savepoint)
    Rollback,
    /// Roll back only if the transaction is still open on the server
    IfRollback,
    /// Create a savepoint
    Save,
}

impl std::fmt::Display for TransactionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Begin => write!(f, "begin"),
            Self::Promote => write!(f, "promote"),
            Self::Commit => write!(f, "commit"),
            Self::Rollback => write!(f, "rollback"),
            Self::IfRollback => write!(f, "if-rollback"),
            Self::Save => write!(f, "save"),
        }
    }
}

/// Server-side transaction state reported after a request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerTransaction {
    /// Server transaction id now current on the session (0 = none)
    pub transaction_id: u64,
    /// Token returned by the server after a successful promotion
    pub promoted_token: Option<Vec<u8>>,
}

impl ServerTransaction {
    /// No transaction is current
    pub fn none() -> Self {
        Self::default()
    }

    /// A transaction with the given id is current
    pub fn active(transaction_id: u64) -> Self {
        Self {
            transaction_id,
            promoted_token: None,
        }
    }
}

/// Abstract session with the server
#[async_trait]
pub trait ServerChannel: Send + Sync {
    /// Send a transaction manager request
    async fn execute_transaction(
        &self,
        request: TransactionRequest,
        name: Option<&str>,
        isolation: IsolationLevel,
        is_delegate_control_request: bool,
    ) -> Result<ServerTransaction>;

    /// Propagate an exported transaction cookie (`None` unenlists).
    ///
    /// Returns the server transaction id now current (0 = none).
    async fn propagate_transaction_cookie(&self, cookie: Option<&[u8]>) -> Result<u64>;

    /// Fetch the whereabouts of the server's transaction manager
    async fn get_dtc_address(&self) -> Result<Option<Vec<u8>>>;

    /// Switch the session's database
    async fn change_database(&self, database: &str) -> Result<()>;

    /// Whether the session is logged in and usable
    fn is_logged_in(&self) -> bool;

    /// Whether the server accepts promotable (delegated) enlistment
    fn supports_promotable_enlistment(&self) -> bool;

    /// Hard-close the session
    fn abort(&self);
}
