//! Delegated (promotable) transactions
//!
//! When the server supports it, a connection offers itself to the transaction
//! manager as the single-phase participant of an ambient transaction. If the
//! manager accepts, the transaction runs as a plain server transaction until
//! a second resource shows up and forces promotion.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::channel::TransactionRequest;
use crate::coordinator::InternalConnection;
use crate::error::{Error, Result};
use crate::transaction::{AmbientTransaction, PromotableSinglePhaseNotification, TransactionKind};

/// Ambient transaction delegated to one connection's server session.
///
/// Owned by the connection; the transaction manager only holds it as a
/// notification target. The back reference to the connection is weak.
pub struct DelegatedTransaction {
    connection: Weak<InternalConnection>,
    transaction: AmbientTransaction,
    active: AtomicBool,
    transaction_id: Mutex<Option<u64>>,
}

impl DelegatedTransaction {
    pub(crate) fn new(connection: Weak<InternalConnection>, transaction: AmbientTransaction) -> Self {
        Self {
            connection,
            transaction,
            active: AtomicBool::new(false),
            transaction_id: Mutex::new(None),
        }
    }

    /// The ambient transaction being delegated
    pub fn transaction(&self) -> &AmbientTransaction {
        &self.transaction
    }

    /// Whether the server-side transaction has begun and not yet ended
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Server transaction id backing the delegation
    pub fn transaction_id(&self) -> Option<u64> {
        *self.transaction_id.lock()
    }

    /// Ambient transaction completed; detach from the connection
    pub fn transaction_ended(&self, transaction: &AmbientTransaction) {
        if *transaction != self.transaction {
            return;
        }
        self.active.store(false, Ordering::Release);
        if let Some(conn) = self.connection.upgrade() {
            conn.delegated_transaction_ended(self);
        }
        debug!(transaction = %self.transaction.id(), "delegated transaction ended");
    }

    fn connection(&self) -> Result<Arc<InternalConnection>> {
        self.connection.upgrade().ok_or(Error::ConnectionClosed)
    }

    async fn finish(&self, request: TransactionRequest) -> Result<()> {
        let conn = self.connection()?;
        let result = conn
            .execute_transaction(
                request,
                None,
                self.transaction.isolation_level(),
                true,
                TransactionKind::Delegated,
            )
            .await;
        self.active.store(false, Ordering::Release);
        result.map(|_| ())
    }
}

#[async_trait]
impl PromotableSinglePhaseNotification for DelegatedTransaction {
    async fn initialize(&self) -> Result<()> {
        let conn = self.connection()?;
        let response = conn
            .execute_transaction(
                TransactionRequest::Begin,
                None,
                self.transaction.isolation_level(),
                true,
                TransactionKind::Delegated,
            )
            .await?;

        *self.transaction_id.lock() = Some(response.transaction_id);
        self.active.store(true, Ordering::Release);
        debug!(
            connection_id = %conn.id(),
            transaction = %self.transaction.id(),
            server_transaction = response.transaction_id,
            "delegated transaction initialized"
        );
        Ok(())
    }

    async fn promote(&self) -> Result<Vec<u8>> {
        let conn = self.connection()?;
        let response = conn
            .execute_transaction(
                TransactionRequest::Promote,
                None,
                self.transaction.isolation_level(),
                true,
                TransactionKind::Delegated,
            )
            .await?;

        let token = response
            .promoted_token
            .ok_or_else(|| Error::transaction("server returned no token for promotion"))?;
        debug!(connection_id = %conn.id(), "delegated transaction promoted");
        Ok(token)
    }

    async fn single_phase_commit(&self) -> Result<()> {
        self.finish(TransactionRequest::Commit).await
    }

    async fn rollback(&self) -> Result<()> {
        self.finish(TransactionRequest::IfRollback).await
    }
}

impl std::fmt::Debug for DelegatedTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegatedTransaction")
            .field("transaction", &self.transaction)
            .field("active", &self.is_active())
            .field("transaction_id", &self.transaction_id())
            .finish()
    }
}
