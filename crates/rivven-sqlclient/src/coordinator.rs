//! Per-connection transaction coordination
//!
//! [`InternalConnection`] decides, for one server session, whether work runs
//! in a local transaction, in an ambient transaction joined through a
//! propagated cookie, or in an ambient transaction delegated to the server.
//!
//! ## Enlistment protocol
//!
//! ```text
//! enlist(tx)
//!    │
//!    ├─ server supports promotion?
//!    │     └─ offer DelegatedTransaction to the manager
//!    │           ├─ accepted ──────────────> DelegatedPromotable
//!    │           ├─ refused (lost the race) ─┐
//!    │           └─ benign server error ─────┤
//!    │                                       v
//!    └──────────────> whereabouts (cached) ─> export cookie ─> propagate ─> EnlistedCookie
//! ```
//!
//! Mutation is mostly unlocked: the pooling layer calls enlistment at most
//! once per transition. Guards on the state mutex are never held across
//! `.await`.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::{ServerChannel, ServerTransaction, TransactionRequest};
use crate::connection::{ConnectionConfig, ConnectionState, IsolationLevel, TransactionBinding};
use crate::delegated::DelegatedTransaction;
use crate::error::{Error, Result};
use crate::transaction::{
    AmbientTransaction, InternalTransaction, SqlTransaction, TransactionKind, TransactionManager,
};

/// Position of a connection in the transaction state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionMode {
    /// No transaction
    NoTransaction,
    /// Local transaction open on the server
    LocalTransaction,
    /// Joined an ambient transaction through a propagated cookie
    EnlistedCookie,
    /// Holds the delegation of an ambient transaction
    DelegatedPromotable,
}

#[derive(Debug)]
struct CoordinatorState {
    connection_state: ConnectionState,
    current_database: String,
    current_data_source: String,
    is_enlisted_in_transaction: bool,
    enlisted_transaction: Option<AmbientTransaction>,
    delegated_transaction: Option<Arc<DelegatedTransaction>>,
    current_transaction: Option<InternalTransaction>,
    whereabouts: Option<Vec<u8>>,
    promoted_dtc_token: Option<Vec<u8>>,
}

impl CoordinatorState {
    fn reset_transactions(&mut self) {
        self.is_enlisted_in_transaction = false;
        self.enlisted_transaction = None;
        self.delegated_transaction = None;
        self.current_transaction = None;
        self.promoted_dtc_token = None;
    }

    fn has_active_delegation(&self) -> bool {
        self.delegated_transaction
            .as_ref()
            .is_some_and(|d| d.is_active())
    }
}

/// A logical server session and its transaction state
pub struct InternalConnection {
    id: Uuid,
    config: ConnectionConfig,
    channel: Arc<dyn ServerChannel>,
    transaction_manager: Arc<dyn TransactionManager>,
    state: Mutex<CoordinatorState>,
    /// Advisory lock for the transaction-root check
    root_lock: Mutex<()>,
    self_ref: Weak<Self>,
}

impl InternalConnection {
    /// Open a connection over `channel`.
    ///
    /// Enlists in the manager's current transaction when `config.enlist` is set.
    pub async fn open(
        config: ConnectionConfig,
        channel: Arc<dyn ServerChannel>,
        transaction_manager: Arc<dyn TransactionManager>,
    ) -> Result<Arc<Self>> {
        if config.data_source.is_empty() {
            return Err(Error::argument_null("data_source"));
        }

        let conn = Arc::new_cyclic(|weak| Self {
            id: Uuid::new_v4(),
            state: Mutex::new(CoordinatorState {
                connection_state: ConnectionState::Open,
                current_database: config.initial_catalog.clone(),
                current_data_source: config.data_source.clone(),
                is_enlisted_in_transaction: false,
                enlisted_transaction: None,
                delegated_transaction: None,
                current_transaction: None,
                whereabouts: None,
                promoted_dtc_token: None,
            }),
            config,
            channel,
            transaction_manager,
            root_lock: Mutex::new(()),
            self_ref: weak.clone(),
        });

        info!(
            connection_id = %conn.id,
            data_source = %conn.config.data_source,
            database = %conn.config.initial_catalog,
            "connection opened"
        );

        if conn.config.enlist {
            if let Some(tx) = conn.transaction_manager.current() {
                conn.enlist_transaction(Some(&tx)).await?;
            }
        }
        Ok(conn)
    }

    /// Connection identifier used in traces
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Configuration the connection was opened with
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Usability state
    pub fn state(&self) -> ConnectionState {
        self.state.lock().connection_state
    }

    /// Database the session is using
    pub fn current_database(&self) -> String {
        self.state.lock().current_database.clone()
    }

    /// Server the session is connected to
    pub fn current_data_source(&self) -> String {
        self.state.lock().current_data_source.clone()
    }

    /// Whether the connection joined an ambient transaction through a cookie
    pub fn is_enlisted_in_transaction(&self) -> bool {
        self.state.lock().is_enlisted_in_transaction
    }

    /// Ambient transaction the connection is enlisted in, by either path
    pub fn enlisted_transaction(&self) -> Option<AmbientTransaction> {
        self.state.lock().enlisted_transaction.clone()
    }

    /// Whether the connection owns a delegated transaction
    pub fn has_delegated_transaction(&self) -> bool {
        self.state.lock().delegated_transaction.is_some()
    }

    /// Delegated transaction owned by the connection
    pub fn delegated_transaction(&self) -> Option<Arc<DelegatedTransaction>> {
        self.state.lock().delegated_transaction.clone()
    }

    /// Token returned by the server when a delegation was promoted
    pub fn promoted_dtc_token(&self) -> Option<Vec<u8>> {
        self.state.lock().promoted_dtc_token.clone()
    }

    /// Server transaction currently open on the session
    pub fn current_transaction(&self) -> Option<InternalTransaction> {
        self.state.lock().current_transaction
    }

    /// Whether a local transaction is open
    pub fn has_local_transaction(&self) -> bool {
        self.current_transaction().is_some_and(|t| t.is_local())
    }

    /// Whether a local transaction started through the API is open
    pub fn has_local_transaction_from_api(&self) -> bool {
        self.current_transaction()
            .is_some_and(|t| t.kind == TransactionKind::LocalFromApi)
    }

    /// Position in the transaction state machine
    pub fn transaction_mode(&self) -> TransactionMode {
        let state = self.state.lock();
        if state.has_active_delegation() {
            TransactionMode::DelegatedPromotable
        } else if state.is_enlisted_in_transaction {
            TransactionMode::EnlistedCookie
        } else if state.current_transaction.is_some_and(|t| t.is_local()) {
            TransactionMode::LocalTransaction
        } else {
            TransactionMode::NoTransaction
        }
    }

    /// Whether the connection roots an active delegated transaction and so
    /// must not be reused outside it
    pub fn is_transaction_root(&self) -> bool {
        let _guard = self.root_lock.lock();
        self.state.lock().has_active_delegation()
    }

    pub(crate) fn is_current_transaction(&self, transaction_id: u64) -> bool {
        self.current_transaction()
            .is_some_and(|t| t.transaction_id == transaction_id)
    }

    /// Begin a local transaction
    pub async fn begin_transaction(
        &self,
        isolation: IsolationLevel,
        name: Option<&str>,
    ) -> Result<SqlTransaction> {
        self.validate_connection_for_execute()?;

        if self.has_local_transaction_from_api() {
            return Err(Error::ParallelTransactionsNotSupported);
        }

        let isolation = isolation.resolve();
        let response = self
            .execute_transaction(
                TransactionRequest::Begin,
                name,
                isolation,
                false,
                TransactionKind::LocalFromApi,
            )
            .await?;

        if response.transaction_id == 0 {
            return Err(Error::internal(
                "server reported no transaction after begin",
            ));
        }

        let this = self.self_ref.upgrade().ok_or(Error::ConnectionClosed)?;
        debug!(
            connection_id = %self.id,
            server_transaction = response.transaction_id,
            %isolation,
            "local transaction started"
        );
        Ok(SqlTransaction::new(
            this,
            response.transaction_id,
            isolation,
            name.map(str::to_string),
        ))
    }

    /// Switch the session to another database
    pub async fn change_database(&self, database: &str) -> Result<()> {
        if database.trim().is_empty() {
            return Err(Error::EmptyDatabaseName);
        }
        self.validate_connection_for_execute()?;

        let result = self.channel.change_database(database).await;
        self.abort_on_fatal(result)?;

        self.state.lock().current_database = database.to_string();
        debug!(connection_id = %self.id, database, "database changed");
        Ok(())
    }

    /// Enlist in `transaction`, or unenlist when `None`
    pub async fn enlist_transaction(&self, transaction: Option<&AmbientTransaction>) -> Result<()> {
        self.validate_connection_for_execute()?;

        if self.has_local_transaction() {
            return Err(Error::LocalTransactionPresent);
        }

        if let Some(tx) = transaction {
            if self.enlisted_transaction().as_ref() == Some(tx) {
                return Ok(());
            }
        }

        let result = self.enlist(transaction).await;
        self.abort_on_fatal(result)
    }

    /// Pool checkout: enlist in the caller's transaction when configured to
    pub async fn activate(&self, transaction: Option<&AmbientTransaction>) -> Result<()> {
        self.validate_connection_for_execute()?;
        if !self.config.enlist {
            return Ok(());
        }
        let result = self.enlist(transaction).await;
        self.abort_on_fatal(result)
    }

    /// Decide how to join (or leave) `transaction`.
    ///
    /// Must not be called while an active delegated transaction is owned.
    pub async fn enlist(&self, transaction: Option<&AmbientTransaction>) -> Result<()> {
        let (enlisted, is_enlisted, delegated_active) = {
            let state = self.state.lock();
            (
                state.enlisted_transaction.clone(),
                state.is_enlisted_in_transaction,
                state.has_active_delegation(),
            )
        };

        if delegated_active {
            return Err(Error::internal(
                "enlist called while the connection owns an active delegated transaction",
            ));
        }

        match transaction {
            None => {
                // Not cookie-enlisted means either truly unenlisted or left over
                // from a delegation; only the latter needs the server told.
                if is_enlisted || enlisted.is_some_and(|tx| !tx.is_active()) {
                    self.enlist_null().await?;
                }
                Ok(())
            }
            Some(tx) if enlisted.as_ref() != Some(tx) => self.enlist_non_null(tx).await,
            Some(_) => Ok(()),
        }
    }

    async fn enlist_non_null(&self, tx: &AmbientTransaction) -> Result<()> {
        debug!(connection_id = %self.id, transaction = %tx.id(), "enlisting");
        let promotable = self.channel.supports_promotable_enlistment();
        let mut delegated = false;

        if promotable {
            let delegation = Arc::new(DelegatedTransaction::new(self.self_ref.clone(), tx.clone()));
            let offered = self
                .transaction_manager
                .enlist_promotable_single_phase(tx, delegation.clone())
                .await;

            match offered {
                Ok(true) => {
                    let mut state = self.state.lock();
                    state.delegated_transaction = Some(delegation);
                    // delegated, not cookie-enlisted
                    state.is_enlisted_in_transaction = false;
                    drop(state);
                    delegated = true;
                    debug!(connection_id = %self.id, transaction = %tx.id(), "transaction delegated");
                }
                Ok(false) => {
                    debug!(
                        connection_id = %self.id,
                        transaction = %tx.id(),
                        "delegation refused; another resource holds it"
                    );
                }
                Err(e) if e.is_fatal() || e.is_fatal_severity() || !self.channel.is_logged_in() => {
                    return Err(e);
                }
                Err(e @ Error::Server { .. }) => {
                    warn!(
                        connection_id = %self.id,
                        transaction = %tx.id(),
                        error = %e,
                        "delegation failed; falling back to cookie enlistment"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if !delegated {
            let whereabouts = self.whereabouts().await?;
            let cookie = self
                .transaction_manager
                .export_cookie(tx, &whereabouts)
                .await?;
            let transaction_id = self
                .channel
                .propagate_transaction_cookie(Some(&cookie))
                .await?;
            self.apply_server_transaction(TransactionKind::Distributed, transaction_id);
            self.state.lock().is_enlisted_in_transaction = true;
            debug!(connection_id = %self.id, transaction = %tx.id(), "enlisted through cookie");
        }

        let mut state = self.state.lock();
        state.enlisted_transaction = Some(tx.clone());

        if promotable && state.current_transaction.is_none() {
            return Err(Error::internal(
                "connection has no current transaction after enlisting",
            ));
        }
        Ok(())
    }

    /// Tell the server there is no transaction and clear enlistment.
    ///
    /// Always sent: pooled connections are partitioned by transaction and
    /// only rejoin the general pool once the server has been told.
    pub async fn enlist_null(&self) -> Result<()> {
        debug!(connection_id = %self.id, "unenlisting");
        let transaction_id = self.channel.propagate_transaction_cookie(None).await?;
        self.apply_server_transaction(TransactionKind::Distributed, transaction_id);

        let mut state = self.state.lock();
        state.is_enlisted_in_transaction = false;
        state.enlisted_transaction = None;
        if !state.has_active_delegation() {
            state.delegated_transaction = None;
        }

        if self.channel.supports_promotable_enlistment() && state.current_transaction.is_some() {
            return Err(Error::internal(
                "connection still has a current transaction after unenlisting",
            ));
        }
        Ok(())
    }

    /// Check the ambient transaction still matches the enlisted one.
    ///
    /// Call after taking whatever lock guards command execution, so a
    /// transaction completing on another thread is caught before executing.
    pub fn validate_transaction(&self) -> Result<()> {
        if self.config.transaction_binding != TransactionBinding::ExplicitUnbind {
            return Ok(());
        }

        let enlisted = self.enlisted_transaction();
        let current = self.transaction_manager.current();

        if enlisted != current {
            return Err(Error::TransactionConnectionMismatch);
        }
        match current {
            Some(tx) if !tx.is_active() => Err(Error::TransactionCompletedButNotDisposed),
            _ => Ok(()),
        }
    }

    /// Pool return: best-effort cleanup.
    ///
    /// Non-fatal failures doom the connection instead of propagating.
    pub async fn deactivate(&self) -> Result<()> {
        match self.cleanup_for_pool().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => {
                self.abort(&e);
                Err(e)
            }
            Err(e) => {
                warn!(connection_id = %self.id, error = %e, "deactivate failed; dooming connection");
                self.doom();
                Ok(())
            }
        }
    }

    async fn cleanup_for_pool(&self) -> Result<()> {
        if !self.state().is_usable() {
            return Ok(());
        }
        if let Some(tx) = self.current_transaction().filter(|t| t.is_local()) {
            debug!(
                connection_id = %self.id,
                server_transaction = tx.transaction_id,
                "rolling back abandoned local transaction"
            );
            self.execute_transaction(
                TransactionRequest::IfRollback,
                None,
                IsolationLevel::ReadCommitted,
                false,
                tx.kind,
            )
            .await?;
        }
        Ok(())
    }

    /// Forward ambient completion to the owned delegated transaction
    pub fn cleanup_transaction_on_completion(&self, transaction: &AmbientTransaction) {
        let delegated = self.state.lock().delegated_transaction.clone();
        if let Some(delegated) = delegated {
            delegated.transaction_ended(transaction);
        }
    }

    pub(crate) fn delegated_transaction_ended(&self, delegated: &DelegatedTransaction) {
        let mut state = self.state.lock();
        let owned = state
            .delegated_transaction
            .as_ref()
            .is_some_and(|d| std::ptr::eq(Arc::as_ptr(d), delegated));
        if !owned {
            return;
        }
        state.delegated_transaction = None;
        if state.enlisted_transaction.as_ref() == Some(delegated.transaction()) {
            state.enlisted_transaction = None;
        }
        if state
            .current_transaction
            .is_some_and(|t| t.kind == TransactionKind::Delegated)
        {
            state.current_transaction = None;
        }
    }

    /// Close the connection, forgetting all transaction state
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.reset_transactions();
        state.connection_state = ConnectionState::Closed;
        info!(connection_id = %self.id, "connection closed");
    }

    /// Close and drop cached server addresses
    pub fn dispose(&self) {
        self.close();
        self.state.lock().whereabouts = None;
    }

    /// Mark the connection unusable without closing the session
    pub fn doom(&self) {
        let mut state = self.state.lock();
        if state.connection_state == ConnectionState::Open {
            state.connection_state = ConnectionState::Doomed;
            warn!(connection_id = %self.id, "connection doomed");
        }
    }

    /// Tear down the session after a fatal error
    pub fn abort(&self, cause: &Error) {
        {
            let mut state = self.state.lock();
            state.connection_state = ConnectionState::Broken;
            state.reset_transactions();
        }
        self.channel.abort();
        error!(connection_id = %self.id, error = %cause, "connection aborted");
    }

    pub(crate) async fn execute_transaction(
        &self,
        request: TransactionRequest,
        name: Option<&str>,
        isolation: IsolationLevel,
        is_delegate_control_request: bool,
        kind: TransactionKind,
    ) -> Result<ServerTransaction> {
        debug!(connection_id = %self.id, %request, ?name, "transaction request");
        let result = self
            .channel
            .execute_transaction(request, name, isolation, is_delegate_control_request)
            .await;
        let response = self.abort_on_fatal(result)?;

        self.apply_server_transaction(kind, response.transaction_id);
        if let Some(token) = &response.promoted_token {
            self.state.lock().promoted_dtc_token = Some(token.clone());
        }
        Ok(response)
    }

    fn apply_server_transaction(&self, kind: TransactionKind, transaction_id: u64) {
        let mut state = self.state.lock();
        state.current_transaction = match state.current_transaction {
            _ if transaction_id == 0 => None,
            Some(current) if current.transaction_id == transaction_id => Some(current),
            _ => Some(InternalTransaction {
                kind,
                transaction_id,
            }),
        };
    }

    async fn whereabouts(&self) -> Result<Vec<u8>> {
        let cached = self.state.lock().whereabouts.clone();
        if let Some(whereabouts) = cached {
            return Ok(whereabouts);
        }

        let address = self
            .channel
            .get_dtc_address()
            .await?
            .filter(|a| !a.is_empty())
            .ok_or(Error::CannotGetDtcAddress)?;
        self.state.lock().whereabouts = Some(address.clone());
        Ok(address)
    }

    fn validate_connection_for_execute(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Open => Ok(()),
            ConnectionState::Closed => Err(Error::ConnectionClosed),
            state => Err(Error::ConnectionDoomed {
                message: format!("connection is {:?}", state),
            }),
        }
    }

    fn abort_on_fatal<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.abort(e);
            }
        }
        result
    }
}

impl std::fmt::Debug for InternalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalConnection")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("state", &*self.state.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockServerChannel, MockTransactionManager};

    async fn open(channel: &Arc<MockServerChannel>) -> Arc<InternalConnection> {
        InternalConnection::open(
            ConnectionConfig::new("db01").with_initial_catalog("orders"),
            channel.clone(),
            Arc::new(MockTransactionManager::new()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_open_records_database() {
        let channel = Arc::new(MockServerChannel::new());
        let conn = open(&channel).await;

        assert_eq!(conn.current_database(), "orders");
        assert_eq!(conn.current_data_source(), "db01");
        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(conn.transaction_mode(), TransactionMode::NoTransaction);
    }

    #[tokio::test]
    async fn test_abort_on_fatal_breaks_connection() {
        let channel = Arc::new(MockServerChannel::new());
        let conn = open(&channel).await;

        let fatal: Result<()> = Err(Error::fatal(crate::error::FatalKind::Aborted, "gone"));
        assert!(conn.abort_on_fatal(fatal).is_err());
        assert_eq!(conn.state(), ConnectionState::Broken);
        assert!(channel.is_aborted());
    }

    #[tokio::test]
    async fn test_doom_only_from_open() {
        let channel = Arc::new(MockServerChannel::new());
        let conn = open(&channel).await;

        conn.close();
        conn.doom();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }
}
