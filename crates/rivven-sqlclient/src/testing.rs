//! Testing utilities
//!
//! In-memory stand-ins for the collaborators of the connection and
//! notification layers, so both can be exercised without a server.
//!
//! # Example
//!
//! ```rust,ignore
//! use rivven_sqlclient::testing::*;
//!
//! let channel = Arc::new(MockServerChannel::new());
//! let tm = Arc::new(MockTransactionManager::new());
//! let conn = InternalConnection::open(ConnectionConfig::new("db01"), channel.clone(), tm.clone()).await?;
//!
//! let tx = tm.begin();
//! conn.enlist_transaction(Some(&tx)).await?;
//! assert!(conn.has_delegated_transaction());
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::channel::{ServerChannel, ServerTransaction, TransactionRequest};
use crate::connection::IsolationLevel;
use crate::error::{Error, Result};
use crate::notification::{Dependency, NotificationInfo, NotificationSource, NotificationType};
use crate::transaction::{
    AmbientTransaction, PromotableSinglePhaseNotification, TransactionManager, TransactionStatus,
};

// ============================================================================
// Mock server channel
// ============================================================================

/// Channel operation, used to queue failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelOp {
    /// `execute_transaction`
    ExecuteTransaction,
    /// `propagate_transaction_cookie`
    PropagateCookie,
    /// `get_dtc_address`
    GetDtcAddress,
    /// `change_database`
    ChangeDatabase,
}

/// A recorded channel call
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ChannelCall {
    /// Transaction request
    Transaction {
        request: TransactionRequest,
        name: Option<String>,
        isolation: IsolationLevel,
        delegate: bool,
    },
    /// Cookie propagation (`None` unenlists)
    PropagateCookie(Option<Vec<u8>>),
    /// Address lookup
    GetDtcAddress,
    /// Database switch
    ChangeDatabase(String),
}

/// Server channel that tracks the server transaction in memory
#[derive(Debug)]
pub struct MockServerChannel {
    calls: Mutex<Vec<ChannelCall>>,
    failures: Mutex<HashMap<ChannelOp, VecDeque<Error>>>,
    next_transaction_id: AtomicU64,
    current_transaction: AtomicU64,
    dtc_address: Mutex<Option<Vec<u8>>>,
    promotable: AtomicBool,
    logged_in: AtomicBool,
    reports_transactions: AtomicBool,
    aborted: AtomicBool,
}

impl Default for MockServerChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockServerChannel {
    /// A logged-in channel to a server that supports promotion
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            next_transaction_id: AtomicU64::new(1),
            current_transaction: AtomicU64::new(0),
            dtc_address: Mutex::new(Some(b"dtc://mock".to_vec())),
            promotable: AtomicBool::new(true),
            logged_in: AtomicBool::new(true),
            reports_transactions: AtomicBool::new(true),
            aborted: AtomicBool::new(false),
        }
    }

    /// Toggle promotable enlistment support
    pub fn with_promotable(self, promotable: bool) -> Self {
        self.promotable.store(promotable, Ordering::SeqCst);
        self
    }

    /// Set the address returned by `get_dtc_address`
    pub fn with_dtc_address(self, address: Option<Vec<u8>>) -> Self {
        *self.dtc_address.lock() = address;
        self
    }

    /// Toggle logged-in state
    pub fn set_logged_in(&self, logged_in: bool) {
        self.logged_in.store(logged_in, Ordering::SeqCst);
    }

    /// When false, the server never reports a current transaction
    pub fn set_reports_transactions(&self, reports: bool) {
        self.reports_transactions.store(reports, Ordering::SeqCst);
    }

    /// Fail the next call of `op` with `error`
    pub fn fail_next(&self, op: ChannelOp, error: Error) {
        self.failures.lock().entry(op).or_default().push_back(error);
    }

    /// All calls so far
    pub fn calls(&self) -> Vec<ChannelCall> {
        self.calls.lock().clone()
    }

    /// Transaction requests so far
    pub fn transaction_requests(&self) -> Vec<TransactionRequest> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                ChannelCall::Transaction { request, .. } => Some(*request),
                _ => None,
            })
            .collect()
    }

    /// Cookie propagations so far
    pub fn propagated_cookies(&self) -> Vec<Option<Vec<u8>>> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                ChannelCall::PropagateCookie(cookie) => Some(cookie.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of address lookups
    pub fn dtc_address_requests(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, ChannelCall::GetDtcAddress))
            .count()
    }

    /// Server transaction id currently open (0 = none)
    pub fn current_transaction(&self) -> u64 {
        self.current_transaction.load(Ordering::SeqCst)
    }

    /// Whether `abort` was called
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn record(&self, call: ChannelCall) {
        self.calls.lock().push(call);
    }

    fn take_failure(&self, op: ChannelOp) -> Result<()> {
        match self.failures.lock().get_mut(&op).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn begin_server_transaction(&self) -> u64 {
        let id = self.next_transaction_id.fetch_add(1, Ordering::SeqCst);
        self.current_transaction.store(id, Ordering::SeqCst);
        id
    }

    fn reported(&self) -> u64 {
        if self.reports_transactions.load(Ordering::SeqCst) {
            self.current_transaction()
        } else {
            0
        }
    }
}

#[async_trait]
impl ServerChannel for MockServerChannel {
    async fn execute_transaction(
        &self,
        request: TransactionRequest,
        name: Option<&str>,
        isolation: IsolationLevel,
        is_delegate_control_request: bool,
    ) -> Result<ServerTransaction> {
        self.record(ChannelCall::Transaction {
            request,
            name: name.map(str::to_string),
            isolation,
            delegate: is_delegate_control_request,
        });
        self.take_failure(ChannelOp::ExecuteTransaction)?;

        let mut promoted_token = None;
        match request {
            TransactionRequest::Begin => {
                self.begin_server_transaction();
            }
            TransactionRequest::Commit | TransactionRequest::IfRollback => {
                self.current_transaction.store(0, Ordering::SeqCst);
            }
            TransactionRequest::Rollback if name.is_none() => {
                self.current_transaction.store(0, Ordering::SeqCst);
            }
            TransactionRequest::Rollback | TransactionRequest::Save => {}
            TransactionRequest::Promote => {
                promoted_token = Some(format!("promoted-{}", self.current_transaction()).into_bytes());
            }
        }

        Ok(ServerTransaction {
            transaction_id: self.reported(),
            promoted_token,
        })
    }

    async fn propagate_transaction_cookie(&self, cookie: Option<&[u8]>) -> Result<u64> {
        self.record(ChannelCall::PropagateCookie(cookie.map(<[u8]>::to_vec)));
        self.take_failure(ChannelOp::PropagateCookie)?;

        match cookie {
            Some(_) => {
                self.begin_server_transaction();
            }
            None => self.current_transaction.store(0, Ordering::SeqCst),
        }
        Ok(self.reported())
    }

    async fn get_dtc_address(&self) -> Result<Option<Vec<u8>>> {
        self.record(ChannelCall::GetDtcAddress);
        self.take_failure(ChannelOp::GetDtcAddress)?;
        Ok(self.dtc_address.lock().clone())
    }

    async fn change_database(&self, database: &str) -> Result<()> {
        self.record(ChannelCall::ChangeDatabase(database.to_string()));
        self.take_failure(ChannelOp::ChangeDatabase)
    }

    fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    fn supports_promotable_enlistment(&self) -> bool {
        self.promotable.load(Ordering::SeqCst)
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.logged_in.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// Mock transaction manager
// ============================================================================

/// Transaction manager that grants each ambient transaction's delegation to
/// the first resource that asks
#[derive(Default)]
pub struct MockTransactionManager {
    current: Mutex<Option<AmbientTransaction>>,
    delegations: Mutex<HashMap<Uuid, Arc<dyn PromotableSinglePhaseNotification>>>,
    refused: Mutex<HashSet<Uuid>>,
    enlist_failures: Mutex<VecDeque<Error>>,
    enlist_attempts: AtomicU64,
    exported: Mutex<Vec<(Uuid, Vec<u8>)>>,
}

impl MockTransactionManager {
    /// Create a manager with no ambient transaction
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a transaction and make it current
    pub fn begin(&self) -> AmbientTransaction {
        let tx = AmbientTransaction::new(IsolationLevel::ReadCommitted);
        self.set_current(Some(tx.clone()));
        tx
    }

    /// Set the ambient transaction
    pub fn set_current(&self, tx: Option<AmbientTransaction>) {
        *self.current.lock() = tx;
    }

    /// Refuse delegation of `tx` as if another resource already holds it
    pub fn refuse_delegation(&self, tx: &AmbientTransaction) {
        self.refused.lock().insert(tx.id());
    }

    /// Fail the next promotable enlistment with `error`
    pub fn fail_next_enlist(&self, error: Error) {
        self.enlist_failures.lock().push_back(error);
    }

    /// Number of promotable enlistment attempts
    pub fn enlist_attempts(&self) -> u64 {
        self.enlist_attempts.load(Ordering::SeqCst)
    }

    /// Cookies exported so far, with the whereabouts they were addressed to
    pub fn exported_cookies(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.exported.lock().clone()
    }

    /// Commit `tx` through its delegation, if any, and mark it committed
    pub async fn commit(&self, tx: &AmbientTransaction) -> Result<()> {
        let delegation = self.delegations.lock().remove(&tx.id());
        if let Some(delegation) = delegation {
            delegation.single_phase_commit().await?;
        }
        tx.set_status(TransactionStatus::Committed);
        Ok(())
    }

    /// Roll back `tx` through its delegation, if any, and mark it aborted
    pub async fn rollback(&self, tx: &AmbientTransaction) -> Result<()> {
        let delegation = self.delegations.lock().remove(&tx.id());
        if let Some(delegation) = delegation {
            delegation.rollback().await?;
        }
        tx.set_status(TransactionStatus::Aborted);
        Ok(())
    }

    /// Promote the delegation of `tx`
    pub async fn promote(&self, tx: &AmbientTransaction) -> Result<Vec<u8>> {
        let delegation = self
            .delegations
            .lock()
            .get(&tx.id())
            .cloned()
            .ok_or_else(|| Error::transaction("transaction has no delegation"))?;
        delegation.promote().await
    }
}

#[async_trait]
impl TransactionManager for MockTransactionManager {
    fn current(&self) -> Option<AmbientTransaction> {
        self.current.lock().clone()
    }

    async fn enlist_promotable_single_phase(
        &self,
        tx: &AmbientTransaction,
        notification: Arc<dyn PromotableSinglePhaseNotification>,
    ) -> Result<bool> {
        self.enlist_attempts.fetch_add(1, Ordering::SeqCst);
        let failure = self.enlist_failures.lock().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }
        let taken =
            self.refused.lock().contains(&tx.id()) || self.delegations.lock().contains_key(&tx.id());
        if taken {
            return Ok(false);
        }

        notification.initialize().await?;
        self.delegations.lock().insert(tx.id(), notification);
        Ok(true)
    }

    async fn export_cookie(&self, tx: &AmbientTransaction, whereabouts: &[u8]) -> Result<Vec<u8>> {
        self.exported.lock().push((tx.id(), whereabouts.to_vec()));
        Ok(format!("cookie:{}", tx.id()).into_bytes())
    }
}

// ============================================================================
// Recording dependency
// ============================================================================

/// Callback run from inside `invalidate`
pub type InvalidationHook = Box<dyn Fn() + Send + Sync>;

/// Dependency that records every invalidation it receives
pub struct RecordingDependency {
    id: String,
    servers: Vec<String>,
    expiration: Option<Instant>,
    failure: Mutex<Option<Error>>,
    hook: Option<InvalidationHook>,
    invalidations: Mutex<Vec<(NotificationType, NotificationInfo, NotificationSource)>>,
}

impl RecordingDependency {
    /// Create a dependency that never expires
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            servers: Vec::new(),
            expiration: None,
            failure: Mutex::new(None),
            hook: None,
            invalidations: Mutex::new(Vec::new()),
        }
    }

    /// Set a deadline
    pub fn expiring_at(mut self, expiration: Instant) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Add a server to the server list
    pub fn on_server(mut self, server: impl Into<String>) -> Self {
        self.servers.push(server.into());
        self
    }

    /// Fail the next invalidation with `error` (after recording it)
    pub fn failing_with(self, error: Error) -> Self {
        *self.failure.lock() = Some(error);
        self
    }

    /// Run `hook` on every invalidation, after recording it and with no
    /// lock held, so it may call back into the registry
    pub fn with_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Invalidations received so far
    pub fn invalidations(&self) -> Vec<(NotificationType, NotificationInfo, NotificationSource)> {
        self.invalidations.lock().clone()
    }
}

impl Dependency for RecordingDependency {
    fn id(&self) -> &str {
        &self.id
    }

    fn server_list(&self) -> Vec<String> {
        self.servers.clone()
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
        self.invalidations.lock().push((kind, info, source));
        if let Some(hook) = &self.hook {
            hook();
        }
        match self.failure.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for RecordingDependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingDependency")
            .field("id", &self.id)
            .field("servers", &self.servers)
            .field("expiration", &self.expiration)
            .field("has_hook", &self.hook.is_some())
            .finish()
    }
}
