//! Error types for rivven-sqlclient
//!
//! Errors are split along the lines the connection and notification code
//! branch on:
//! - Contract errors (bad arguments, parallel transactions) are returned
//!   synchronously and never retried
//! - Server errors carry the server-reported severity class
//! - Fatal errors (resource exhaustion, aborted execution) doom the owning
//!   connection and always propagate, even out of isolated fan-out loops

use std::fmt;
use thiserror::Error;

/// Result type for rivven-sqlclient operations
pub type Result<T> = std::result::Result<T, Error>;

/// Lowest server severity class that terminates the session
pub const FATAL_ERROR_CLASS: u8 = 20;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection state errors (closed, doomed)
    Connection,
    /// Transaction protocol errors
    Transaction,
    /// Errors reported by the server
    Server,
    /// Invalid caller-supplied argument
    Argument,
    /// Configuration error
    Configuration,
    /// Query notification errors
    Notification,
    /// Unrecoverable runtime fault
    Fatal,
    /// Broken internal invariant
    Internal,
}

impl ErrorCategory {
    /// Whether errors in this category may be caught and the work continued
    #[inline]
    pub const fn is_recoverable(self) -> bool {
        !matches!(self, Self::Fatal)
    }
}

/// Kind of unrecoverable runtime fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FatalKind {
    /// Memory could not be allocated
    OutOfMemory,
    /// Call stack exhausted
    StackOverflow,
    /// Execution was torn down from outside
    Aborted,
}

impl fmt::Display for FatalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::StackOverflow => write!(f, "stack overflow"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Main error type for rivven-sqlclient
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Server-reported error
    #[error("server error {number} (class {class}): {message}")]
    Server {
        number: i32,
        class: u8,
        message: String,
    },

    /// Unrecoverable fault; the connection is aborted before this propagates
    #[error("fatal error: {kind}: {message}")]
    Fatal { kind: FatalKind, message: String },

    /// A local transaction was already started through the API
    #[error("parallel transactions are not supported")]
    ParallelTransactionsNotSupported,

    /// Attempt to enlist while a local transaction is open
    #[error("cannot enlist in a distributed transaction while a local transaction is active")]
    LocalTransactionPresent,

    /// Database name was empty
    #[error("database name is not valid: empty name")]
    EmptyDatabaseName,

    /// Server could not supply a transaction-manager address
    #[error("failed to obtain the DTC address from the server")]
    CannotGetDtcAddress,

    /// Ambient transaction no longer matches the enlisted transaction
    #[error("the transaction is not associated with the current connection or has been completed")]
    TransactionConnectionMismatch,

    /// Enlisted transaction completed but the scope was not left
    #[error("the enlisted transaction has completed but has not been disposed")]
    TransactionCompletedButNotDisposed,

    /// Local transaction handle used after commit/rollback
    #[error("this transaction has completed; it is no longer usable")]
    TransactionCompleted,

    /// Generic transaction error
    #[error("transaction error: {message}")]
    Transaction { message: String },

    /// Required argument missing
    #[error("argument is null or empty: {name}")]
    ArgumentNull { name: String },

    /// Dependency id missing or malformed on lookup
    #[error("dependency id mismatch: {id:?}")]
    DependencyIdMismatch { id: String },

    /// Dependency id registered twice
    #[error("dependency already registered: {id}")]
    DuplicateDependency { id: String },

    /// Notification handler failed
    #[error("notification error: {message}")]
    Notification { message: String },

    /// Connection was closed
    #[error("connection is closed")]
    ConnectionClosed,

    /// Connection was doomed or broken and cannot be used
    #[error("connection is no longer usable: {message}")]
    ConnectionDoomed { message: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Internal invariant violated (protocol bug)
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Server { .. } => ErrorCategory::Server,
            Self::Fatal { .. } => ErrorCategory::Fatal,
            Self::ParallelTransactionsNotSupported
            | Self::LocalTransactionPresent
            | Self::CannotGetDtcAddress
            | Self::TransactionConnectionMismatch
            | Self::TransactionCompletedButNotDisposed
            | Self::TransactionCompleted
            | Self::Transaction { .. } => ErrorCategory::Transaction,
            Self::EmptyDatabaseName
            | Self::ArgumentNull { .. }
            | Self::DependencyIdMismatch { .. }
            | Self::DuplicateDependency { .. } => ErrorCategory::Argument,
            Self::Notification { .. } => ErrorCategory::Notification,
            Self::ConnectionClosed | Self::ConnectionDoomed { .. } => ErrorCategory::Connection,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Whether this is an unrecoverable runtime fault
    #[inline]
    pub fn is_fatal(&self) -> bool {
        !self.category().is_recoverable()
    }

    /// Whether the server reported a session-terminating severity
    pub fn is_fatal_severity(&self) -> bool {
        matches!(self, Self::Server { class, .. } if *class >= FATAL_ERROR_CLASS)
    }

    /// Create a server error
    pub fn server(number: i32, class: u8, message: impl Into<String>) -> Self {
        Self::Server {
            number,
            class,
            message: message.into(),
        }
    }

    /// Create a fatal error
    pub fn fatal(kind: FatalKind, message: impl Into<String>) -> Self {
        Self::Fatal {
            kind,
            message: message.into(),
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    /// Create a null-argument error
    pub fn argument_null(name: impl Into<String>) -> Self {
        Self::ArgumentNull { name: name.into() }
    }

    /// Create a notification error
    pub fn notification(message: impl Into<String>) -> Self {
        Self::Notification {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Transaction => write!(f, "transaction"),
            Self::Server => write!(f, "server"),
            Self::Argument => write!(f, "argument"),
            Self::Configuration => write!(f, "configuration"),
            Self::Notification => write!(f, "notification"),
            Self::Fatal => write!(f, "fatal"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
