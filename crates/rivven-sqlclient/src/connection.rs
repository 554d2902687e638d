//! Connection configuration for rivven-sqlclient
//!
//! Shared vocabulary for the connection layer:
//! - ConnectionConfig: connection-string backed settings
//! - IsolationLevel: transaction isolation levels understood by the server
//! - TransactionBinding: how a connection stays bound to an enlisted transaction
//! - ConnectionState: usability of an internal connection

use std::collections::HashMap;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IsolationLevel {
    /// No level requested; the server default (read committed) applies
    #[default]
    Unspecified,
    /// Pending changes from more highly isolated transactions cannot be overwritten
    Chaos,
    /// Read uncommitted - dirty reads possible
    ReadUncommitted,
    /// Read committed - no dirty reads
    ReadCommitted,
    /// Repeatable read - no non-repeatable reads
    RepeatableRead,
    /// Serializable - full isolation
    Serializable,
    /// Row-versioned snapshot isolation
    Snapshot,
}

impl IsolationLevel {
    /// Map `Unspecified` to the level actually sent to the server
    pub fn resolve(self) -> Self {
        match self {
            Self::Unspecified => Self::ReadCommitted,
            other => other,
        }
    }

    /// Convert to SQL string for SET TRANSACTION statement
    pub fn to_sql(&self) -> &'static str {
        match self {
            Self::Unspecified => "UNSPECIFIED",
            Self::Chaos => "CHAOS",
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
            Self::Snapshot => "SNAPSHOT",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_sql())
    }
}

impl FromStr for IsolationLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace(['_', '-'], " ").as_str() {
            "unspecified" => Ok(Self::Unspecified),
            "chaos" => Ok(Self::Chaos),
            "read uncommitted" => Ok(Self::ReadUncommitted),
            "read committed" => Ok(Self::ReadCommitted),
            "repeatable read" => Ok(Self::RepeatableRead),
            "serializable" => Ok(Self::Serializable),
            "snapshot" => Ok(Self::Snapshot),
            _ => Err(Error::config(format!("unknown isolation level: {}", s))),
        }
    }
}

/// How a connection is bound to the transaction it enlisted in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransactionBinding {
    /// Connection detaches from the transaction when it ends
    #[default]
    ImplicitUnbind,
    /// Connection stays attached until explicitly closed; every command
    /// re-validates the ambient transaction
    ExplicitUnbind,
}

impl FromStr for TransactionBinding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "implicit unbind" => Ok(Self::ImplicitUnbind),
            "explicit unbind" => Ok(Self::ExplicitUnbind),
            _ => Err(Error::config(format!("unknown transaction binding: {}", s))),
        }
    }
}

/// Usability of an internal connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Usable
    Open,
    /// Still connected but must not be returned to the pool
    Doomed,
    /// Aborted after a fatal error
    Broken,
    /// Closed by the owner
    Closed,
}

impl ConnectionState {
    /// Whether commands may run on a connection in this state
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Configuration for creating connections
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Server name (`Data Source`)
    pub data_source: String,
    /// Initial database (`Initial Catalog`)
    pub initial_catalog: String,
    /// Application name reported to the server
    pub application_name: Option<String>,
    /// Automatically enlist in the ambient transaction on open
    pub enlist: bool,
    /// Transaction binding mode
    pub transaction_binding: TransactionBinding,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Additional connection properties
    pub properties: HashMap<String, String>,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Redact credentials to prevent leaking passwords to logs.
        let properties: HashMap<&str, &str> = self
            .properties
            .iter()
            .map(|(k, v)| {
                if is_secret_key(k) {
                    (k.as_str(), "***")
                } else {
                    (k.as_str(), v.as_str())
                }
            })
            .collect();

        f.debug_struct("ConnectionConfig")
            .field("data_source", &self.data_source)
            .field("initial_catalog", &self.initial_catalog)
            .field("application_name", &self.application_name)
            .field("enlist", &self.enlist)
            .field("transaction_binding", &self.transaction_binding)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("properties", &properties)
            .finish()
    }
}

fn is_secret_key(key: &str) -> bool {
    matches!(key, "password" | "pwd")
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            data_source: String::new(),
            initial_catalog: String::new(),
            application_name: Some("rivven-sqlclient".into()),
            enlist: true,
            transaction_binding: TransactionBinding::default(),
            connect_timeout_ms: 15_000,
            properties: HashMap::new(),
        }
    }
}

impl ConnectionConfig {
    /// Create configuration for a server
    pub fn new(data_source: impl Into<String>) -> Self {
        Self {
            data_source: data_source.into(),
            ..Default::default()
        }
    }

    /// Parse a `key=value;key=value` connection string.
    ///
    /// Keys are case-insensitive. Unrecognized keys are kept in `properties`
    /// (lower-cased).
    pub fn from_connection_string(s: &str) -> Result<Self> {
        let mut config = Self::default();

        for pair in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::config(format!("malformed connection string segment: {}", pair)))?;
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();

            match key.as_str() {
                "data source" | "server" | "address" | "addr" => {
                    config.data_source = value.to_string()
                }
                "initial catalog" | "database" => config.initial_catalog = value.to_string(),
                "application name" | "app" => config.application_name = Some(value.to_string()),
                "enlist" => config.enlist = parse_bool(&key, value)?,
                "transaction binding" => config.transaction_binding = value.parse()?,
                "connect timeout" | "connection timeout" | "timeout" => {
                    let secs: u64 = value.parse().map_err(|_| {
                        Error::config(format!("invalid value for '{}': {}", key, value))
                    })?;
                    config.connect_timeout_ms = secs * 1000;
                }
                _ => {
                    config.properties.insert(key, value.to_string());
                }
            }
        }

        if config.data_source.is_empty() {
            return Err(Error::config("connection string has no data source"));
        }
        Ok(config)
    }

    /// Set initial database
    pub fn with_initial_catalog(mut self, catalog: impl Into<String>) -> Self {
        self.initial_catalog = catalog.into();
        self
    }

    /// Set application name
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Enable/disable automatic enlistment
    pub fn with_enlist(mut self, enlist: bool) -> Self {
        self.enlist = enlist;
        self
    }

    /// Set transaction binding mode
    pub fn with_transaction_binding(mut self, binding: TransactionBinding) -> Self {
        self.transaction_binding = binding;
        self
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    /// Add a connection property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" => Ok(true),
        "false" | "no" => Ok(false),
        _ => Err(Error::config(format!(
            "invalid value for '{}': {}",
            key, value
        ))),
    }
}
