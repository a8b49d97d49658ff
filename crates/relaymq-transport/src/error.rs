//! Error types for the RelayMQ transport core.

use thiserror::Error;

/// Failures surfaced by connection managers, pools and managed connections.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// No registered connection factory handles the URI for outbound connections.
    #[error("no connection factory can connect to {uri}")]
    NoConnectFactory {
        /// The URI that could not be routed.
        uri: String,
    },

    /// No registered connection factory handles the URI for inbound connections.
    #[error("no connection factory can accept connections on {uri}")]
    NoAcceptFactory {
        /// The URI that could not be routed.
        uri: String,
    },

    /// The peer refused the connection.
    #[error("connection refused to {uri}")]
    ConnectionRefused {
        /// The refused URI.
        uri: String,
    },

    /// Connection establishment failed for a reason other than refusal.
    #[error("failed to connect to {uri}: {reason}")]
    Connect {
        /// The URI being connected to.
        uri: String,
        /// Transport specific failure description.
        reason: String,
    },

    /// Authentication or authorization rejected the principal.
    #[error("security failure: {reason}")]
    Security {
        /// Why the principal was rejected.
        reason: String,
    },

    /// A wait for a lock or latch was abandoned.
    #[error("interrupted while {operation}")]
    Interrupted {
        /// What the caller was waiting for.
        operation: &'static str,
    },

    /// The connection or lease has already been closed or destroyed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The pool or manager has been closed.
    #[error("connection pool closed")]
    PoolClosed,

    /// A URI could not be parsed or is missing a required component.
    #[error("invalid URI {uri}: {reason}")]
    InvalidUri {
        /// The offending URI text.
        uri: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A configuration property could not be parsed.
    #[error("invalid value {value:?} for configuration property {key}")]
    InvalidConfig {
        /// Fully namespaced property key.
        key: String,
        /// The raw property value.
        value: String,
    },

    /// A set-once registration was attempted twice.
    #[error("{0} already registered")]
    AlreadyRegistered(&'static str),

    /// The remote invocation failed before a response was produced.
    #[error("invocation failed: {0}")]
    Invocation(String),

    /// I/O failure in the underlying transport.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl ResourceError {
    /// Returns true for refused or failed connection establishment.
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self,
            ResourceError::ConnectionRefused { .. } | ResourceError::Connect { .. }
        )
    }

    /// Returns true when the failure was an authentication rejection.
    pub fn is_security_error(&self) -> bool {
        matches!(self, ResourceError::Security { .. })
    }
}

/// Result alias used throughout the transport core.
pub type Result<T> = std::result::Result<T, ResourceError>;
