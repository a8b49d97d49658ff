#![warn(missing_docs)]

//! RelayMQ transport core: pooled managed connections, idle and dead connection reaping, invocation context propagation

pub mod config;
pub mod context;
pub mod error;
pub mod factory;
pub mod handle;
pub mod info;
pub mod invocation;
pub mod managed;
pub mod manager;
pub mod metrics;
pub mod pool;
mod reaper;
pub mod security;
pub mod vm;

pub use config::PoolConfig;
pub use context::{ConnectionContext, ContextInvocationHandler};
pub use error::{ResourceError, Result};
pub use factory::{ConnectionFactory, DefaultConnectionFactory};
pub use handle::{ConnectionId, ConnectionLease, ManagedConnectionHandle};
pub use info::{ConnectionRequestInfo, Properties};
pub use invocation::{
    Caller, CallerListener, Invocation, InvocationHandler, MulticastCallerListener, Request,
    Response,
};
pub use managed::{
    Connection, ManagedConnection, ManagedConnectionAcceptor, ManagedConnectionAcceptorListener,
    ManagedConnectionFactory, ManagedConnectionListener,
};
pub use manager::ConnectionManager;
pub use metrics::{PoolMetrics, PoolStats};
pub use pool::{ConnectionPool, DefaultConnectionPool};
pub use security::{AllowAll, Authenticator, Principal};
pub use vm::{VmManagedConnectionFactory, VmRegistry};
