//! Capability traits implemented by each wire protocol.
//!
//! The pooling core only depends on these traits. A protocol supplies a
//! [`ManagedConnectionFactory`] that creates physical connections
//! ([`ManagedConnection`]) and listening endpoints
//! ([`ManagedConnectionAcceptor`]), and decides which pooled connection can
//! serve a new request.

use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::error::{ResourceError, Result};
use crate::factory::ConnectionFactory;
use crate::info::ConnectionRequestInfo;
use crate::invocation::{InvocationHandler, Request, Response};
use crate::pool::ConnectionPool;
use crate::security::{Authenticator, Principal};

/// A per-caller logical handle over a physical connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Performs one remote call and waits for its response.
    async fn invoke(&self, request: Request) -> Result<Response>;

    /// Releases this handle. Idempotent.
    fn close(&self) -> Result<()>;
}

/// Receives events about one managed connection.
///
/// Events may be delivered from any thread, including transport I/O threads.
pub trait ManagedConnectionListener: Send + Sync {
    /// The peer answered a ping.
    fn pinged(&self);

    /// The peer closed the connection.
    fn closed(&self);

    /// The connection failed.
    fn error(&self, error: ResourceError);
}

/// One physical transport connection.
pub trait ManagedConnection: Send + Sync {
    /// Registers the handler for inbound invocations. May only be called once.
    fn set_invocation_handler(&self, handler: Arc<dyn InvocationHandler>) -> Result<()>;

    /// Registers the event listener. May only be called once.
    fn set_connection_event_listener(
        &self,
        listener: Arc<dyn ManagedConnectionListener>,
    ) -> Result<()>;

    /// Creates a new logical handle for issuing invocations.
    fn get_connection(&self) -> Result<Arc<dyn Connection>>;

    /// Sends a liveness probe. The answer arrives through
    /// [`ManagedConnectionListener::pinged`]; an error means the probe could
    /// not be sent at all.
    fn ping(&self) -> Result<()>;

    /// URI of the peer.
    fn remote_uri(&self) -> Result<Url>;

    /// URI of this end.
    fn local_uri(&self) -> Result<Url>;

    /// The principal the connection was established for, if any.
    fn principal(&self) -> Option<Principal>;

    /// Closes the physical link. The connection is unusable afterwards.
    fn destroy(&self) -> Result<()>;
}

/// Receives connections accepted by a [`ManagedConnectionAcceptor`].
pub trait ManagedConnectionAcceptorListener: Send + Sync {
    /// A peer connected.
    fn accepted(
        &self,
        acceptor: Arc<dyn ManagedConnectionAcceptor>,
        connection: Arc<dyn ManagedConnection>,
    );

    /// The acceptor failed and will produce no more connections.
    fn error(&self, acceptor: Arc<dyn ManagedConnectionAcceptor>, error: ResourceError);
}

/// A listening endpoint producing inbound managed connections.
pub trait ManagedConnectionAcceptor: Send + Sync {
    /// Starts accepting, delivering connections to `listener`.
    fn accept(&self, listener: Arc<dyn ManagedConnectionAcceptorListener>) -> Result<()>;

    /// The request this acceptor was created for.
    fn info(&self) -> &ConnectionRequestInfo;

    /// The URI peers connect to.
    fn uri(&self) -> &Url;

    /// Stops accepting. Connections already accepted are unaffected.
    fn close(&self) -> Result<()>;
}

/// Protocol specific creation and matching of managed connections.
#[async_trait]
pub trait ManagedConnectionFactory: Send + Sync {
    /// Short connector name, used as the configuration namespace.
    fn name(&self) -> &str;

    /// Opens a new physical connection.
    async fn create_managed_connection(
        &self,
        principal: Option<&Principal>,
        info: &ConnectionRequestInfo,
    ) -> Result<Arc<dyn ManagedConnection>>;

    /// Creates a listening endpoint. Peers are checked with `authenticator`.
    async fn create_managed_connection_acceptor(
        &self,
        authenticator: Arc<dyn Authenticator>,
        info: &ConnectionRequestInfo,
    ) -> Result<Arc<dyn ManagedConnectionAcceptor>>;

    /// Picks a connection from `candidates` able to serve the request.
    fn match_managed_connections(
        &self,
        candidates: &[Arc<dyn ManagedConnection>],
        principal: Option<&Principal>,
        info: &ConnectionRequestInfo,
    ) -> Option<Arc<dyn ManagedConnection>>;

    /// Picks an acceptor from `candidates` equivalent to the request.
    fn match_managed_connection_acceptors(
        &self,
        candidates: &[Arc<dyn ManagedConnectionAcceptor>],
        info: &ConnectionRequestInfo,
    ) -> Option<Arc<dyn ManagedConnectionAcceptor>>;

    /// Creates the externally visible factory that routes URIs to `pool`.
    fn create_connection_factory(
        &self,
        pool: Arc<dyn ConnectionPool>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Arc<dyn ConnectionFactory>;
}

/// Compares two managed connections by identity.
pub fn same_connection(a: &Arc<dyn ManagedConnection>, b: &Arc<dyn ManagedConnection>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Compares two acceptors by identity.
pub fn same_acceptor(
    a: &Arc<dyn ManagedConnectionAcceptor>,
    b: &Arc<dyn ManagedConnectionAcceptor>,
) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
