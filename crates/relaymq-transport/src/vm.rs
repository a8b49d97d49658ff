//! In-process transport for `vm://<name>` URIs.
//!
//! Acceptors bind a name in a shared [`VmRegistry`]. Connecting to a bound
//! name authenticates the principal with the acceptor's authenticator, then
//! creates a linked pair of managed connections: the client end is returned
//! to the caller and the server end is handed to the acceptor's listener.
//! Invocations call the peer's handler directly, without serialization.
//!
//! Useful for embedding a broker and its clients in one process, and for
//! exercising pools and managers without sockets.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};
use url::Url;

use crate::error::{ResourceError, Result};
use crate::factory::{ConnectionFactory, DefaultConnectionFactory};
use crate::info::{parse_uri, ConnectionRequestInfo};
use crate::invocation::{Caller, Invocation, InvocationHandler, Request, Response};
use crate::managed::{
    Connection, ManagedConnection, ManagedConnectionAcceptor, ManagedConnectionAcceptorListener,
    ManagedConnectionFactory, ManagedConnectionListener,
};
use crate::pool::ConnectionPool;
use crate::security::{Authenticator, Principal};

/// URI scheme served by the in-process transport.
pub const VM_SCHEME: &str = "vm";

fn bind_name(uri: &Url) -> Result<String> {
    match uri.host_str() {
        Some(host) if !host.is_empty() => Ok(host.to_ascii_lowercase()),
        _ => Err(ResourceError::InvalidUri {
            uri: uri.to_string(),
            reason: "missing endpoint name".to_string(),
        }),
    }
}

/// Names bound by in-process acceptors.
#[derive(Default)]
pub struct VmRegistry {
    acceptors: Mutex<HashMap<String, Weak<VmManagedConnectionAcceptor>>>,
    next_client: AtomicU64,
}

impl VmRegistry {
    /// Creates an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// True if an open acceptor is bound to `name`.
    pub fn is_bound(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    fn lookup(&self, name: &str) -> Option<Arc<VmManagedConnectionAcceptor>> {
        self.acceptors.lock().get(name).and_then(Weak::upgrade)
    }

    fn bind(&self, name: &str, acceptor: &Arc<VmManagedConnectionAcceptor>) -> Result<()> {
        let mut acceptors = self.acceptors.lock();
        if acceptors.get(name).and_then(Weak::upgrade).is_some() {
            return Err(ResourceError::Connect {
                uri: acceptor.uri.to_string(),
                reason: format!("name {} already bound", name),
            });
        }
        acceptors.insert(name.to_string(), Arc::downgrade(acceptor));
        Ok(())
    }

    fn unbind(&self, name: &str, acceptor: &VmManagedConnectionAcceptor) {
        let mut acceptors = self.acceptors.lock();
        let bound_here = acceptors
            .get(name)
            .is_some_and(|bound| std::ptr::eq(bound.as_ptr(), acceptor));
        if bound_here {
            acceptors.remove(name);
        }
    }

    fn connect(&self, principal: Option<&Principal>, uri: &Url) -> Result<Arc<VmManagedConnection>> {
        let name = bind_name(uri)?;
        let acceptor = self
            .lookup(&name)
            .ok_or_else(|| ResourceError::ConnectionRefused {
                uri: uri.to_string(),
            })?;

        if !acceptor.authenticator.authenticate(principal)? {
            return Err(ResourceError::Security {
                reason: format!(
                    "principal {} rejected by {}",
                    principal.map_or("<anonymous>", Principal::name),
                    acceptor.uri
                ),
            });
        }

        let client_id = self.next_client.fetch_add(1, Ordering::Relaxed) + 1;
        let client_uri = parse_uri(&format!("{}://client-{}", VM_SCHEME, client_id))?;
        let (client, server) =
            VmManagedConnection::pair(client_uri, acceptor.uri.clone(), principal.cloned());
        acceptor.deliver(server)?;
        Ok(client)
    }
}

impl fmt::Debug for VmRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.acceptors.lock().keys().cloned().collect();
        f.debug_struct("VmRegistry").field("bound", &names).finish()
    }
}

/// One end of an in-process connection.
pub struct VmManagedConnection {
    local: Url,
    remote: Url,
    principal: Option<Principal>,
    this: Weak<VmManagedConnection>,
    peer: OnceLock<Weak<VmManagedConnection>>,
    handler: OnceLock<Arc<dyn InvocationHandler>>,
    listener: OnceLock<Arc<dyn ManagedConnectionListener>>,
    destroyed: AtomicBool,
}

impl VmManagedConnection {
    fn new(local: Url, remote: Url, principal: Option<Principal>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            local,
            remote,
            principal,
            this: this.clone(),
            peer: OnceLock::new(),
            handler: OnceLock::new(),
            listener: OnceLock::new(),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Returns `(client, server)`, linked to each other.
    fn pair(client_uri: Url, server_uri: Url, principal: Option<Principal>) -> (Arc<Self>, Arc<Self>) {
        let client = Self::new(client_uri.clone(), server_uri.clone(), principal.clone());
        let server = Self::new(server_uri, client_uri, principal);
        let _ = client.peer.set(Arc::downgrade(&server));
        let _ = server.peer.set(Arc::downgrade(&client));
        (client, server)
    }

    /// True once this end was destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn live_peer(&self) -> Result<Arc<VmManagedConnection>> {
        if self.is_destroyed() {
            return Err(ResourceError::ConnectionClosed);
        }
        self.peer
            .get()
            .and_then(Weak::upgrade)
            .filter(|peer| !peer.is_destroyed())
            .ok_or(ResourceError::ConnectionClosed)
    }

    async fn deliver(&self, request: Request) -> Result<Response> {
        let peer = self.live_peer()?;
        let handler = peer
            .handler
            .get()
            .cloned()
            .ok_or_else(|| ResourceError::Invocation(format!("no handler registered at {}", peer.local)))?;
        let caller = Caller::new(self.local.clone(), peer.local.clone());
        trace!(caller = %caller, method = %request.method, "Delivering in-process invocation");
        Ok(handler.invoke(Invocation::new(request, caller)).await)
    }

    fn peer_closed(&self) {
        if self.is_destroyed() {
            return;
        }
        if let Some(listener) = self.listener.get() {
            listener.closed();
        }
    }
}

impl ManagedConnection for VmManagedConnection {
    fn set_invocation_handler(&self, handler: Arc<dyn InvocationHandler>) -> Result<()> {
        self.handler
            .set(handler)
            .map_err(|_| ResourceError::AlreadyRegistered("invocation handler"))
    }

    fn set_connection_event_listener(
        &self,
        listener: Arc<dyn ManagedConnectionListener>,
    ) -> Result<()> {
        self.listener
            .set(listener)
            .map_err(|_| ResourceError::AlreadyRegistered("connection event listener"))
    }

    fn get_connection(&self) -> Result<Arc<dyn Connection>> {
        if self.is_destroyed() {
            return Err(ResourceError::ConnectionClosed);
        }
        let connection = self.this.upgrade().ok_or(ResourceError::ConnectionClosed)?;
        Ok(Arc::new(VmConnection { connection }))
    }

    fn ping(&self) -> Result<()> {
        self.live_peer()?;
        if let Some(listener) = self.listener.get() {
            listener.pinged();
        }
        Ok(())
    }

    fn remote_uri(&self) -> Result<Url> {
        Ok(self.remote.clone())
    }

    fn local_uri(&self) -> Result<Url> {
        Ok(self.local.clone())
    }

    fn principal(&self) -> Option<Principal> {
        self.principal.clone()
    }

    fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(local = %self.local, remote = %self.remote, "In-process connection destroyed");
        if let Some(peer) = self.peer.get().and_then(Weak::upgrade) {
            peer.peer_closed();
        }
        Ok(())
    }
}

impl fmt::Debug for VmManagedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmManagedConnection")
            .field("local", &self.local.as_str())
            .field("remote", &self.remote.as_str())
            .field("principal", &self.principal)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// A caller's handle over an in-process connection.
struct VmConnection {
    connection: Arc<VmManagedConnection>,
}

#[async_trait]
impl Connection for VmConnection {
    async fn invoke(&self, request: Request) -> Result<Response> {
        self.connection.deliver(request).await
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Accepts in-process connections on one bound name.
pub struct VmManagedConnectionAcceptor {
    registry: Arc<VmRegistry>,
    authenticator: Arc<dyn Authenticator>,
    info: ConnectionRequestInfo,
    uri: Url,
    name: String,
    this: Weak<VmManagedConnectionAcceptor>,
    listener: OnceLock<Arc<dyn ManagedConnectionAcceptorListener>>,
    closed: AtomicBool,
}

impl VmManagedConnectionAcceptor {
    fn new(
        registry: Arc<VmRegistry>,
        authenticator: Arc<dyn Authenticator>,
        info: &ConnectionRequestInfo,
    ) -> Result<Arc<Self>> {
        let name = bind_name(info.uri())?;
        Ok(Arc::new_cyclic(|this| Self {
            registry,
            authenticator,
            info: info.clone(),
            uri: info.uri().clone(),
            name,
            this: this.clone(),
            listener: OnceLock::new(),
            closed: AtomicBool::new(false),
        }))
    }

    fn deliver(&self, connection: Arc<VmManagedConnection>) -> Result<()> {
        let (Some(listener), Some(acceptor)) = (self.listener.get(), self.this.upgrade()) else {
            return Err(ResourceError::ConnectionRefused {
                uri: self.uri.to_string(),
            });
        };
        listener.accepted(acceptor, connection);
        Ok(())
    }

    /// True once the acceptor stopped listening.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ManagedConnectionAcceptor for VmManagedConnectionAcceptor {
    fn accept(&self, listener: Arc<dyn ManagedConnectionAcceptorListener>) -> Result<()> {
        if self.is_closed() {
            return Err(ResourceError::ConnectionClosed);
        }
        let acceptor = self.this.upgrade().ok_or(ResourceError::ConnectionClosed)?;
        self.listener
            .set(listener)
            .map_err(|_| ResourceError::AlreadyRegistered("acceptor listener"))?;
        self.registry.bind(&self.name, &acceptor)?;
        debug!(uri = %self.uri, "In-process acceptor bound");
        Ok(())
    }

    fn info(&self) -> &ConnectionRequestInfo {
        &self.info
    }

    fn uri(&self) -> &Url {
        &self.uri
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.registry.unbind(&self.name, self);
            debug!(uri = %self.uri, "In-process acceptor unbound");
        }
        Ok(())
    }
}

impl fmt::Debug for VmManagedConnectionAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmManagedConnectionAcceptor")
            .field("uri", &self.uri.as_str())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Managed connection factory for the in-process transport.
#[derive(Debug, Clone)]
pub struct VmManagedConnectionFactory {
    registry: Arc<VmRegistry>,
}

impl VmManagedConnectionFactory {
    /// Creates a factory dialing and binding through `registry`.
    pub fn new(registry: Arc<VmRegistry>) -> Self {
        Self { registry }
    }

    /// The registry endpoints are bound in.
    pub fn registry(&self) -> &Arc<VmRegistry> {
        &self.registry
    }
}

#[async_trait]
impl ManagedConnectionFactory for VmManagedConnectionFactory {
    fn name(&self) -> &str {
        VM_SCHEME
    }

    async fn create_managed_connection(
        &self,
        principal: Option<&Principal>,
        info: &ConnectionRequestInfo,
    ) -> Result<Arc<dyn ManagedConnection>> {
        let connection = self.registry.connect(principal, info.uri())?;
        Ok(connection)
    }

    async fn create_managed_connection_acceptor(
        &self,
        authenticator: Arc<dyn Authenticator>,
        info: &ConnectionRequestInfo,
    ) -> Result<Arc<dyn ManagedConnectionAcceptor>> {
        let acceptor = VmManagedConnectionAcceptor::new(Arc::clone(&self.registry), authenticator, info)?;
        Ok(acceptor)
    }

    fn match_managed_connections(
        &self,
        candidates: &[Arc<dyn ManagedConnection>],
        principal: Option<&Principal>,
        info: &ConnectionRequestInfo,
    ) -> Option<Arc<dyn ManagedConnection>> {
        candidates
            .iter()
            .find(|candidate| {
                candidate.principal().as_ref() == principal
                    && candidate
                        .remote_uri()
                        .is_ok_and(|remote| &remote == info.uri())
            })
            .cloned()
    }

    fn match_managed_connection_acceptors(
        &self,
        candidates: &[Arc<dyn ManagedConnectionAcceptor>],
        info: &ConnectionRequestInfo,
    ) -> Option<Arc<dyn ManagedConnectionAcceptor>> {
        candidates
            .iter()
            .find(|candidate| candidate.uri() == info.uri())
            .cloned()
    }

    fn create_connection_factory(
        &self,
        pool: Arc<dyn ConnectionPool>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Arc<dyn ConnectionFactory> {
        Arc::new(DefaultConnectionFactory::new([VM_SCHEME], pool, authenticator))
    }
}
