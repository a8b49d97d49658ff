//! Shared fixtures for the transport integration tests.
//!
//! [`MockFactory`] produces [`MockConnection`]s that count pings and destroys
//! and can be told to ignore pings, fail to send them, or fail setup.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relaymq_transport::{
    Authenticator, Caller, CallerListener, Connection, ConnectionFactory, ConnectionPool,
    ConnectionRequestInfo, DefaultConnectionFactory, DefaultConnectionPool, Invocation,
    InvocationHandler, ManagedConnection, ManagedConnectionAcceptor,
    ManagedConnectionAcceptorListener, ManagedConnectionFactory, ManagedConnectionListener,
    PoolConfig, Principal, Request, ResourceError, Response, Result,
};
use url::Url;

/// Installs a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn uri(text: &str) -> Url {
    Url::parse(text).unwrap()
}

pub fn info(text: &str) -> ConnectionRequestInfo {
    ConnectionRequestInfo::parse(text).unwrap()
}

/// Answers every request with its own arguments.
pub struct Echo;

#[async_trait]
impl InvocationHandler for Echo {
    async fn invoke(&self, invocation: Invocation) -> Response {
        Response::value(invocation.into_request().args)
    }
}

/// Knobs shared by a factory and every connection it creates.
#[derive(Default)]
pub struct Behaviour {
    pub ignore_pings: AtomicBool,
    pub fail_pings: AtomicBool,
    pub fail_setup: AtomicBool,
    pub fail_accept: AtomicBool,
}

pub struct MockConnection {
    pub remote: Url,
    pub local: Url,
    pub principal: Option<Principal>,
    pub pings: AtomicUsize,
    pub destroys: AtomicUsize,
    pub invocations: AtomicUsize,
    behaviour: Arc<Behaviour>,
    this: Weak<MockConnection>,
    handler: OnceLock<Arc<dyn InvocationHandler>>,
    listener: OnceLock<Arc<dyn ManagedConnectionListener>>,
}

impl MockConnection {
    pub fn new(
        remote: Url,
        local: Url,
        principal: Option<Principal>,
        behaviour: Arc<Behaviour>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            remote,
            local,
            principal,
            pings: AtomicUsize::new(0),
            destroys: AtomicUsize::new(0),
            invocations: AtomicUsize::new(0),
            behaviour,
            this: this.clone(),
            handler: OnceLock::new(),
            listener: OnceLock::new(),
        })
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    /// Simulates the peer closing the link.
    pub fn peer_closed(&self) {
        if let Some(listener) = self.listener.get() {
            listener.closed();
        }
    }

    /// Simulates a transport failure.
    pub fn fail(&self, error: ResourceError) {
        if let Some(listener) = self.listener.get() {
            listener.error(error);
        }
    }

    /// Delivers an inbound invocation as the peer would.
    pub async fn inbound(&self, request: Request) -> Option<Response> {
        let handler = self.handler.get()?.clone();
        let caller = Caller::new(self.remote.clone(), self.local.clone());
        Some(handler.invoke(Invocation::new(request, caller)).await)
    }
}

impl ManagedConnection for MockConnection {
    fn set_invocation_handler(&self, handler: Arc<dyn InvocationHandler>) -> Result<()> {
        if self.behaviour.fail_setup.load(Ordering::SeqCst) {
            return Err(ResourceError::Invocation("handler registration failed".to_string()));
        }
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
        let connection = self.this.upgrade().ok_or(ResourceError::ConnectionClosed)?;
        Ok(Arc::new(MockLease { connection }))
    }

    fn ping(&self) -> Result<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.behaviour.fail_pings.load(Ordering::SeqCst) {
            return Err(ResourceError::ConnectionClosed);
        }
        if !self.behaviour.ignore_pings.load(Ordering::SeqCst) {
            if let Some(listener) = self.listener.get() {
                listener.pinged();
            }
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
        self.destroys.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockLease {
    connection: Arc<MockConnection>,
}

#[async_trait]
impl Connection for MockLease {
    async fn invoke(&self, request: Request) -> Result<Response> {
        if self.connection.destroys() > 0 {
            return Err(ResourceError::ConnectionClosed);
        }
        self.connection.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(Response::value(request.args))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct MockAcceptor {
    info: ConnectionRequestInfo,
    behaviour: Arc<Behaviour>,
    this: Weak<MockAcceptor>,
    listener: OnceLock<Arc<dyn ManagedConnectionAcceptorListener>>,
    pub closed: AtomicBool,
    accepted: AtomicUsize,
}

impl MockAcceptor {
    /// Simulates a peer connecting; returns the server end.
    pub fn connect(&self, principal: Option<Principal>) -> Arc<MockConnection> {
        let n = self.accepted.fetch_add(1, Ordering::SeqCst) + 1;
        let connection = MockConnection::new(
            uri(&format!("mock://peer-{}", n)),
            self.info.uri().clone(),
            principal,
            Arc::clone(&self.behaviour),
        );
        if let (Some(listener), Some(this)) = (self.listener.get(), self.this.upgrade()) {
            listener.accepted(this, connection.clone());
        }
        connection
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ManagedConnectionAcceptor for MockAcceptor {
    fn accept(&self, listener: Arc<dyn ManagedConnectionAcceptorListener>) -> Result<()> {
        if self.behaviour.fail_accept.load(Ordering::SeqCst) {
            return Err(ResourceError::Connect {
                uri: self.info.uri().to_string(),
                reason: "address in use".to_string(),
            });
        }
        self.listener
            .set(listener)
            .map_err(|_| ResourceError::AlreadyRegistered("acceptor listener"))
    }

    fn info(&self) -> &ConnectionRequestInfo {
        &self.info
    }

    fn uri(&self) -> &Url {
        self.info.uri()
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Managed connection factory for `mock://` URIs.
pub struct MockFactory {
    name: String,
    pub behaviour: Arc<Behaviour>,
    create_delay: Duration,
    connections: Mutex<Vec<Arc<MockConnection>>>,
    acceptors: Mutex<Vec<Arc<MockAcceptor>>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Self::named("mock", Duration::ZERO)
    }

    /// A factory whose connections take `create_delay` to establish.
    pub fn named(name: &str, create_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            behaviour: Arc::new(Behaviour::default()),
            create_delay,
            connections: Mutex::new(Vec::new()),
            acceptors: Mutex::new(Vec::new()),
        })
    }

    /// Every outbound connection created so far.
    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().clone()
    }

    pub fn created(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn acceptors(&self) -> Vec<Arc<MockAcceptor>> {
        self.acceptors.lock().clone()
    }
}

#[async_trait]
impl ManagedConnectionFactory for MockFactory {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_managed_connection(
        &self,
        principal: Option<&Principal>,
        info: &ConnectionRequestInfo,
    ) -> Result<Arc<dyn ManagedConnection>> {
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        let n = self.created() + 1;
        let connection = MockConnection::new(
            info.uri().clone(),
            uri(&format!("mock://local-{}", n)),
            principal.cloned(),
            Arc::clone(&self.behaviour),
        );
        self.connections.lock().push(Arc::clone(&connection));
        Ok(connection)
    }

    async fn create_managed_connection_acceptor(
        &self,
        _authenticator: Arc<dyn Authenticator>,
        info: &ConnectionRequestInfo,
    ) -> Result<Arc<dyn ManagedConnectionAcceptor>> {
        let acceptor = Arc::new_cyclic(|this| MockAcceptor {
            info: info.clone(),
            behaviour: Arc::clone(&self.behaviour),
            this: this.clone(),
            listener: OnceLock::new(),
            closed: AtomicBool::new(false),
            accepted: AtomicUsize::new(0),
        });
        self.acceptors.lock().push(Arc::clone(&acceptor));
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
            .find(|c| {
                c.principal().as_ref() == principal
                    && c.remote_uri().is_ok_and(|remote| &remote == info.uri())
            })
            .cloned()
    }

    fn match_managed_connection_acceptors(
        &self,
        candidates: &[Arc<dyn ManagedConnectionAcceptor>],
        info: &ConnectionRequestInfo,
    ) -> Option<Arc<dyn ManagedConnectionAcceptor>> {
        candidates.iter().find(|a| a.info() == info).cloned()
    }

    fn create_connection_factory(
        &self,
        pool: Arc<dyn ConnectionPool>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Arc<dyn ConnectionFactory> {
        Arc::new(DefaultConnectionFactory::new(["mock"], pool, authenticator))
    }
}

/// A pool over `factory` with an [`Echo`] handler and no resolver.
pub fn pool(factory: &Arc<MockFactory>, config: PoolConfig) -> DefaultConnectionPool {
    let resolver: Weak<dyn ConnectionFactory> = Weak::<DefaultConnectionFactory>::new();
    DefaultConnectionPool::new(factory.clone(), Arc::new(Echo), resolver, config)
}

/// Records disconnection notifications.
#[derive(Default)]
pub struct RecordingCallerListener {
    pub callers: Mutex<Vec<Caller>>,
}

impl RecordingCallerListener {
    pub fn seen(&self) -> Vec<Caller> {
        self.callers.lock().clone()
    }
}

impl CallerListener for RecordingCallerListener {
    fn disconnected(&self, caller: &Caller) {
        self.callers.lock().push(caller.clone());
    }
}
