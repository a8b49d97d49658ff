//! Connection pooling with idle and dead connection reaping.
//!
//! A pool owns every managed connection and acceptor of one
//! [`ManagedConnectionFactory`]. Outbound connections are wrapped in a
//! [`ManagedConnectionHandle`] so the pool can count leases and probe
//! liveness; accepted connections are tracked for bookkeeping only and are
//! never reaped, since their peer originates the traffic.
//!
//! Lock order is reap lock, then reaper slot, then pool state. Connections are
//! destroyed and listeners notified with the state lock released, so
//! transports may deliver events inline from `destroy` or `ping`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::config::PoolConfig;
use crate::context::ContextInvocationHandler;
use crate::error::{ResourceError, Result};
use crate::factory::ConnectionFactory;
use crate::handle::{ConnectionId, ManagedConnectionHandle};
use crate::info::ConnectionRequestInfo;
use crate::invocation::{Caller, CallerListener, InvocationHandler};
use crate::managed::{
    same_acceptor, same_connection, ManagedConnection, ManagedConnectionAcceptor,
    ManagedConnectionAcceptorListener, ManagedConnectionFactory, ManagedConnectionListener,
};
use crate::metrics::{PoolMetrics, PoolStats};
use crate::reaper::{Reapable, ReaperDaemon};
use crate::security::{Authenticator, Principal};

/// Owns the managed connections and acceptors of one factory.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Creates a new outbound connection and adds it to the pool.
    async fn create_managed_connection(
        &self,
        principal: Option<&Principal>,
        info: &ConnectionRequestInfo,
    ) -> Result<Arc<dyn ManagedConnection>>;

    /// Returns a pooled connection able to serve the request, if any.
    fn match_managed_connections(
        &self,
        principal: Option<&Principal>,
        info: &ConnectionRequestInfo,
    ) -> Option<Arc<dyn ManagedConnection>>;

    /// Creates an acceptor and starts accepting on it.
    async fn create_managed_connection_acceptor(
        &self,
        authenticator: Arc<dyn Authenticator>,
        info: &ConnectionRequestInfo,
    ) -> Result<Arc<dyn ManagedConnectionAcceptor>>;

    /// Returns an existing acceptor equivalent to the request, if any.
    fn match_managed_connection_acceptors(
        &self,
        info: &ConnectionRequestInfo,
    ) -> Option<Arc<dyn ManagedConnectionAcceptor>>;

    /// Installs the listener told about every removed connection.
    fn set_caller_listener(&self, listener: Option<Arc<dyn CallerListener>>);

    /// Closes every acceptor, destroys every connection and stops reaping.
    fn close(&self);
}

struct PoolEntry {
    connection: Arc<dyn ManagedConnection>,
    /// `None` for accepted connections.
    handle: Option<Arc<ManagedConnectionHandle>>,
    /// Set once handler and listener registration completed.
    initialised: bool,
}

impl PoolEntry {
    fn is_accepted(&self) -> bool {
        self.handle.is_none()
    }

    fn reapable_handle(&self) -> Option<&Arc<ManagedConnectionHandle>> {
        if self.initialised {
            self.handle.as_ref()
        } else {
            None
        }
    }

    /// What the pool hands out for this entry.
    fn exposed(&self) -> Arc<dyn ManagedConnection> {
        match &self.handle {
            Some(handle) => Arc::clone(handle) as Arc<dyn ManagedConnection>,
            None => Arc::clone(&self.connection),
        }
    }

    fn is(&self, connection: &Arc<dyn ManagedConnection>) -> bool {
        same_connection(&self.connection, connection) || same_connection(&self.exposed(), connection)
    }
}

#[derive(Default)]
struct PoolState {
    entries: BTreeMap<ConnectionId, PoolEntry>,
    acceptors: Vec<Arc<dyn ManagedConnectionAcceptor>>,
}

struct PoolShared {
    factory: Arc<dyn ManagedConnectionFactory>,
    handler: Arc<dyn InvocationHandler>,
    resolver: Weak<dyn ConnectionFactory>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    reap_lock: Mutex<()>,
    reaper: Mutex<Option<ReaperDaemon>>,
    caller_listener: RwLock<Option<Arc<dyn CallerListener>>>,
    metrics: PoolMetrics,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl PoolShared {
    fn add(
        self: &Arc<Self>,
        connection: Arc<dyn ManagedConnection>,
        accepted: bool,
    ) -> Result<Arc<dyn ManagedConnection>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = if accepted {
            None
        } else {
            let pool = Arc::downgrade(self);
            Some(Arc::new(ManagedConnectionHandle::new(
                id,
                Arc::clone(&connection),
                move |id| {
                    if let Some(pool) = pool.upgrade() {
                        pool.idle(id);
                    }
                },
            )))
        };
        let entry = PoolEntry {
            connection: Arc::clone(&connection),
            handle,
            initialised: false,
        };
        let exposed = entry.exposed();

        {
            let mut reaper = self.reaper.lock();
            if self.closed.load(Ordering::SeqCst) {
                drop(reaper);
                if let Err(e) = connection.destroy() {
                    warn!(error = %e, "Failed to destroy connection offered to a closed pool");
                }
                return Err(ResourceError::PoolClosed);
            }
            self.state.lock().entries.insert(id, entry);
            if reaper.as_ref().map_or(true, ReaperDaemon::is_cancelled) {
                *reaper = ReaperDaemon::start(Arc::downgrade(self), &self.config);
            }
        }

        if let Err(error) = self.initialise(id, &connection) {
            warn!(connection = id, error = %error, "Connection setup failed, discarding");
            self.metrics.inc_setup_failures();
            self.remove_id(id, false);
            return Err(error);
        }

        debug!(
            connector = self.factory.name(),
            connection = id,
            accepted,
            "Connection added"
        );
        Ok(exposed)
    }

    fn initialise(self: &Arc<Self>, id: ConnectionId, connection: &Arc<dyn ManagedConnection>) -> Result<()> {
        let handler = ContextInvocationHandler::new(
            Arc::clone(&self.handler),
            self.resolver.clone(),
            connection.principal(),
        );
        connection.set_invocation_handler(Arc::new(handler))?;
        connection.set_connection_event_listener(Arc::new(PoolConnectionListener {
            id,
            pool: Arc::downgrade(self),
        }))?;

        match self.state.lock().entries.get_mut(&id) {
            Some(entry) => {
                entry.initialised = true;
                Ok(())
            }
            // Closed by the peer during setup.
            None => Err(ResourceError::ConnectionClosed),
        }
    }

    /// Removes and destroys the connection. Returns false if it was already gone.
    fn remove_id(&self, id: ConnectionId, notify: bool) -> bool {
        let Some(entry) = self.state.lock().entries.remove(&id) else {
            return false;
        };

        let caller = if notify {
            match (entry.connection.remote_uri(), entry.connection.local_uri()) {
                (Ok(remote), Ok(local)) => Some(Caller::new(remote, local)),
                (Err(e), _) | (_, Err(e)) => {
                    warn!(connection = id, error = %e, "Failed to resolve URIs of removed connection");
                    None
                }
            }
        } else {
            None
        };

        if let Err(e) = entry.connection.destroy() {
            warn!(connection = id, error = %e, "Failed to destroy connection");
        }
        self.metrics.inc_connections_destroyed();
        debug!(
            connector = self.factory.name(),
            connection = id,
            accepted = entry.is_accepted(),
            "Connection removed"
        );

        if let Some(caller) = caller {
            let listener = self.caller_listener.read().clone();
            if let Some(listener) = listener {
                listener.disconnected(&caller);
            }
        }

        self.stop_reaper_if_empty();
        true
    }

    fn stop_reaper_if_empty(&self) {
        let mut reaper = self.reaper.lock();
        if self.state.lock().entries.is_empty() {
            if let Some(daemon) = reaper.take() {
                daemon.stop();
            }
        }
    }

    /// Schedules an idle scan after a lease count dropped to zero.
    fn idle(self: &Arc<Self>, id: ConnectionId) {
        trace!(connection = id, "Scheduling idle scan");
        if let Some(daemon) = self.reaper.lock().as_ref() {
            daemon.schedule_idle(Arc::downgrade(self));
        }
    }

    fn pinged(&self, id: ConnectionId) {
        let handle = self
            .state
            .lock()
            .entries
            .get(&id)
            .and_then(|entry| entry.handle.clone());
        if let Some(handle) = handle {
            trace!(connection = id, "Ping answered");
            handle.pinged();
        }
    }

    fn accepted(self: &Arc<Self>, connection: Arc<dyn ManagedConnection>) -> Result<Arc<dyn ManagedConnection>> {
        let connection = self.add(connection, true)?;
        self.metrics.inc_connections_accepted();
        Ok(connection)
    }

    fn remove_acceptor(&self, acceptor: &Arc<dyn ManagedConnectionAcceptor>) -> bool {
        let mut state = self.state.lock();
        let before = state.acceptors.len();
        state.acceptors.retain(|a| !same_acceptor(a, acceptor));
        state.acceptors.len() != before
    }

    fn reapable_handles(&self) -> Vec<Arc<ManagedConnectionHandle>> {
        self.state
            .lock()
            .entries
            .values()
            .filter_map(|entry| entry.reapable_handle().cloned())
            .collect()
    }
}

impl Reapable for PoolShared {
    fn reap_idle(&self) {
        let _reap = self.reap_lock.lock();
        let idle: Vec<ConnectionId> = self
            .reapable_handles()
            .into_iter()
            .filter(|handle| handle.can_destroy(self.config.idle_period))
            .map(|handle| handle.id())
            .collect();

        for id in idle {
            if self.remove_id(id, true) {
                debug!(connection = id, "Reaped idle connection");
                self.metrics.inc_idle_reaped();
            }
        }
    }

    fn reap_dead(&self) {
        let _reap = self.reap_lock.lock();
        for handle in self.reapable_handles() {
            let id = handle.id();
            if handle.used() {
                handle.clear_used();
                handle.pinged();
                continue;
            }

            if handle.pinging() {
                let waits = handle.inc_ping_waits();
                if waits < self.config.reap_dead_iterations {
                    continue;
                }
                if handle.active_connections() > 0 {
                    debug!(connection = id, waits, "Unanswered connection still leased, keeping it");
                    continue;
                }
                if self.remove_id(id, true) {
                    warn!(connection = id, waits, "Connection stopped answering pings, reaped");
                    self.metrics.inc_dead_reaped();
                }
                continue;
            }

            self.metrics.inc_pings_sent();
            if let Err(e) = handle.ping() {
                warn!(connection = id, error = %e, "Failed to ping connection");
                if handle.active_connections() > 0 {
                    // Still pinging: removal follows once the last lease is released.
                    continue;
                }
                if self.remove_id(id, true) {
                    self.metrics.inc_dead_reaped();
                }
            }
        }
    }
}

/// Forwards the events of one managed connection to its pool.
struct PoolConnectionListener {
    id: ConnectionId,
    pool: Weak<PoolShared>,
}

impl ManagedConnectionListener for PoolConnectionListener {
    fn pinged(&self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.pinged(self.id);
        }
    }

    fn closed(&self) {
        if let Some(pool) = self.pool.upgrade() {
            debug!(connection = self.id, "Connection closed by peer");
            pool.remove_id(self.id, true);
        }
    }

    fn error(&self, error: ResourceError) {
        if let Some(pool) = self.pool.upgrade() {
            warn!(connection = self.id, error = %error, "Connection failed");
            pool.remove_id(self.id, true);
        }
    }
}

struct PoolAcceptorListener {
    pool: Weak<PoolShared>,
}

impl ManagedConnectionAcceptorListener for PoolAcceptorListener {
    fn accepted(
        &self,
        acceptor: Arc<dyn ManagedConnectionAcceptor>,
        connection: Arc<dyn ManagedConnection>,
    ) {
        let Some(pool) = self.pool.upgrade() else {
            let _ = connection.destroy();
            return;
        };
        if let Err(e) = pool.accepted(connection) {
            warn!(uri = %acceptor.uri(), error = %e, "Failed to add accepted connection");
        }
    }

    fn error(&self, acceptor: Arc<dyn ManagedConnectionAcceptor>, error: ResourceError) {
        warn!(uri = %acceptor.uri(), error = %error, "Acceptor failed");
        if let Some(pool) = self.pool.upgrade() {
            if pool.remove_acceptor(&acceptor) {
                let _ = acceptor.close();
            }
        }
    }
}

/// The connection pool used for every registered factory.
#[derive(Clone)]
pub struct DefaultConnectionPool {
    shared: Arc<PoolShared>,
}

impl DefaultConnectionPool {
    /// Creates a pool over `factory`.
    ///
    /// Every connection gets `handler` for inbound invocations, wrapped so the
    /// invocation runs in a context that dials back through `resolver`.
    pub fn new(
        factory: Arc<dyn ManagedConnectionFactory>,
        handler: Arc<dyn InvocationHandler>,
        resolver: Weak<dyn ConnectionFactory>,
        config: PoolConfig,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                factory,
                handler,
                resolver,
                config,
                state: Mutex::new(PoolState::default()),
                reap_lock: Mutex::new(()),
                reaper: Mutex::new(None),
                caller_listener: RwLock::new(None),
                metrics: PoolMetrics::new(),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Reaping configuration of this pool.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Name of the factory this pool serves.
    pub fn connector(&self) -> &str {
        self.shared.factory.name()
    }

    /// Adds a connection produced by an acceptor. Accepted connections are never reaped.
    pub fn accepted(&self, connection: Arc<dyn ManagedConnection>) -> Result<Arc<dyn ManagedConnection>> {
        self.shared.accepted(connection)
    }

    /// Removes and destroys a pooled connection, notifying the caller listener.
    ///
    /// Accepts either the raw connection or the handle the pool handed out.
    /// Returns false if the connection is not pooled.
    pub fn remove(&self, connection: &Arc<dyn ManagedConnection>) -> bool {
        let id = self
            .shared
            .state
            .lock()
            .entries
            .iter()
            .find(|(_, entry)| entry.is(connection))
            .map(|(id, _)| *id);
        id.is_some_and(|id| self.shared.remove_id(id, true))
    }

    /// Number of pooled connections, outbound and accepted.
    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    /// True if the pool holds no connections.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True while background reaping tasks exist.
    pub fn is_reaper_running(&self) -> bool {
        self.shared
            .reaper
            .lock()
            .as_ref()
            .is_some_and(|daemon| !daemon.is_cancelled())
    }

    /// True once [`close`](ConnectionPool::close) was called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Runs one idle scan immediately.
    pub fn reap_idle(&self) {
        self.shared.reap_idle();
    }

    /// Runs one dead connection scan immediately.
    pub fn reap_dead(&self) {
        self.shared.reap_dead();
    }

    /// Snapshot of the pool's connections and counters.
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            connector: self.connector().to_string(),
            ..PoolStats::default()
        };
        {
            let state = self.shared.state.lock();
            for entry in state.entries.values() {
                match &entry.handle {
                    Some(handle) => {
                        stats.outbound_connections += 1;
                        stats.active_leases += handle.active_connections();
                    }
                    None => stats.accepted_connections += 1,
                }
            }
            stats.acceptors = state.acceptors.len();
        }
        self.shared.metrics.fill(&mut stats);
        stats
    }
}

#[async_trait]
impl ConnectionPool for DefaultConnectionPool {
    async fn create_managed_connection(
        &self,
        principal: Option<&Principal>,
        info: &ConnectionRequestInfo,
    ) -> Result<Arc<dyn ManagedConnection>> {
        if self.is_closed() {
            return Err(ResourceError::PoolClosed);
        }
        let connection = self
            .shared
            .factory
            .create_managed_connection(principal, info)
            .await?;
        self.shared.metrics.inc_connections_created();
        self.shared.add(connection, false)
    }

    fn match_managed_connections(
        &self,
        principal: Option<&Principal>,
        info: &ConnectionRequestInfo,
    ) -> Option<Arc<dyn ManagedConnection>> {
        let _reap = self.shared.reap_lock.lock();
        let (outbound, accepted): (Vec<_>, Vec<_>) = {
            let state = self.shared.state.lock();
            state
                .entries
                .values()
                .filter(|entry| entry.initialised)
                .map(|entry| (entry.exposed(), entry.handle.clone()))
                .partition(|(_, handle)| handle.is_some())
        };
        let candidates: Vec<_> = outbound.into_iter().chain(accepted).collect();
        let connections: Vec<Arc<dyn ManagedConnection>> =
            candidates.iter().map(|(exposed, _)| Arc::clone(exposed)).collect();

        let matched = self
            .shared
            .factory
            .match_managed_connections(&connections, principal, info)?;
        if let Some(handle) = candidates
            .iter()
            .find(|(exposed, _)| same_connection(exposed, &matched))
            .and_then(|(_, handle)| handle.as_ref())
        {
            handle.touch();
            trace!(connection = handle.id(), "Matched pooled connection");
        }
        Some(matched)
    }

    async fn create_managed_connection_acceptor(
        &self,
        authenticator: Arc<dyn Authenticator>,
        info: &ConnectionRequestInfo,
    ) -> Result<Arc<dyn ManagedConnectionAcceptor>> {
        if self.is_closed() {
            return Err(ResourceError::PoolClosed);
        }
        let acceptor = self
            .shared
            .factory
            .create_managed_connection_acceptor(authenticator, info)
            .await?;
        self.shared.state.lock().acceptors.push(Arc::clone(&acceptor));
        self.shared.metrics.inc_acceptors_created();

        let listener = Arc::new(PoolAcceptorListener {
            pool: Arc::downgrade(&self.shared),
        });
        if let Err(e) = acceptor.accept(listener) {
            warn!(uri = %acceptor.uri(), error = %e, "Failed to start accepting");
            self.shared.remove_acceptor(&acceptor);
            let _ = acceptor.close();
            return Err(e);
        }
        debug!(connector = self.connector(), uri = %acceptor.uri(), "Accepting connections");
        Ok(acceptor)
    }

    fn match_managed_connection_acceptors(
        &self,
        info: &ConnectionRequestInfo,
    ) -> Option<Arc<dyn ManagedConnectionAcceptor>> {
        let candidates = self.shared.state.lock().acceptors.clone();
        self.shared
            .factory
            .match_managed_connection_acceptors(&candidates, info)
    }

    fn set_caller_listener(&self, listener: Option<Arc<dyn CallerListener>>) {
        *self.shared.caller_listener.write() = listener;
    }

    fn close(&self) {
        let (acceptors, entries, daemon) = {
            let mut reaper = self.shared.reaper.lock();
            if self.shared.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            let mut state = self.shared.state.lock();
            (
                std::mem::take(&mut state.acceptors),
                std::mem::take(&mut state.entries),
                reaper.take(),
            )
        };

        for acceptor in acceptors {
            if let Err(e) = acceptor.close() {
                warn!(uri = %acceptor.uri(), error = %e, "Failed to close acceptor");
            }
        }
        for (id, entry) in entries {
            if let Err(e) = entry.connection.destroy() {
                warn!(connection = id, error = %e, "Failed to destroy connection");
            }
            self.shared.metrics.inc_connections_destroyed();
        }
        if let Some(daemon) = daemon {
            daemon.stop();
        }
        info!(connector = self.connector(), "Connection pool closed");
    }
}

impl fmt::Debug for DefaultConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultConnectionPool")
            .field("connector", &self.connector())
            .field("connections", &self.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
