//! Reference counted handles over pooled outbound connections.
//!
//! A [`ManagedConnectionHandle`] wraps one outbound [`ManagedConnection`] and
//! counts the [`ConnectionLease`]s handed out over it. It also carries the
//! state both reapers inspect: the idle window that starts whenever the lease
//! count drops to zero, the `used` flag set by traffic, and the ping state of
//! the dead connection probe.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};
use url::Url;

use crate::error::{ResourceError, Result};
use crate::invocation::{InvocationHandler, Request, Response};
use crate::managed::{Connection, ManagedConnection, ManagedConnectionListener};
use crate::security::Principal;

/// Pool assigned identifier of a managed connection.
pub type ConnectionId = u64;

#[derive(Debug)]
struct Usage {
    active: usize,
    used: bool,
    idle_since: Option<Instant>,
    pinging: bool,
    ping_waits: u32,
}

/// Lease bookkeeping shared between a handle and its leases.
struct LeaseCounter {
    id: ConnectionId,
    usage: Mutex<Usage>,
    on_idle: Box<dyn Fn(ConnectionId) + Send + Sync>,
}

impl LeaseCounter {
    fn acquire(&self) {
        let mut usage = self.usage.lock();
        usage.active += 1;
        usage.idle_since = None;
    }

    fn release(&self) {
        let now_idle = {
            let mut usage = self.usage.lock();
            usage.active = usage.active.saturating_sub(1);
            if usage.active == 0 {
                usage.idle_since = Some(Instant::now());
                true
            } else {
                false
            }
        };
        if now_idle {
            debug!(connection = self.id, "Last lease released");
            (self.on_idle)(self.id);
        }
    }

    fn set_used(&self) {
        self.usage.lock().used = true;
    }
}

/// Reference counting wrapper over an outbound managed connection.
pub struct ManagedConnectionHandle {
    id: ConnectionId,
    connection: Arc<dyn ManagedConnection>,
    counter: Arc<LeaseCounter>,
}

impl ManagedConnectionHandle {
    /// Wraps `connection`. `on_idle` runs every time the lease count drops to zero.
    pub fn new(
        id: ConnectionId,
        connection: Arc<dyn ManagedConnection>,
        on_idle: impl Fn(ConnectionId) + Send + Sync + 'static,
    ) -> Self {
        Self {
            id,
            connection,
            counter: Arc::new(LeaseCounter {
                id,
                usage: Mutex::new(Usage {
                    active: 0,
                    used: false,
                    idle_since: Some(Instant::now()),
                    pinging: false,
                    ping_waits: 0,
                }),
                on_idle: Box::new(on_idle),
            }),
        }
    }

    /// Pool-local identifier of the connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The wrapped physical connection.
    pub fn managed_connection(&self) -> &Arc<dyn ManagedConnection> {
        &self.connection
    }

    /// Takes a new lease over the connection.
    pub fn lease(&self) -> Result<ConnectionLease> {
        let connection = self.connection.get_connection()?;
        Ok(ConnectionLease::new(
            self.id,
            connection,
            Arc::clone(&self.counter),
        ))
    }

    /// Number of leases currently outstanding.
    pub fn active_connections(&self) -> usize {
        self.counter.usage.lock().active
    }

    /// Records traffic on the connection.
    pub fn set_used(&self) {
        self.counter.set_used();
    }

    /// Forgets recorded traffic; called by the dead reaper each cycle.
    pub fn clear_used(&self) {
        self.counter.usage.lock().used = false;
    }

    /// True if traffic was recorded since the last [`clear_used`](Self::clear_used).
    pub fn used(&self) -> bool {
        self.counter.usage.lock().used
    }

    /// Restarts the idle window without taking a lease.
    pub fn touch(&self) {
        let mut usage = self.counter.usage.lock();
        if usage.active == 0 {
            usage.idle_since = Some(Instant::now());
        }
    }

    /// How long the connection has gone without leases, if it has none.
    pub fn idle_for(&self) -> Option<Duration> {
        let usage = self.counter.usage.lock();
        match (usage.active, usage.idle_since) {
            (0, Some(since)) => Some(since.elapsed()),
            _ => None,
        }
    }

    /// True if no lease is outstanding and none has been taken for `idle_period`.
    pub fn can_destroy(&self, idle_period: Duration) -> bool {
        self.idle_for().is_some_and(|idle| idle >= idle_period)
    }

    /// Sends a liveness probe and enters the pinging state.
    pub fn ping(&self) -> Result<()> {
        {
            let mut usage = self.counter.usage.lock();
            usage.pinging = true;
            usage.ping_waits = 0;
        }
        self.connection.ping()
    }

    /// True while a ping is outstanding.
    pub fn pinging(&self) -> bool {
        self.counter.usage.lock().pinging
    }

    /// Records a ping answer.
    pub fn pinged(&self) {
        let mut usage = self.counter.usage.lock();
        usage.pinging = false;
        usage.ping_waits = 0;
    }

    /// Records another reap cycle without a ping answer. Returns the new count.
    pub fn inc_ping_waits(&self) -> u32 {
        let mut usage = self.counter.usage.lock();
        usage.ping_waits += 1;
        usage.ping_waits
    }

    /// Reap cycles since the outstanding ping was sent.
    pub fn ping_waits(&self) -> u32 {
        self.counter.usage.lock().ping_waits
    }
}

impl ManagedConnection for ManagedConnectionHandle {
    fn set_invocation_handler(&self, handler: Arc<dyn InvocationHandler>) -> Result<()> {
        self.connection.set_invocation_handler(handler)
    }

    fn set_connection_event_listener(
        &self,
        listener: Arc<dyn ManagedConnectionListener>,
    ) -> Result<()> {
        self.connection.set_connection_event_listener(listener)
    }

    fn get_connection(&self) -> Result<Arc<dyn Connection>> {
        Ok(Arc::new(self.lease()?))
    }

    fn ping(&self) -> Result<()> {
        ManagedConnectionHandle::ping(self)
    }

    fn remote_uri(&self) -> Result<Url> {
        self.connection.remote_uri()
    }

    fn local_uri(&self) -> Result<Url> {
        self.connection.local_uri()
    }

    fn principal(&self) -> Option<Principal> {
        self.connection.principal()
    }

    fn destroy(&self) -> Result<()> {
        self.connection.destroy()
    }
}

impl fmt::Debug for ManagedConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let usage = self.counter.usage.lock();
        f.debug_struct("ManagedConnectionHandle")
            .field("id", &self.id)
            .field("active", &usage.active)
            .field("used", &usage.used)
            .field("pinging", &usage.pinging)
            .field("ping_waits", &usage.ping_waits)
            .finish()
    }
}

/// A caller's reference counted lease over a pooled connection.
///
/// The lease is released by [`Connection::close`] or when it is dropped,
/// whichever happens first. Releasing the last lease starts the idle window.
#[must_use = "dropping a lease releases it immediately"]
pub struct ConnectionLease {
    id: ConnectionId,
    connection: Arc<dyn Connection>,
    counter: Arc<LeaseCounter>,
    closed: AtomicBool,
}

impl ConnectionLease {
    fn new(id: ConnectionId, connection: Arc<dyn Connection>, counter: Arc<LeaseCounter>) -> Self {
        counter.acquire();
        Self {
            id,
            connection,
            counter,
            closed: AtomicBool::new(false),
        }
    }

    /// Identifier of the pooled connection this lease is over.
    pub fn connection_id(&self) -> ConnectionId {
        self.id
    }

    /// True once the lease was released.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn release(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.counter.release();
        true
    }
}

#[async_trait]
impl Connection for ConnectionLease {
    async fn invoke(&self, request: Request) -> Result<Response> {
        if self.is_closed() {
            return Err(ResourceError::ConnectionClosed);
        }
        self.counter.set_used();
        self.connection.invoke(request).await
    }

    fn close(&self) -> Result<()> {
        if self.release() {
            self.connection.close()?;
        }
        Ok(())
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if self.release() {
            trace!(connection = self.id, "Lease released on drop");
            let _ = self.connection.close();
        }
    }
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("connection", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
