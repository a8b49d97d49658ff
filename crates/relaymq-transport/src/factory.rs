//! Externally visible connection factories.
//!
//! A [`ConnectionFactory`] is what callers and the invocation context dial
//! through. The default implementation routes one set of URI schemes to one
//! [`ConnectionPool`], reusing a pooled connection when the protocol says one
//! matches and creating a new one otherwise.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::error::{ResourceError, Result};
use crate::info::{ConnectionRequestInfo, Properties};
use crate::managed::Connection;
use crate::pool::ConnectionPool;
use crate::security::{Authenticator, Principal};

/// Opens connections to, and accepts connections on, URIs.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// True if this factory can open connections to `uri`.
    fn can_connect(&self, uri: &Url) -> bool;

    /// True if this factory can accept connections on `uri`.
    fn can_accept(&self, uri: &Url) -> bool;

    /// Returns a lease over a connection to `uri`, reusing a pooled
    /// connection when one matches.
    async fn get_connection(
        &self,
        principal: Option<&Principal>,
        uri: &Url,
        properties: Option<&Properties>,
    ) -> Result<Arc<dyn Connection>>;

    /// Starts accepting connections on `uri`. Accepting twice on an
    /// equivalent URI is a no-op.
    async fn accept(&self, uri: &Url, properties: Option<&Properties>) -> Result<()>;

    /// Stops handing out connections and wakes callers waiting to allocate.
    fn close(&self);
}

type AllocationLocks = Mutex<HashMap<ConnectionRequestInfo, Arc<tokio::sync::Mutex<()>>>>;

/// Routes a fixed set of URI schemes to one connection pool.
pub struct DefaultConnectionFactory {
    schemes: BTreeSet<String>,
    pool: Arc<dyn ConnectionPool>,
    authenticator: Arc<dyn Authenticator>,
    allocations: AllocationLocks,
    closed: CancellationToken,
}

/// Claim on the allocation lock of one request. Dropping the last claim for a
/// request forgets its lock.
struct AllocationSlot<'a> {
    allocations: &'a AllocationLocks,
    info: ConnectionRequestInfo,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> AllocationSlot<'a> {
    fn claim(
        allocations: &'a AllocationLocks,
        info: &ConnectionRequestInfo,
    ) -> Self {
        let lock = Arc::clone(allocations.lock().entry(info.clone()).or_default());
        Self {
            allocations,
            info: info.clone(),
            lock,
        }
    }
}

impl Drop for AllocationSlot<'_> {
    fn drop(&mut self) {
        let mut allocations = self.allocations.lock();
        // One reference in the map, one here.
        if Arc::strong_count(&self.lock) == 2 {
            allocations.remove(&self.info);
        }
    }
}

impl DefaultConnectionFactory {
    /// Creates a factory serving `schemes` from `pool`. Schemes match case-insensitively.
    pub fn new<I, S>(
        schemes: I,
        pool: Arc<dyn ConnectionPool>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            schemes: schemes
                .into_iter()
                .map(|scheme| scheme.into().to_ascii_lowercase())
                .collect(),
            pool,
            authenticator,
            allocations: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        }
    }

    /// URI schemes served by this factory.
    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.schemes.iter().map(String::as_str)
    }

    /// True once [`close`](ConnectionFactory::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn supports(&self, uri: &Url) -> bool {
        self.schemes.contains(uri.scheme())
    }

    fn request_info(
        principal: Option<&Principal>,
        uri: &Url,
        properties: Option<&Properties>,
    ) -> ConnectionRequestInfo {
        let mut info = ConnectionRequestInfo::new(uri.clone()).with_principal(principal.cloned());
        if let Some(properties) = properties {
            info = info.with_properties(properties.clone());
        }
        info
    }

    /// Serializes match-or-create per request so identical requests share one
    /// connection. Unrelated requests proceed in parallel.
    async fn allocate<T>(
        &self,
        operation: &'static str,
        info: &ConnectionRequestInfo,
        f: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        if self.closed.is_cancelled() {
            return Err(ResourceError::PoolClosed);
        }
        let slot = AllocationSlot::claim(&self.allocations, info);
        let _guard = tokio::select! {
            biased;
            _ = self.closed.cancelled() => {
                return Err(ResourceError::Interrupted { operation });
            }
            guard = slot.lock.lock() => guard,
        };
        f.await
    }

    /// Number of requests currently allocating or waiting to.
    pub fn pending_allocations(&self) -> usize {
        self.allocations.lock().len()
    }
}

#[async_trait]
impl ConnectionFactory for DefaultConnectionFactory {
    fn can_connect(&self, uri: &Url) -> bool {
        self.supports(uri)
    }

    fn can_accept(&self, uri: &Url) -> bool {
        self.supports(uri)
    }

    async fn get_connection(
        &self,
        principal: Option<&Principal>,
        uri: &Url,
        properties: Option<&Properties>,
    ) -> Result<Arc<dyn Connection>> {
        if !self.supports(uri) {
            return Err(ResourceError::NoConnectFactory {
                uri: uri.to_string(),
            });
        }
        let info = Self::request_info(principal, uri, properties);
        self.allocate("allocating a connection", &info, async {
            let managed = match self.pool.match_managed_connections(principal, &info) {
                Some(managed) => managed,
                None => {
                    debug!(uri = %uri, "No pooled connection matched, creating one");
                    self.pool.create_managed_connection(principal, &info).await?
                }
            };
            managed.get_connection()
        })
        .await
    }

    async fn accept(&self, uri: &Url, properties: Option<&Properties>) -> Result<()> {
        if !self.supports(uri) {
            return Err(ResourceError::NoAcceptFactory {
                uri: uri.to_string(),
            });
        }
        let info = Self::request_info(None, uri, properties);
        self.allocate("creating an acceptor", &info, async {
            if self.pool.match_managed_connection_acceptors(&info).is_some() {
                debug!(uri = %uri, "Already accepting");
                return Ok(());
            }
            self.pool
                .create_managed_connection_acceptor(Arc::clone(&self.authenticator), &info)
                .await
                .map(|_| ())
        })
        .await
    }

    fn close(&self) {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            info!(schemes = ?self.schemes, "Connection factory closed");
        }
    }
}

impl fmt::Debug for DefaultConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultConnectionFactory")
            .field("schemes", &self.schemes)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
