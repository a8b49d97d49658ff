//! Top level connection manager.
//!
//! The manager owns one pool per registered managed connection factory and
//! routes connect and accept requests to the first registered factory that
//! supports the URI's scheme. It is itself a [`ConnectionFactory`], and it is
//! the factory placed into the invocation context, so a dial-back from inside
//! an inbound call can reach any registered transport.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};
use url::Url;

use crate::config::PoolConfig;
use crate::error::{ResourceError, Result};
use crate::factory::ConnectionFactory;
use crate::info::Properties;
use crate::invocation::{CallerListener, InvocationHandler};
use crate::managed::{Connection, ManagedConnectionFactory};
use crate::metrics::PoolStats;
use crate::pool::{ConnectionPool, DefaultConnectionPool};
use crate::security::{Authenticator, Principal};

struct Registration {
    connector: String,
    pool: DefaultConnectionPool,
    factory: Arc<dyn ConnectionFactory>,
}

/// Routes connections to registered transports and owns their pools.
pub struct ConnectionManager {
    this: Weak<ConnectionManager>,
    handler: Arc<dyn InvocationHandler>,
    authenticator: Arc<dyn Authenticator>,
    properties: Properties,
    registrations: RwLock<Vec<Registration>>,
    caller_listener: RwLock<Option<Arc<dyn CallerListener>>>,
    closed: AtomicBool,
}

impl ConnectionManager {
    /// Creates a manager.
    ///
    /// `handler` receives inbound invocations on every connection, `authenticator`
    /// admits peers on every acceptor, and `properties` holds the per connector
    /// pool configuration.
    pub fn new(
        handler: Arc<dyn InvocationHandler>,
        authenticator: Arc<dyn Authenticator>,
        properties: Properties,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            handler,
            authenticator,
            properties,
            registrations: RwLock::new(Vec::new()),
            caller_listener: RwLock::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Registers a transport, configuring its pool from the manager's properties
    /// under the factory's name.
    pub fn register(&self, factory: Arc<dyn ManagedConnectionFactory>) -> Result<()> {
        let config = PoolConfig::from_properties(&self.properties, factory.name())?;
        self.register_with_config(factory, config)
    }

    /// Registers a transport with an explicit pool configuration.
    pub fn register_with_config(
        &self,
        factory: Arc<dyn ManagedConnectionFactory>,
        config: PoolConfig,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(ResourceError::PoolClosed);
        }
        let connector = factory.name().to_string();
        let mut registrations = self.registrations.write();
        if registrations.iter().any(|r| r.connector == connector) {
            return Err(ResourceError::AlreadyRegistered("connection factory"));
        }

        let resolver: Weak<dyn ConnectionFactory> = self.this.clone();
        let pool = DefaultConnectionPool::new(
            Arc::clone(&factory),
            Arc::clone(&self.handler),
            resolver,
            config,
        );
        pool.set_caller_listener(self.caller_listener.read().clone());
        let external = factory.create_connection_factory(
            Arc::new(pool.clone()),
            Arc::clone(&self.authenticator),
        );

        info!(connector = %connector, config = ?pool.config(), "Registered connection factory");
        registrations.push(Registration {
            connector,
            pool,
            factory: external,
        });
        Ok(())
    }

    /// Installs the listener told about every disconnected caller on all pools,
    /// including pools registered later.
    pub fn set_caller_listener(&self, listener: Option<Arc<dyn CallerListener>>) {
        *self.caller_listener.write() = listener.clone();
        for registration in self.registrations.read().iter() {
            registration.pool.set_caller_listener(listener.clone());
        }
    }

    /// The pool serving `connector`, if registered.
    pub fn pool(&self, connector: &str) -> Option<DefaultConnectionPool> {
        self.registrations
            .read()
            .iter()
            .find(|r| r.connector == connector)
            .map(|r| r.pool.clone())
    }

    /// Names of the registered connectors in lookup order.
    pub fn connectors(&self) -> Vec<String> {
        self.registrations
            .read()
            .iter()
            .map(|r| r.connector.clone())
            .collect()
    }

    /// One snapshot per registered pool, in lookup order.
    pub fn stats(&self) -> Vec<PoolStats> {
        self.registrations
            .read()
            .iter()
            .map(|r| r.pool.stats())
            .collect()
    }

    /// True once the manager was closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn resolve(&self, select: impl Fn(&dyn ConnectionFactory) -> bool) -> Option<Arc<dyn ConnectionFactory>> {
        self.registrations
            .read()
            .iter()
            .find(|r| select(r.factory.as_ref()))
            .map(|r| Arc::clone(&r.factory))
    }
}

#[async_trait]
impl ConnectionFactory for ConnectionManager {
    fn can_connect(&self, uri: &Url) -> bool {
        self.resolve(|factory| factory.can_connect(uri)).is_some()
    }

    fn can_accept(&self, uri: &Url) -> bool {
        self.resolve(|factory| factory.can_accept(uri)).is_some()
    }

    async fn get_connection(
        &self,
        principal: Option<&Principal>,
        uri: &Url,
        properties: Option<&Properties>,
    ) -> Result<Arc<dyn Connection>> {
        if self.is_closed() {
            return Err(ResourceError::PoolClosed);
        }
        let factory = self
            .resolve(|factory| factory.can_connect(uri))
            .ok_or_else(|| ResourceError::NoConnectFactory {
                uri: uri.to_string(),
            })?;
        debug!(uri = %uri, principal = ?principal.map(Principal::name), "Getting connection");
        factory.get_connection(principal, uri, properties).await
    }

    async fn accept(&self, uri: &Url, properties: Option<&Properties>) -> Result<()> {
        if self.is_closed() {
            return Err(ResourceError::PoolClosed);
        }
        let factory = self
            .resolve(|factory| factory.can_accept(uri))
            .ok_or_else(|| ResourceError::NoAcceptFactory {
                uri: uri.to_string(),
            })?;
        factory.accept(uri, properties).await
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let registrations = std::mem::take(&mut *self.registrations.write());
        for registration in registrations {
            registration.factory.close();
            registration.pool.close();
        }
        info!("Connection manager closed");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        ConnectionFactory::close(self);
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connectors", &self.connectors())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
