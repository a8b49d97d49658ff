//! Invocation context propagation.
//!
//! While an inbound invocation runs, the principal of the calling connection
//! and the factory able to dial back to the caller are pushed onto a
//! task-local stack. A remote reference materialized from the call's
//! arguments reads the top of the stack to open its own connection back to
//! the peer that sent it.
//!
//! The stack is task-local rather than thread-local so that it follows the
//! invocation across `.await` points. Entries are pushed for the lifetime of
//! a scope and popped on every exit path, including panics. Tasks spawned
//! from inside a scope start with an empty stack.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::warn;
use url::Url;

use crate::error::Result;
use crate::factory::ConnectionFactory;
use crate::invocation::{Invocation, InvocationHandler, Response};
use crate::managed::Connection;
use crate::security::Principal;

tokio::task_local! {
    static CONTEXT_STACK: Vec<ContextEntry>;
}

/// One frame of the invocation context.
#[derive(Clone)]
pub struct ContextEntry {
    principal: Option<Principal>,
    factory: Arc<dyn ConnectionFactory>,
}

impl ContextEntry {
    /// Principal the invocation arrived under.
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    /// Factory that dials back through the invoking manager.
    pub fn factory(&self) -> &Arc<dyn ConnectionFactory> {
        &self.factory
    }
}

impl fmt::Debug for ContextEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextEntry")
            .field("principal", &self.principal)
            .finish_non_exhaustive()
    }
}

/// Accessors for the current task's invocation context.
pub struct ConnectionContext;

impl ConnectionContext {
    /// Runs `future` with `(principal, factory)` pushed onto the context stack.
    pub async fn scope<F: Future>(
        principal: Option<Principal>,
        factory: Arc<dyn ConnectionFactory>,
        future: F,
    ) -> F::Output {
        CONTEXT_STACK
            .scope(Self::pushed(principal, factory), future)
            .await
    }

    /// Runs `f` with `(principal, factory)` pushed onto the context stack.
    pub fn sync_scope<R>(
        principal: Option<Principal>,
        factory: Arc<dyn ConnectionFactory>,
        f: impl FnOnce() -> R,
    ) -> R {
        CONTEXT_STACK.sync_scope(Self::pushed(principal, factory), f)
    }

    fn pushed(principal: Option<Principal>, factory: Arc<dyn ConnectionFactory>) -> Vec<ContextEntry> {
        let mut stack = CONTEXT_STACK.try_with(|stack| stack.clone()).unwrap_or_default();
        stack.push(ContextEntry { principal, factory });
        stack
    }

    /// Number of nested invocation contexts active on this task.
    pub fn depth() -> usize {
        CONTEXT_STACK.try_with(Vec::len).unwrap_or(0)
    }

    /// The innermost context entry.
    pub fn current() -> Option<ContextEntry> {
        CONTEXT_STACK
            .try_with(|stack| stack.last().cloned())
            .ok()
            .flatten()
    }

    /// Principal of the innermost invocation.
    pub fn principal() -> Option<Principal> {
        Self::current().and_then(|entry| entry.principal)
    }

    /// Factory of the innermost invocation.
    pub fn connection_factory() -> Option<Arc<dyn ConnectionFactory>> {
        Self::current().map(|entry| entry.factory)
    }

    /// Opens a connection to `uri` using the innermost context.
    ///
    /// Returns `Ok(None)` outside of any invocation.
    pub async fn get_connection(uri: &Url) -> Result<Option<Arc<dyn Connection>>> {
        let Some(entry) = Self::current() else {
            return Ok(None);
        };
        entry
            .factory
            .get_connection(entry.principal.as_ref(), uri, None)
            .await
            .map(Some)
    }
}

/// Wraps an invocation handler so each invocation runs inside a context scope.
pub struct ContextInvocationHandler {
    handler: Arc<dyn InvocationHandler>,
    resolver: Weak<dyn ConnectionFactory>,
    principal: Option<Principal>,
}

impl ContextInvocationHandler {
    /// `principal` is the identity of the connection the handler is attached to;
    /// `resolver` opens connections back to the caller.
    pub fn new(
        handler: Arc<dyn InvocationHandler>,
        resolver: Weak<dyn ConnectionFactory>,
        principal: Option<Principal>,
    ) -> Self {
        Self {
            handler,
            resolver,
            principal,
        }
    }
}

#[async_trait]
impl InvocationHandler for ContextInvocationHandler {
    async fn invoke(&self, invocation: Invocation) -> Response {
        match self.resolver.upgrade() {
            Some(factory) => {
                ConnectionContext::scope(
                    self.principal.clone(),
                    factory,
                    self.handler.invoke(invocation),
                )
                .await
            }
            None => {
                warn!(caller = %invocation.caller(), "Connection resolver dropped, invoking without context");
                self.handler.invoke(invocation).await
            }
        }
    }
}
