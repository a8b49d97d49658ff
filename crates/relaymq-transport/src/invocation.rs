//! Invocation payload abstraction.
//!
//! A [`Request`] names a target object and method and carries encoded
//! arguments. Argument decoding is left to the dispatcher that implements
//! [`InvocationHandler`], which runs inside the invocation context so that
//! remote references materialized from the arguments can dial back.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

/// A remote method call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Identifier of the exported object the call targets.
    pub object_id: String,
    /// Method name on the target object.
    pub method: String,
    /// Encoded call arguments.
    pub args: Bytes,
}

impl Request {
    /// Creates a new request.
    pub fn new(object_id: impl Into<String>, method: impl Into<String>, args: impl Into<Bytes>) -> Self {
        Self {
            object_id: object_id.into(),
            method: method.into(),
            args: args.into(),
        }
    }
}

/// The outcome of a remote method call: an encoded result or a fault message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    outcome: std::result::Result<Bytes, String>,
}

impl Response {
    /// A successful response.
    pub fn value(value: impl Into<Bytes>) -> Self {
        Self {
            outcome: Ok(value.into()),
        }
    }

    /// A failed response.
    pub fn fault(message: impl Into<String>) -> Self {
        Self {
            outcome: Err(message.into()),
        }
    }

    /// Returns true if the call failed.
    pub fn is_fault(&self) -> bool {
        self.outcome.is_err()
    }

    /// The encoded result, if the call succeeded.
    pub fn result(&self) -> Option<&Bytes> {
        self.outcome.as_ref().ok()
    }

    /// The fault message, if the call failed.
    pub fn fault_message(&self) -> Option<&str> {
        self.outcome.as_ref().err().map(String::as_str)
    }

    /// Consumes the response.
    pub fn into_result(self) -> std::result::Result<Bytes, String> {
        self.outcome
    }
}

/// The two ends of a connection as seen from the side handling a call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Caller {
    /// URI of the peer that issued the call.
    pub remote_uri: Url,
    /// URI of the local end that received it.
    pub local_uri: Url,
}

impl Caller {
    /// Describes a peer at `remote_uri` talking to `local_uri`.
    pub fn new(remote_uri: Url, local_uri: Url) -> Self {
        Self {
            remote_uri,
            local_uri,
        }
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.remote_uri, self.local_uri)
    }
}

/// One inbound request/response round trip.
#[derive(Debug, Clone)]
pub struct Invocation {
    request: Request,
    caller: Caller,
}

impl Invocation {
    /// Pairs a request with the peer that sent it.
    pub fn new(request: Request, caller: Caller) -> Self {
        Self { request, caller }
    }

    /// The request being dispatched.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The peer that sent the request.
    pub fn caller(&self) -> &Caller {
        &self.caller
    }

    /// Consumes the invocation, returning its request.
    pub fn into_request(self) -> Request {
        self.request
    }
}

/// Dispatches inbound invocations to exported objects.
#[async_trait]
pub trait InvocationHandler: Send + Sync {
    /// Handles one invocation and produces its response.
    async fn invoke(&self, invocation: Invocation) -> Response;
}

/// Observes connections that go away.
pub trait CallerListener: Send + Sync {
    /// Called once the connection between the two URIs has been destroyed.
    fn disconnected(&self, caller: &Caller);
}

/// Broadcasts disconnection notifications to every registered listener.
#[derive(Default)]
pub struct MulticastCallerListener {
    listeners: RwLock<Vec<Arc<dyn CallerListener>>>,
}

impl MulticastCallerListener {
    /// Creates an empty multicast listener.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener.
    pub fn add_caller_listener(&self, listener: Arc<dyn CallerListener>) {
        self.listeners.write().push(listener);
    }

    /// Deregisters a listener. Returns false if it was not registered.
    pub fn remove_caller_listener(&self, listener: &Arc<dyn CallerListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// True if no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CallerListener for MulticastCallerListener {
    fn disconnected(&self, caller: &Caller) {
        let listeners = self.listeners.read().clone();
        debug!(caller = %caller, listeners = listeners.len(), "Broadcasting disconnect");
        for listener in listeners {
            listener.disconnected(caller);
        }
    }
}

impl fmt::Debug for MulticastCallerListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MulticastCallerListener")
            .field("listeners", &self.len())
            .finish()
    }
}
