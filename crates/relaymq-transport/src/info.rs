//! Connection request descriptors.
//!
//! A [`ConnectionRequestInfo`] identifies how to reach or accept a peer. Two
//! requests that compare equal may share one physical connection.

use std::collections::BTreeMap;
use std::fmt;

use url::Url;

use crate::error::{ResourceError, Result};
use crate::security::Principal;

/// Generic string property map used for connector configuration.
pub type Properties = BTreeMap<String, String>;

/// Immutable description of a connect or accept request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionRequestInfo {
    uri: Url,
    principal: Option<Principal>,
    properties: Properties,
}

impl ConnectionRequestInfo {
    /// Creates a request for `uri` with no principal and no properties.
    pub fn new(uri: Url) -> Self {
        Self {
            uri,
            principal: None,
            properties: Properties::new(),
        }
    }

    /// Parses `uri` and creates a request for it.
    pub fn parse(uri: &str) -> Result<Self> {
        Ok(Self::new(parse_uri(uri)?))
    }

    /// Attaches the principal the connection is opened under.
    pub fn with_principal(mut self, principal: Option<Principal>) -> Self {
        self.principal = principal;
        self
    }

    /// Attaches transport specific properties.
    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    /// The URI to connect to or listen on.
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// URI scheme, e.g. `vm` or `tcp`.
    pub fn scheme(&self) -> &str {
        self.uri.scheme()
    }

    /// Host component, if the URI has one.
    pub fn host(&self) -> Option<&str> {
        self.uri.host_str()
    }

    /// Port component, explicit or the scheme's well-known port.
    pub fn port(&self) -> Option<u16> {
        self.uri.port_or_known_default()
    }

    /// Principal the request is made for.
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    /// Transport properties of the request.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Looks up a single property.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

impl fmt::Display for ConnectionRequestInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.principal {
            Some(principal) => write!(f, "{}@{}", principal, self.uri),
            None => write!(f, "{}", self.uri),
        }
    }
}

/// Parses a transport URI, mapping failures to [`ResourceError::InvalidUri`].
pub fn parse_uri(uri: &str) -> Result<Url> {
    Url::parse(uri).map_err(|e| ResourceError::InvalidUri {
        uri: uri.to_string(),
        reason: e.to_string(),
    })
}
