//! Principals and the authentication hook acceptors consult.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Identity a connection is opened under.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    name: String,
    password: Option<String>,
}

impl Principal {
    /// A principal without credentials.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: None,
        }
    }

    /// A principal with a password.
    pub fn with_password(name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: Some(password.into()),
        }
    }

    /// The principal's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The password, if one was given.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }
}

impl fmt::Debug for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Principal")
            .field("name", &self.name)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Credential check run by acceptors before a peer is admitted.
pub trait Authenticator: Send + Sync {
    /// Returns `Ok(true)` if the principal may connect.
    fn authenticate(&self, principal: Option<&Principal>) -> Result<bool>;
}

/// Admits every peer, authenticated or not.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _principal: Option<&Principal>) -> Result<bool> {
        Ok(true)
    }
}
