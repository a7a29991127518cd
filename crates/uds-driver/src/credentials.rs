//! Caller credential lookup.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::message::Endpoint;

/// Errors from a credential resolver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, miette::Diagnostic)]
pub enum CredentialError {
    /// The endpoint does not name a live process.
    #[error("unknown endpoint: {endpoint}")]
    UnknownEndpoint { endpoint: i32 },
}

/// Process credentials (the `ucred` triple).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

/// Maps a caller endpoint to its credentials.
pub trait CredentialResolver {
    fn resolve(&self, endpoint: Endpoint) -> Result<Credentials, CredentialError>;
}

/// Fixed credential table with an optional fallback identity.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    entries: HashMap<Endpoint, Credentials>,
    fallback: Option<(u32, u32)>,
}

impl StaticCredentials {
    /// An empty table: every lookup fails.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve unknown endpoints to `uid`/`gid`, using the endpoint as pid.
    pub fn with_fallback(uid: u32, gid: u32) -> Self {
        Self {
            entries: HashMap::new(),
            fallback: Some((uid, gid)),
        }
    }

    /// Register credentials for an endpoint.
    pub fn insert(&mut self, endpoint: Endpoint, credentials: Credentials) {
        self.entries.insert(endpoint, credentials);
    }

    /// Forget an endpoint, as when its process exits.
    pub fn remove(&mut self, endpoint: Endpoint) -> Option<Credentials> {
        self.entries.remove(&endpoint)
    }
}

impl CredentialResolver for StaticCredentials {
    fn resolve(&self, endpoint: Endpoint) -> Result<Credentials, CredentialError> {
        if let Some(creds) = self.entries.get(&endpoint) {
            return Ok(*creds);
        }
        self.fallback
            .map(|(uid, gid)| Credentials {
                pid: endpoint.0,
                uid,
                gid,
            })
            .ok_or(CredentialError::UnknownEndpoint {
                endpoint: endpoint.0,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registered_endpoint() {
        let mut creds = StaticCredentials::new();
        let alice = Credentials {
            pid: 42,
            uid: 1000,
            gid: 100,
        };
        creds.insert(Endpoint(7), alice);
        assert_eq!(creds.resolve(Endpoint(7)).unwrap(), alice);
        assert_eq!(
            creds.resolve(Endpoint(8)).unwrap_err(),
            CredentialError::UnknownEndpoint { endpoint: 8 }
        );
    }

    #[test]
    fn test_fallback_uses_endpoint_as_pid() {
        let creds = StaticCredentials::with_fallback(0, 0);
        let resolved = creds.resolve(Endpoint(31)).unwrap();
        assert_eq!(resolved.pid, 31);
        assert_eq!(resolved.uid, 0);
    }
}
