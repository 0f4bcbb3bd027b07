use std::collections::HashMap;

use async_trait::async_trait;

/// Username and password pair for one registry host,
///
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    /// Returns a new credential,
    ///
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credential {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Source of credentials for registry hosts,
///
/// Credential discovery (docker config files, helpers) lives outside this
/// crate; the auth engine only asks this trait.
///
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Returns the credential for a host, if one is known,
    ///
    async fn credential(&self, host: &str) -> Option<Credential>;
}

/// Fixed in-memory credential table, the provider tests and embedders use,
///
#[derive(Debug, Default)]
pub struct StaticCredentials {
    entries: HashMap<String, Credential>,
}

impl StaticCredentials {
    /// Returns an empty table,
    ///
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a credential for a host, chainable
    ///
    pub fn with(mut self, host: impl Into<String>, credential: Credential) -> Self {
        self.entries.insert(host.into(), credential);
        self
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credential(&self, host: &str) -> Option<Credential> {
        self.entries.get(host).cloned()
    }
}
