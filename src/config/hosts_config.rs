use std::collections::BTreeSet;

use logos::Logos;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Error;

/// Upper bound on the body of a single chunked upload PATCH,
///
const DEFAULT_BLOB_CHUNK_SIZE: u64 = 1024 * 1024;

/// In-flight request limit per host, keeps the registry from throttling us,
///
const DEFAULT_CONCURRENT_REQUESTS: usize = 3;

/// Registry features a host can serve,
///
#[derive(Logos, Debug, Clone, Copy, PartialEq, PartialOrd, Ord, Eq)]
pub enum HostCapability {
    /// Resolve means the host can resolve a tag to a digest
    ///
    #[token("resolve")]
    Resolve,
    /// Push means that the host can push content to the registry
    ///
    #[token("push")]
    Push,
    /// Pull means that the host can pull content from a registry
    ///
    #[token("pull")]
    Pull,
    /// Unknown token
    ///
    #[error]
    #[regex(r"[ ,\t\n\f]+", logos::skip)]
    Error,
}

/// Struct that defines properties of one configured registry host,
///
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    /// Registry name requests reference, ex. registry.example.com
    name: String,
    /// Endpoints to try in priority order before the registry itself, each `host[:port]`
    #[serde(default)]
    mirrors: Vec<String>,
    /// If true, requests to this host go over plain http instead of https
    #[serde(default)]
    skip_verify: bool,
    /// Supported registry features this host can serve, ex. resolve, pull, push
    #[serde(default = "default_capabilities")]
    capabilities: Vec<String>,
    /// Largest body sent in one chunked upload PATCH
    #[serde(default = "default_blob_chunk_size")]
    blob_chunk_size: u64,
    /// In-flight request limit for this host
    #[serde(default = "default_concurrent_requests")]
    concurrent_requests: usize,
}

fn default_capabilities() -> Vec<String> {
    vec!["resolve".to_string(), "pull".to_string(), "push".to_string()]
}

fn default_blob_chunk_size() -> u64 {
    DEFAULT_BLOB_CHUNK_SIZE
}

fn default_concurrent_requests() -> usize {
    DEFAULT_CONCURRENT_REQUESTS
}

impl Host {
    /// Returns a new host config w/ defaults for the registry name,
    ///
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mirrors: vec![],
            skip_verify: false,
            capabilities: default_capabilities(),
            blob_chunk_size: DEFAULT_BLOB_CHUNK_SIZE,
            concurrent_requests: DEFAULT_CONCURRENT_REQUESTS,
        }
    }

    /// Adds a mirror endpoint, earlier mirrors are tried first, chainable
    ///
    pub fn add_mirror(mut self, endpoint: impl Into<String>) -> Self {
        self.mirrors.push(endpoint.into());
        self
    }

    /// Enables the skip_verify option to support http connections, chainable
    ///
    pub fn skip_verify(mut self) -> Self {
        self.skip_verify = true;
        self
    }

    /// Overrides the chunked upload body ceiling, chainable
    ///
    pub fn with_blob_chunk_size(mut self, size: u64) -> Self {
        self.blob_chunk_size = size;
        self
    }

    /// Overrides the in-flight request limit, chainable
    ///
    pub fn with_concurrent_requests(mut self, limit: usize) -> Self {
        self.concurrent_requests = limit.max(1);
        self
    }

    /// Replaces the capability list, chainable
    ///
    pub fn with_capabilities(mut self, capabilities: impl Into<String>) -> Self {
        let capabilities = capabilities.into();
        self.capabilities = capabilities
            .split(',')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        self
    }

    /// Returns the registry name this host serves,
    ///
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the url scheme requests to this host use,
    ///
    pub fn scheme(&self) -> &'static str {
        if self.skip_verify {
            "http"
        } else {
            "https"
        }
    }

    /// Returns every endpoint to try in priority order, the registry itself last,
    ///
    pub fn endpoints(&self) -> Vec<String> {
        let mut endpoints = self.mirrors.clone();
        endpoints.push(self.name.clone());
        endpoints
    }

    /// Returns the parsed capability set, unknown tokens are dropped w/ a warning,
    ///
    pub fn capability_set(&self) -> BTreeSet<HostCapability> {
        let mut set = BTreeSet::new();
        for entry in self.capabilities.iter() {
            for token in HostCapability::lexer(entry) {
                if let HostCapability::Error = token {
                    warn!("Unknown host capability in {entry}");
                } else {
                    set.insert(token);
                }
            }
        }
        set
    }

    /// Returns true when the host can serve the capability,
    ///
    pub fn can(&self, capability: HostCapability) -> bool {
        self.capability_set().contains(&capability)
    }

    /// Returns the chunked upload body ceiling,
    ///
    pub fn blob_chunk_size(&self) -> u64 {
        self.blob_chunk_size
    }

    /// Returns the in-flight request limit,
    ///
    pub fn concurrent_requests(&self) -> usize {
        self.concurrent_requests
    }
}

/// Collection of host configs, deserialized from a hosts.toml file,
///
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct HostsConfig {
    #[serde(default, rename = "host")]
    hosts: Vec<Host>,
}

impl HostsConfig {
    /// Returns an empty config,
    ///
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a host to the config, chainable
    ///
    pub fn add_host(mut self, host: Host) -> Self {
        self.hosts.push(host);
        self
    }

    /// Parses a hosts.toml document,
    ///
    pub fn from_toml(source: impl AsRef<str>) -> Result<Self, Error> {
        toml::from_str(source.as_ref())
            .map_err(|e| Error::parse_failure("could not parse hosts config").with_source(e))
    }

    /// Serializes the config back to toml,
    ///
    pub fn to_toml(&self) -> Result<String, Error> {
        toml::to_string(self)
            .map_err(|e| Error::parse_failure("could not serialize hosts config").with_source(e))
    }

    /// Looks up the config for a registry, falling back to defaults,
    ///
    pub fn host_for(&self, registry: impl AsRef<str>) -> Host {
        let registry = registry.as_ref();
        self.hosts
            .iter()
            .find(|h| h.name == registry)
            .cloned()
            .unwrap_or_else(|| Host::new(registry))
    }
}
