use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Runtime settings section of an image config,
///
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(rename = "User", skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(rename = "Env", skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(rename = "Entrypoint", skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(rename = "Labels", skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

/// Rootfs section of an image config,
///
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    pub diff_ids: Vec<String>,
}

/// One history row of an image config,
///
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct History {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub empty_layer: Option<bool>,
}

/// Image config document extracted from a config blob,
///
/// The body the config was decoded from is preserved so re-serialization
/// returns the same bytes the blob hashed to.
///
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub architecture: String,
    pub os: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<RuntimeConfig>,
    pub rootfs: RootFs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<History>>,
    #[serde(skip)]
    raw: Vec<u8>,
}

impl ImageConfig {
    /// Parses a pulled config blob,
    ///
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self, Error> {
        let raw = bytes.into();
        let mut config: ImageConfig = serde_json::from_slice(&raw)?;
        config.raw = raw;
        Ok(config)
    }

    /// Returns the body this config was decoded from, serializing when caller-constructed,
    ///
    pub fn raw_body(&self) -> Result<Vec<u8>, Error> {
        if !self.raw.is_empty() {
            return Ok(self.raw.clone());
        }
        Ok(serde_json::to_vec(self)?)
    }
}
