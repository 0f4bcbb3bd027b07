use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::Descriptor;

/// Struct for a manifest list or image index,
///
/// The same shape serves the Docker manifest list and OCI index media types.
///
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageIndex {
    /// Schema version of this manifest
    ///
    #[serde(rename = "schemaVersion")]
    pub schema_version: usize,
    /// Media type, one of the list media types below
    ///
    /// The OCI form of the document may omit this on the wire, the parser
    /// then trusts the Content-Type it was handed.
    ///
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    /// List of manifests contained within this index
    ///
    pub manifests: Vec<Descriptor>,
    /// Optional, labels
    ///
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Schema version carried by every supported manifest document,
///
pub const INDEX_SCHEMA_VERSION: usize = 2;

/// OCI image index media type,
///
pub const OCI1_MANIFEST_LIST: &str = "application/vnd.oci.image.index.v1+json";

/// Docker V2 manifest list media type,
///
pub const DOCKER2_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

impl ImageIndex {
    /// Returns an empty OCI index, the starting point of a layout's index.json,
    ///
    pub fn new() -> Self {
        ImageIndex {
            schema_version: INDEX_SCHEMA_VERSION,
            media_type: OCI1_MANIFEST_LIST.to_string(),
            manifests: Vec::new(),
            annotations: None,
        }
    }
}
