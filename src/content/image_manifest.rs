use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::Descriptor;

/// Struct for an image manifest,
///
/// The same shape serves the Docker schema 2 and OCI image manifest media
/// types, the media type field decides which tag the document carries.
///
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageManifest {
    /// Schema version of this manifest
    ///
    #[serde(rename = "schemaVersion")]
    pub schema_version: usize,
    /// Media type, one of the image manifest media types below
    ///
    /// The OCI form of the document may omit this on the wire, the parser
    /// then trusts the Content-Type it was handed.
    ///
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    /// Descriptor pointing to the config for this image,
    ///
    pub config: Descriptor,
    /// List of descriptors for each layer in the image
    ///
    pub layers: Vec<Descriptor>,
    /// Optional, labels
    ///
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// OCI image manifest media type,
///
pub const OCI1_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// Docker V2 manifest media type,
///
pub const DOCKER2_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// OCI image config media type,
///
pub const OCI1_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

/// Docker image config media type,
///
pub const DOCKER2_IMAGE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";

/// OCI gzipped layer media type,
///
pub const OCI1_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Docker gzipped layer media type,
///
pub const DOCKER2_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
