use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::Platform;

/// Annotation key binding a tag name to an index entry,
///
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Registry descriptor data layout
///
/// A descriptor is the atomic link in content-addressed storage: the bytes
/// fetched at `digest` hash back to `digest` and have length `size`.
///
/// Caveat: The content of a descriptor matters, once a client pushes a
/// descriptor to a registry, **no** fields may change, this will change the
/// effective content digest.
///
#[derive(Default, Clone, Deserialize, Serialize, Debug, PartialEq, Eq)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    #[serde(rename = "digest")]
    pub digest: String,
    #[serde(rename = "size")]
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "urls")]
    pub urls: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "annotations")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    /// Returns a new descriptor for plain content,
    ///
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>, size: u64) -> Self {
        Descriptor {
            media_type: media_type.into(),
            digest: digest.into(),
            size,
            urls: None,
            annotations: None,
            platform: None,
        }
    }

    /// Returns the tag bound to this descriptor through the ref name annotation,
    ///
    pub fn ref_name(&self) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_REF_NAME))
            .map(String::as_str)
    }

    /// Binds a tag to this descriptor through the ref name annotation,
    ///
    pub fn set_ref_name(&mut self, tag: impl Into<String>) {
        self.annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(ANNOTATION_REF_NAME.to_string(), tag.into());
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_serde_layout() {
        let json = json!({
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": "sha256:7a04484f0ab4dcdcca8ed5b2f4ae74b06afc80bab39c143783307cfa459516db",
            "size": 3356,
            "annotations": {
                "org.opencontainers.image.ref.name": "v1"
            }
        });

        let descriptor =
            serde_json::from_value::<Descriptor>(json).expect("should be able to deserialize");
        assert_eq!(descriptor.ref_name(), Some("v1"));
        assert_eq!(descriptor.size, 3356);

        // absent optional fields stay off the wire
        let out = serde_json::to_value(Descriptor::new("application/octet-stream", "sha256:0", 1))
            .expect("should serialize");
        assert!(out.get("annotations").is_none());
        assert!(out.get("platform").is_none());
    }

    #[test]
    fn test_set_ref_name_replaces() {
        let mut descriptor = Descriptor::new("application/octet-stream", "sha256:0", 1);
        descriptor.set_ref_name("v1");
        descriptor.set_ref_name("v2");
        assert_eq!(descriptor.ref_name(), Some("v2"));
    }
}
