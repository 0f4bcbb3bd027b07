use tracing::warn;

use crate::digest::Digest;
use crate::error::Error;

use super::{
    Descriptor, ImageIndex, ImageManifest, Platform, DOCKER2_MANIFEST, DOCKER2_MANIFEST_LIST,
    OCI1_MANIFEST, OCI1_MANIFEST_LIST,
};

/// Media types sent in the Accept header of every manifest request,
///
pub const ACCEPT_MANIFESTS: [&str; 4] = [
    DOCKER2_MANIFEST,
    DOCKER2_MANIFEST_LIST,
    OCI1_MANIFEST,
    OCI1_MANIFEST_LIST,
];

#[derive(Debug, Clone)]
enum Variant {
    Image(ImageManifest),
    List(ImageIndex),
}

/// Manifest abstracts the supported manifest media types behind one document,
///
/// Two shapes cover the four media types: image manifests (Docker schema 2
/// and OCI) and manifest lists (Docker list and OCI index). The bytes the
/// document was decoded from are preserved verbatim so the digest stays
/// stable through round-trips; a caller-constructed document serializes once
/// at construction and keeps that output as its body.
///
#[derive(Debug, Clone)]
pub struct Manifest {
    media_type: String,
    digest: Digest,
    raw: Vec<u8>,
    variant: Option<Variant>,
}

impl Manifest {
    /// Parses a manifest body, dispatching on the media type it arrived under,
    ///
    pub fn from_bytes(media_type: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Result<Self, Error> {
        let media_type = media_type.into();
        let raw = bytes.into();

        let variant = match media_type.as_str() {
            DOCKER2_MANIFEST | OCI1_MANIFEST => {
                Variant::Image(serde_json::from_slice(&raw)?)
            }
            DOCKER2_MANIFEST_LIST | OCI1_MANIFEST_LIST => {
                Variant::List(serde_json::from_slice(&raw)?)
            }
            other => {
                warn!("Unsupported media type for manifest, {other}");
                return Err(Error::unsupported_media_type(other));
            }
        };

        Ok(Manifest {
            digest: Digest::canonical(&raw),
            media_type,
            raw,
            variant: Some(variant),
        })
    }

    /// Wraps a caller-constructed image manifest,
    ///
    /// An empty media type defaults to the OCI image manifest type. The body
    /// becomes the canonical serialization computed here.
    ///
    pub fn from_image(mut image: ImageManifest) -> Result<Self, Error> {
        if image.media_type.is_empty() {
            image.media_type = OCI1_MANIFEST.to_string();
        }
        match image.media_type.as_str() {
            DOCKER2_MANIFEST | OCI1_MANIFEST => {}
            other => return Err(Error::unsupported_media_type(other)),
        }
        let raw = serde_json::to_vec(&image)?;
        Ok(Manifest {
            digest: Digest::canonical(&raw),
            media_type: image.media_type.clone(),
            raw,
            variant: Some(Variant::Image(image)),
        })
    }

    /// Wraps a caller-constructed manifest list,
    ///
    pub fn from_index(mut index: ImageIndex) -> Result<Self, Error> {
        if index.media_type.is_empty() {
            index.media_type = OCI1_MANIFEST_LIST.to_string();
        }
        match index.media_type.as_str() {
            DOCKER2_MANIFEST_LIST | OCI1_MANIFEST_LIST => {}
            other => return Err(Error::unsupported_media_type(other)),
        }
        let raw = serde_json::to_vec(&index)?;
        Ok(Manifest {
            digest: Digest::canonical(&raw),
            media_type: index.media_type.clone(),
            raw,
            variant: Some(Variant::List(index)),
        })
    }

    /// Builds an unpopulated manifest from response headers, as a HEAD request returns,
    ///
    pub fn from_head(media_type: impl Into<String>, digest: Digest) -> Self {
        Manifest {
            media_type: media_type.into(),
            digest,
            raw: Vec::new(),
            variant: None,
        }
    }

    /// Returns the media type tag,
    ///
    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Returns the digest over the bytes `to_bytes` returns,
    ///
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Returns the body length,
    ///
    pub fn size(&self) -> u64 {
        self.raw.len() as u64
    }

    /// Returns true when the body has been populated,
    ///
    pub fn is_populated(&self) -> bool {
        self.variant.is_some()
    }

    /// Returns true for the manifest list variants,
    ///
    pub fn is_list(&self) -> bool {
        matches!(
            self.media_type.as_str(),
            DOCKER2_MANIFEST_LIST | OCI1_MANIFEST_LIST
        )
    }

    /// Returns the config descriptor of an image manifest,
    ///
    pub fn config(&self) -> Result<&Descriptor, Error> {
        match self.variant()? {
            Variant::Image(image) => Ok(&image.config),
            Variant::List(_) => Err(Error::unsupported_media_type(&self.media_type)),
        }
    }

    /// Returns the layer descriptors of an image manifest,
    ///
    pub fn layers(&self) -> Result<&[Descriptor], Error> {
        match self.variant()? {
            Variant::Image(image) => Ok(&image.layers),
            Variant::List(_) => Err(Error::unsupported_media_type(&self.media_type)),
        }
    }

    /// Returns the entries of a manifest list,
    ///
    pub fn manifests(&self) -> Result<&[Descriptor], Error> {
        match self.variant()? {
            Variant::List(index) => Ok(&index.manifests),
            Variant::Image(_) => Err(Error::unsupported_media_type(&self.media_type)),
        }
    }

    /// Returns the first list entry whose platform satisfies the wanted platform,
    ///
    /// Entries without a platform never match. A miss on a list is
    /// `NotFound`; asking an image manifest is `UnsupportedMediaType`.
    ///
    pub fn platform_descriptor(&self, wanted: &Platform) -> Result<&Descriptor, Error> {
        let entries = self.manifests()?;
        entries
            .iter()
            .find(|d| d.platform.as_ref().map(|p| p.matches(wanted)).unwrap_or(false))
            .ok_or_else(|| Error::not_found(format!("no entry for platform {wanted}")))
    }

    /// Returns the body, the preserved bytes when the document was parsed,
    ///
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        if self.variant.is_none() {
            return Err(Error::new(crate::error::ErrorKind::Unavailable)
                .with_message("manifest body is not populated, perform a manifest get first"));
        }
        Ok(self.raw.clone())
    }

    /// Returns a descriptor naming this manifest,
    ///
    pub fn descriptor(&self) -> Descriptor {
        Descriptor::new(&self.media_type, self.digest.to_string(), self.size())
    }

    fn variant(&self) -> Result<&Variant, Error> {
        self.variant.as_ref().ok_or_else(|| {
            Error::new(crate::error::ErrorKind::Unavailable)
                .with_message("manifest body is not populated, perform a manifest get first")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const IMAGE_BODY: &str = r#"{
  "schemaVersion": 2,
  "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
  "config": {
    "mediaType": "application/vnd.docker.container.image.v1+json",
    "digest": "sha256:b5b2b2c507a0944348e0303114d8d93aaaa081732b86451d9bce1f432a537bc7",
    "size": 7023
  },
  "layers": [
    {
      "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
      "digest": "sha256:e692418e4cbaf90ca69d05a66403747baa33ee08806650b51fab815ad7fc331f",
      "size": 32654
    }
  ]
}"#;

    const LIST_BODY: &str = r#"{
  "schemaVersion": 2,
  "mediaType": "application/vnd.oci.image.index.v1+json",
  "manifests": [
    {
      "mediaType": "application/vnd.oci.image.manifest.v1+json",
      "digest": "sha256:e692418e4cbaf90ca69d05a66403747baa33ee08806650b51fab815ad7fc331f",
      "size": 7143,
      "platform": {"architecture": "amd64", "os": "linux"}
    },
    {
      "mediaType": "application/vnd.oci.image.manifest.v1+json",
      "digest": "sha256:5b0bcabd1ed22e9fb1310cf6c2dec7cdef19f0ad69efa1f392e94a4333501270",
      "size": 7682,
      "platform": {"architecture": "arm64", "os": "linux", "variant": "v8"}
    }
  ]
}"#;

    #[test]
    fn test_raw_bytes_survive_roundtrip() {
        let m = Manifest::from_bytes(DOCKER2_MANIFEST, IMAGE_BODY.as_bytes().to_vec())
            .expect("should parse");
        let out = m.to_bytes().expect("should marshal");
        assert_eq!(out, IMAGE_BODY.as_bytes());

        let reparsed = Manifest::from_bytes(m.media_type(), out).expect("should reparse");
        assert_eq!(reparsed.digest(), m.digest());
    }

    #[test]
    fn test_variant_accessors() {
        let m = Manifest::from_bytes(DOCKER2_MANIFEST, IMAGE_BODY.as_bytes().to_vec())
            .expect("should parse");
        assert!(!m.is_list());
        assert_eq!(m.layers().expect("should have layers").len(), 1);
        assert!(m
            .config()
            .expect("should have config")
            .digest
            .starts_with("sha256:b5b2"));
        assert!(m
            .manifests()
            .expect_err("image has no entries")
            .is(ErrorKind::UnsupportedMediaType));

        let l = Manifest::from_bytes(OCI1_MANIFEST_LIST, LIST_BODY.as_bytes().to_vec())
            .expect("should parse");
        assert!(l.is_list());
        assert_eq!(l.manifests().expect("should have entries").len(), 2);
        assert!(l
            .config()
            .expect_err("list has no config")
            .is(ErrorKind::UnsupportedMediaType));
        assert!(l
            .layers()
            .expect_err("list has no layers")
            .is(ErrorKind::UnsupportedMediaType));
    }

    #[test]
    fn test_platform_selection() {
        let l = Manifest::from_bytes(OCI1_MANIFEST_LIST, LIST_BODY.as_bytes().to_vec())
            .expect("should parse");

        let d = l
            .platform_descriptor(&Platform::new("arm64", "linux"))
            .expect("variant-less caller matches the v8 entry");
        assert!(d.digest.starts_with("sha256:5b0b"));

        let err = l
            .platform_descriptor(&Platform::new("riscv64", "linux"))
            .expect_err("no such platform");
        assert!(err.is(ErrorKind::NotFound), "a platform miss is NotFound");
    }

    #[test]
    fn test_unknown_media_type() {
        let err = Manifest::from_bytes("application/vnd.example.unknown+json", b"{}".to_vec())
            .expect_err("should reject");
        assert!(err.is(ErrorKind::UnsupportedMediaType));
    }

    #[test]
    fn test_constructed_manifest_digest() {
        let mut image = ImageManifest {
            schema_version: 2,
            media_type: String::new(),
            config: Descriptor::new(
                super::super::OCI1_IMAGE_CONFIG,
                "sha256:b5b2b2c507a0944348e0303114d8d93aaaa081732b86451d9bce1f432a537bc7",
                7023,
            ),
            layers: vec![],
            annotations: None,
        };
        image.layers.push(Descriptor::new(
            super::super::OCI1_LAYER_GZIP,
            "sha256:e692418e4cbaf90ca69d05a66403747baa33ee08806650b51fab815ad7fc331f",
            32654,
        ));

        let m = Manifest::from_image(image).expect("should build");
        assert_eq!(m.media_type(), OCI1_MANIFEST, "empty media type defaults");

        let body = m.to_bytes().expect("should marshal");
        assert_eq!(m.digest(), &Digest::canonical(&body));

        let reparsed = Manifest::from_bytes(m.media_type(), body).expect("should reparse");
        assert_eq!(reparsed.digest(), m.digest());
    }

    #[test]
    fn test_head_manifest_is_unpopulated() {
        let digest = Digest::canonical(IMAGE_BODY.as_bytes());
        let m = Manifest::from_head(DOCKER2_MANIFEST, digest.clone());
        assert!(!m.is_populated());
        assert_eq!(m.digest(), &digest);
        assert!(m.to_bytes().expect_err("no body").is(ErrorKind::Unavailable));
        assert!(m.config().expect_err("no body").is(ErrorKind::Unavailable));
    }
}
