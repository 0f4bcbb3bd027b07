
mod descriptor;
pub use descriptor::Descriptor;
pub use descriptor::ANNOTATION_REF_NAME;

mod platform;
pub use platform::Platform;

mod image_manifest;
pub use image_manifest::ImageManifest;
pub use image_manifest::DOCKER2_IMAGE_CONFIG;
pub use image_manifest::DOCKER2_LAYER_GZIP;
pub use image_manifest::DOCKER2_MANIFEST;
pub use image_manifest::OCI1_IMAGE_CONFIG;
pub use image_manifest::OCI1_LAYER_GZIP;
pub use image_manifest::OCI1_MANIFEST;

mod image_index;
pub use image_index::ImageIndex;
pub use image_index::DOCKER2_MANIFEST_LIST;
pub use image_index::INDEX_SCHEMA_VERSION;
pub use image_index::OCI1_MANIFEST_LIST;

mod image_config;
pub use image_config::ImageConfig;

mod manifest;
pub use manifest::Manifest;
pub use manifest::ACCEPT_MANIFESTS;
