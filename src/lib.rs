
mod content;
pub use content::Descriptor;
pub use content::ImageConfig;
pub use content::ImageIndex;
pub use content::ImageManifest;
pub use content::Manifest;
pub use content::Platform;
pub use content::ACCEPT_MANIFESTS;
pub use content::ANNOTATION_REF_NAME;
pub use content::DOCKER2_MANIFEST;
pub use content::DOCKER2_MANIFEST_LIST;
pub use content::OCI1_MANIFEST;
pub use content::OCI1_MANIFEST_LIST;

mod reference;
pub use reference::RefScheme;
pub use reference::Reference;
pub use reference::DEFAULT_TAG;

mod digest;
pub use digest::Algorithm;
pub use digest::Digest;
pub use digest::Digester;

mod error;
pub use error::Error;
pub use error::ErrorKind;

mod context;
pub use context::Context;

mod auth;
pub use auth::parse_www_authenticate;
pub use auth::Auth;
pub use auth::Challenge;

mod retry;
pub use retry::BodyReader;
pub use retry::RequestSpec;
pub use retry::Response;
pub use retry::Retryable;
pub use retry::RetryConfig;

mod scheme;
pub use scheme::BlobReader;
pub use scheme::BlobSource;
pub use scheme::Client;
pub use scheme::ClientBuilder;
pub use scheme::OciDirScheme;
pub use scheme::RegistryScheme;
pub use scheme::Scheme;

mod rwfs;
pub use rwfs::MemFs;
pub use rwfs::OsFs;
pub use rwfs::RwFs;

mod config;
pub use config::Credential;
pub use config::CredentialProvider;
pub use config::Host as RegistryHost;
pub use config::HostCapability;
pub use config::HostsConfig;
pub use config::StaticCredentials;
