mod hosts_config;
pub use hosts_config::Host;
pub use hosts_config::HostCapability;
pub use hosts_config::HostsConfig;

mod credentials;
pub use credentials::Credential;
pub use credentials::CredentialProvider;
pub use credentials::StaticCredentials;
