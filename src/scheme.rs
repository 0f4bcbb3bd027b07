use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::{CredentialProvider, HostsConfig};
use crate::content::Manifest;
use crate::context::Context;
use crate::digest::{Digest, Digester};
use crate::error::Error;
use crate::reference::{RefScheme, Reference};
use crate::retry::RetryConfig;
use crate::rwfs::{OsFs, RwFs};

mod registry;
pub use registry::RegistryScheme;

mod ocidir;
pub use ocidir::OciDirScheme;

/// Buffer size for file-backed blob streams,
///
const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Bytes fed into a blob put,
///
/// A `Bytes` source can be replayed, which lets a chunked upload restart its
/// session after a mid-flight failure; a reader source streams once.
///
pub enum BlobSource {
    Bytes(Bytes),
    Reader {
        reader: Box<dyn AsyncRead + Send + Unpin>,
        length: Option<u64>,
    },
}

impl BlobSource {
    /// Wraps an in-memory blob,
    ///
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        BlobSource::Bytes(bytes.into())
    }

    /// Wraps a streaming reader w/ a length when known,
    ///
    pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static, length: Option<u64>) -> Self {
        BlobSource::Reader {
            reader: Box::new(reader),
            length,
        }
    }
}

/// Streaming blob body, consumed once,
///
/// Chunks feed a running digester when an expected digest is set; the final
/// chunk() returning None means the digest and length checked out.
///
pub struct BlobReader {
    inner: BlobReaderInner,
    length: u64,
}

impl std::fmt::Debug for BlobReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobReader")
            .field("length", &self.length)
            .finish()
    }
}

enum BlobReaderInner {
    Http(crate::retry::BodyReader),
    File {
        ctx: Context,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        digester: Option<Digester>,
        expect: Option<Digest>,
        received: u64,
        expect_length: u64,
        done: bool,
    },
}

impl BlobReader {
    pub(crate) fn from_http(reader: crate::retry::BodyReader, length: u64) -> Self {
        BlobReader {
            inner: BlobReaderInner::Http(reader),
            length,
        }
    }

    pub(crate) fn from_file(
        ctx: Context,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        expect: Option<Digest>,
        length: u64,
    ) -> Self {
        BlobReader {
            inner: BlobReaderInner::File {
                ctx,
                digester: expect.as_ref().map(|d| Digester::new(d.algorithm())),
                reader,
                expect,
                received: 0,
                expect_length: length,
                done: false,
            },
            length,
        }
    }

    /// Returns the blob length,
    ///
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Returns the next chunk, or None at a verified end of stream,
    ///
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, Error> {
        match &mut self.inner {
            BlobReaderInner::Http(reader) => reader.chunk().await,
            BlobReaderInner::File {
                ctx,
                reader,
                digester,
                expect,
                received,
                expect_length,
                done,
            } => {
                if *done {
                    return Ok(None);
                }
                ctx.err()?;
                let mut buf = vec![0u8; FILE_CHUNK_SIZE];
                let n = ctx.run(reader.read(&mut buf)).await??;
                if n == 0 {
                    *done = true;
                    if *received != *expect_length {
                        return Err(Error::size_mismatch(*expect_length, *received));
                    }
                    if let Some(expect) = expect.as_ref() {
                        let computed = digester
                            .take()
                            .expect("digester is set whenever a digest is expected")
                            .finalize();
                        if &computed != expect {
                            return Err(Error::digest_mismatch(expect, computed));
                        }
                    }
                    return Ok(None);
                }
                buf.truncate(n);
                *received += n as u64;
                if let Some(digester) = digester.as_mut() {
                    digester.update(&buf);
                }
                Ok(Some(Bytes::from(buf)))
            }
        }
    }

    /// Drains the remaining chunks into memory,
    ///
    pub async fn read_to_end(mut self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(self.length as usize);
        while let Some(bytes) = self.chunk().await? {
            out.extend_from_slice(&bytes);
        }
        Ok(out)
    }
}

/// The blob, manifest, and tag operations every backing store implements,
///
#[async_trait]
pub trait Scheme: Send + Sync {
    /// Checks a blob exists, returning its length,
    ///
    async fn blob_head(&self, ctx: &Context, r: &Reference, digest: &Digest)
        -> Result<u64, Error>;

    /// Opens a blob for verified streaming read,
    ///
    async fn blob_get(
        &self,
        ctx: &Context,
        r: &Reference,
        digest: &Digest,
    ) -> Result<BlobReader, Error>;

    /// Stores a blob, returning the digest and length actually written,
    ///
    /// The digest may be omitted, it is computed while streaming and
    /// returned; a supplied digest that does not match what streamed in is
    /// an error.
    ///
    async fn blob_put(
        &self,
        ctx: &Context,
        r: &Reference,
        digest: Option<Digest>,
        source: BlobSource,
    ) -> Result<(Digest, u64), Error>;

    /// Fetches manifest headers only, the returned manifest has no body,
    ///
    async fn manifest_head(&self, ctx: &Context, r: &Reference) -> Result<Manifest, Error>;

    /// Fetches and parses a manifest,
    ///
    async fn manifest_get(&self, ctx: &Context, r: &Reference) -> Result<Manifest, Error>;

    /// Stores a manifest under the reference's tag or digest,
    ///
    async fn manifest_put(
        &self,
        ctx: &Context,
        r: &Reference,
        manifest: &Manifest,
    ) -> Result<(), Error>;

    /// Deletes a manifest, the reference must carry a digest,
    ///
    async fn manifest_delete(&self, ctx: &Context, r: &Reference) -> Result<(), Error>;

    /// Lists the tags of a repository,
    ///
    async fn tag_list(&self, ctx: &Context, r: &Reference) -> Result<Vec<String>, Error>;
}

/// Client routes references to their backing scheme implementation,
///
pub struct Client {
    schemes: HashMap<&'static str, Arc<dyn Scheme>>,
}

impl Client {
    /// Returns a builder,
    ///
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Returns the scheme implementation a reference routes to,
    ///
    pub fn scheme_for(&self, r: &Reference) -> Result<Arc<dyn Scheme>, Error> {
        self.schemes
            .get(r.scheme().as_str())
            .cloned()
            .ok_or_else(|| {
                Error::invalid_reference(format!("no scheme registered for {}", r.scheme().as_str()))
            })
    }

    /// See [`Scheme::blob_head`],
    ///
    pub async fn blob_head(
        &self,
        ctx: &Context,
        r: &Reference,
        digest: &Digest,
    ) -> Result<u64, Error> {
        self.scheme_for(r)?.blob_head(ctx, r, digest).await
    }

    /// See [`Scheme::blob_get`],
    ///
    pub async fn blob_get(
        &self,
        ctx: &Context,
        r: &Reference,
        digest: &Digest,
    ) -> Result<BlobReader, Error> {
        self.scheme_for(r)?.blob_get(ctx, r, digest).await
    }

    /// See [`Scheme::blob_put`],
    ///
    pub async fn blob_put(
        &self,
        ctx: &Context,
        r: &Reference,
        digest: Option<Digest>,
        source: BlobSource,
    ) -> Result<(Digest, u64), Error> {
        self.scheme_for(r)?.blob_put(ctx, r, digest, source).await
    }

    /// See [`Scheme::manifest_head`],
    ///
    pub async fn manifest_head(&self, ctx: &Context, r: &Reference) -> Result<Manifest, Error> {
        self.scheme_for(r)?.manifest_head(ctx, r).await
    }

    /// See [`Scheme::manifest_get`],
    ///
    pub async fn manifest_get(&self, ctx: &Context, r: &Reference) -> Result<Manifest, Error> {
        self.scheme_for(r)?.manifest_get(ctx, r).await
    }

    /// See [`Scheme::manifest_put`],
    ///
    pub async fn manifest_put(
        &self,
        ctx: &Context,
        r: &Reference,
        manifest: &Manifest,
    ) -> Result<(), Error> {
        self.scheme_for(r)?.manifest_put(ctx, r, manifest).await
    }

    /// See [`Scheme::manifest_delete`],
    ///
    pub async fn manifest_delete(&self, ctx: &Context, r: &Reference) -> Result<(), Error> {
        self.scheme_for(r)?.manifest_delete(ctx, r).await
    }

    /// See [`Scheme::tag_list`],
    ///
    pub async fn tag_list(&self, ctx: &Context, r: &Reference) -> Result<Vec<String>, Error> {
        self.scheme_for(r)?.tag_list(ctx, r).await
    }
}

/// Builder assembling the client's schemes and their shared state,
///
pub struct ClientBuilder {
    hosts: HostsConfig,
    credentials: Option<Arc<dyn CredentialProvider>>,
    retry: RetryConfig,
    fs: Arc<dyn RwFs>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        ClientBuilder {
            hosts: HostsConfig::new(),
            credentials: None,
            retry: RetryConfig::default(),
            fs: Arc::new(OsFs),
        }
    }
}

impl ClientBuilder {
    /// Sets the hosts config, chainable
    ///
    pub fn with_hosts(mut self, hosts: HostsConfig) -> Self {
        self.hosts = hosts;
        self
    }

    /// Sets the credential provider, chainable
    ///
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Overrides retry tuning, chainable
    ///
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Replaces the filesystem the layout scheme uses, chainable
    ///
    pub fn with_fs(mut self, fs: Arc<dyn RwFs>) -> Self {
        self.fs = fs;
        self
    }

    /// Assembles the client,
    ///
    pub fn build(self) -> Client {
        let mut schemes: HashMap<&'static str, Arc<dyn Scheme>> = HashMap::new();
        schemes.insert(
            RefScheme::Registry.as_str(),
            Arc::new(RegistryScheme::new(self.hosts, self.credentials, self.retry)),
        );
        schemes.insert(
            RefScheme::OciDir.as_str(),
            Arc::new(OciDirScheme::new(self.fs)),
        );
        Client { schemes }
    }
}
