use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hyper::{Method, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, event, warn, Level};

use crate::auth::Auth;
use crate::config::{CredentialProvider, Host, HostsConfig};
use crate::content::{Manifest, ACCEPT_MANIFESTS};
use crate::context::Context;
use crate::digest::{Algorithm, Digest, Digester};
use crate::error::{Error, ErrorKind};
use crate::reference::Reference;
use crate::retry::{RequestSpec, Response, Retryable, RetryConfig};
use crate::scheme::{BlobReader, BlobSource, Scheme, FILE_CHUNK_SIZE};

/// Session restarts allowed per chunked upload,
///
const MAX_SESSION_RESTARTS: usize = 1;

/// Scheme implementation speaking the distribution http api,
///
pub struct RegistryScheme {
    engine: Retryable,
    hosts: HostsConfig,
}

impl RegistryScheme {
    /// Returns a new registry scheme w/ its own retry engine and token cache,
    ///
    pub fn new(
        hosts: HostsConfig,
        credentials: Option<Arc<dyn CredentialProvider>>,
        retry: RetryConfig,
    ) -> Self {
        let auth = Arc::new(Auth::new(credentials));
        RegistryScheme {
            engine: Retryable::new(auth, retry),
            hosts,
        }
    }

    fn host_for(&self, r: &Reference) -> Result<Host, Error> {
        if r.registry().is_empty() {
            return Err(Error::invalid_reference(
                "the registry scheme requires an explicit registry host",
            ));
        }
        Ok(self.hosts.host_for(r.registry()))
    }

    fn spec(&self, method: Method, host: &Host, path: impl Into<String>) -> RequestSpec {
        RequestSpec::new(method, host.scheme(), host.endpoints(), path)
            .with_concurrency(host.concurrent_requests())
    }

    fn pull_scope(r: &Reference) -> String {
        format!("repository:{}:pull", r.repository())
    }

    fn push_scope(r: &Reference) -> String {
        format!("repository:{}:pull,push", r.repository())
    }

    /// Opens an upload session, optionally asking the registry to mount the digest,
    ///
    /// Returns the session location, or None when the mount was enough.
    ///
    async fn open_session(
        &self,
        ctx: &Context,
        host: &Host,
        r: &Reference,
        mount: Option<&Digest>,
    ) -> Result<Option<String>, Error> {
        let mut path = format!("/v2/{}/blobs/uploads/", r.repository());
        if let Some(digest) = mount {
            path.push_str(&format!("?mount={digest}"));
        }
        let base_path = path.clone();

        let response = self
            .engine
            .do_request(
                ctx,
                self.spec(Method::POST, host, path)
                    .with_scope(Self::push_scope(r)),
            )
            .await?;

        if response.status() == StatusCode::CREATED {
            debug!("Mount hit, blob is already present");
            return Ok(None);
        }

        let location = response
            .header("Location")
            .map(str::to_string)
            .ok_or_else(|| Error::parse_failure("upload session without a location header"))?;
        Ok(Some(resolve_location(&base_path, &location)))
    }

    /// Issues one upload request against a session location,
    ///
    async fn session_request(
        &self,
        ctx: &Context,
        host: &Host,
        r: &Reference,
        location: &str,
        method: Method,
        query: Option<String>,
        headers: Vec<(String, String)>,
        body: Option<Bytes>,
    ) -> Result<Response, Error> {
        let mut target = location.to_string();
        if let Some(query) = query {
            target.push(if target.contains('?') { '&' } else { '?' });
            target.push_str(&query);
        }

        let mut spec = if target.starts_with('/') {
            self.spec(method, host, target)
        } else {
            RequestSpec::from_url(method, target)?.with_concurrency(host.concurrent_requests())
        }
        .with_scope(Self::push_scope(r));
        for (name, value) in headers {
            spec = spec.with_header(name, value);
        }
        if let Some(body) = body {
            spec = spec.with_body(body);
        }
        self.engine.do_request(ctx, spec).await
    }

    /// Uploads a fully buffered blob,
    ///
    async fn put_bytes(
        &self,
        ctx: &Context,
        host: &Host,
        r: &Reference,
        digest: Option<Digest>,
        bytes: Bytes,
    ) -> Result<(Digest, u64), Error> {
        // the check runs under the caller's digest algorithm
        let computed = match digest.as_ref() {
            Some(digest) => Digest::from_bytes(digest.algorithm(), &bytes),
            None => Digest::canonical(&bytes),
        };
        let digest = match digest {
            Some(digest) if digest != computed => {
                return Err(Error::digest_mismatch(&digest, &computed))
            }
            Some(digest) => digest,
            None => computed,
        };
        let length = bytes.len() as u64;
        let chunk_size = host.blob_chunk_size();

        let mut restarts = 0usize;
        loop {
            ctx.err()?;
            let location = match self.open_session(ctx, host, r, Some(&digest)).await? {
                Some(location) => location,
                None => return Ok((digest, length)),
            };

            // a body no longer than one chunk goes up in a single put
            if length <= chunk_size {
                self.monolithic_put(ctx, host, r, &location, &digest, bytes.clone())
                    .await?;
                return Ok((digest, length));
            }

            match self
                .patch_chunks(ctx, host, r, location, &digest, &bytes, chunk_size)
                .await
            {
                Ok(()) => return Ok((digest, length)),
                Err(err) if restarts < MAX_SESSION_RESTARTS => {
                    restarts += 1;
                    warn!("Chunked upload failed, restarting the session, {err}");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn monolithic_put(
        &self,
        ctx: &Context,
        host: &Host,
        r: &Reference,
        location: &str,
        digest: &Digest,
        bytes: Bytes,
    ) -> Result<(), Error> {
        let response = self
            .session_request(
                ctx,
                host,
                r,
                location,
                Method::PUT,
                Some(format!("digest={digest}")),
                vec![(
                    "Content-Type".to_string(),
                    "application/octet-stream".to_string(),
                )],
                Some(bytes),
            )
            .await?;
        expect_status(&response, StatusCode::CREATED)
    }

    async fn patch_chunks(
        &self,
        ctx: &Context,
        host: &Host,
        r: &Reference,
        mut location: String,
        digest: &Digest,
        bytes: &Bytes,
        chunk_size: u64,
    ) -> Result<(), Error> {
        let mut start = 0usize;
        let chunk_size = chunk_size as usize;
        while start < bytes.len() {
            ctx.err()?;
            let end = (start + chunk_size).min(bytes.len());
            let response = self
                .session_request(
                    ctx,
                    host,
                    r,
                    &location,
                    Method::PATCH,
                    None,
                    vec![
                        ("Content-Range".to_string(), format!("{start}-{end}")),
                        (
                            "Content-Type".to_string(),
                            "application/octet-stream".to_string(),
                        ),
                    ],
                    Some(bytes.slice(start..end)),
                )
                .await?;
            expect_status(&response, StatusCode::ACCEPTED)?;
            location = next_location(&location, &response)?;
            start = end;
        }

        let response = self
            .session_request(
                ctx,
                host,
                r,
                &location,
                Method::PUT,
                Some(format!("digest={digest}")),
                vec![(
                    "Content-Type".to_string(),
                    "application/octet-stream".to_string(),
                )],
                None,
            )
            .await?;
        expect_status(&response, StatusCode::CREATED)
    }

    /// Spools a one-shot reader to a temp file, computing digest and length,
    ///
    /// The spool is removed when the handle drops, including on cancel.
    ///
    async fn spool_to_disk(
        &self,
        ctx: &Context,
        mut reader: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
        algorithm: Algorithm,
    ) -> Result<(tempfile::NamedTempFile, Digest, u64), Error> {
        let spool = tempfile::NamedTempFile::new()?;
        let mut file = tokio::fs::File::from_std(spool.reopen()?);
        let mut digester = Digester::new(algorithm);
        let mut length = 0u64;
        loop {
            ctx.err()?;
            let mut buf = vec![0u8; FILE_CHUNK_SIZE];
            let n = ctx.run(reader.read(&mut buf)).await??;
            if n == 0 {
                break;
            }
            buf.truncate(n);
            digester.update(&buf);
            length += n as u64;
            file.write_all(&buf).await?;
        }
        file.flush().await?;
        Ok((spool, digester.finalize(), length))
    }

    /// Uploads from a one-shot reader, digest and length known up front,
    ///
    async fn put_stream(
        &self,
        ctx: &Context,
        host: &Host,
        r: &Reference,
        digest: Digest,
        mut reader: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
        length: u64,
    ) -> Result<(Digest, u64), Error> {
        let mut location = match self.open_session(ctx, host, r, Some(&digest)).await? {
            Some(location) => location,
            None => return Ok((digest, length)),
        };

        let chunk_size = host.blob_chunk_size() as usize;
        let mut digester = Digester::new(digest.algorithm());
        let mut start = 0u64;

        while start < length {
            ctx.err()?;
            let want = chunk_size.min((length - start) as usize);
            let mut buf = vec![0u8; want];
            ctx.run(reader.read_exact(&mut buf))
                .await?
                .map_err(|e| Error::transport("blob source ended early").with_source(e))?;
            digester.update(&buf);
            let end = start + want as u64;

            let response = self
                .session_request(
                    ctx,
                    host,
                    r,
                    &location,
                    Method::PATCH,
                    None,
                    vec![
                        ("Content-Range".to_string(), format!("{start}-{end}")),
                        (
                            "Content-Type".to_string(),
                            "application/octet-stream".to_string(),
                        ),
                    ],
                    Some(Bytes::from(buf)),
                )
                .await?;
            expect_status(&response, StatusCode::ACCEPTED)?;
            location = next_location(&location, &response)?;
            start = end;
        }

        let computed = digester.finalize();
        if computed != digest {
            // leave the session uncommitted, it expires server-side
            return Err(Error::digest_mismatch(&digest, &computed));
        }

        let response = self
            .session_request(
                ctx,
                host,
                r,
                &location,
                Method::PUT,
                Some(format!("digest={digest}")),
                vec![(
                    "Content-Type".to_string(),
                    "application/octet-stream".to_string(),
                )],
                None,
            )
            .await?;
        expect_status(&response, StatusCode::CREATED)?;
        Ok((digest, length))
    }
}

#[async_trait]
impl Scheme for RegistryScheme {
    async fn blob_head(
        &self,
        ctx: &Context,
        r: &Reference,
        digest: &Digest,
    ) -> Result<u64, Error> {
        let host = self.host_for(r)?;
        let response = self
            .engine
            .do_request(
                ctx,
                self.spec(
                    Method::HEAD,
                    &host,
                    format!("/v2/{}/blobs/{digest}", r.repository()),
                )
                .with_scope(Self::pull_scope(r)),
            )
            .await?;
        Ok(content_length(&response).unwrap_or(0))
    }

    async fn blob_get(
        &self,
        ctx: &Context,
        r: &Reference,
        digest: &Digest,
    ) -> Result<BlobReader, Error> {
        let host = self.host_for(r)?;
        let response = self
            .engine
            .do_request(
                ctx,
                self.spec(
                    Method::GET,
                    &host,
                    format!("/v2/{}/blobs/{digest}", r.repository()),
                )
                .with_scope(Self::pull_scope(r))
                .with_expect_digest(digest.clone()),
            )
            .await?;

        if let Some(header) = response.header("Docker-Content-Digest") {
            if header != digest.to_string() {
                // the client-computed digest wins for blobs
                warn!(
                    "Registry digest header disagrees for blob, header {header}, requested {digest}"
                );
            }
        }

        let length = content_length(&response).unwrap_or(0);
        Ok(BlobReader::from_http(response.into_reader(), length))
    }

    async fn blob_put(
        &self,
        ctx: &Context,
        r: &Reference,
        digest: Option<Digest>,
        source: BlobSource,
    ) -> Result<(Digest, u64), Error> {
        let host = self.host_for(r)?;
        match source {
            BlobSource::Bytes(bytes) => self.put_bytes(ctx, &host, r, digest, bytes).await,
            BlobSource::Reader { reader, length } => match (digest, length) {
                (Some(digest), Some(length)) if length > host.blob_chunk_size() => {
                    self.put_stream(ctx, &host, r, digest, reader, length).await
                }
                (digest, _) => {
                    // a one-shot reader cannot seek, so a body missing its
                    // digest or length spools to disk before the session opens
                    let algorithm = digest
                        .as_ref()
                        .map(|d| d.algorithm())
                        .unwrap_or(Algorithm::Sha256);
                    let (spool, computed, length) =
                        self.spool_to_disk(ctx, reader, algorithm).await?;
                    if let Some(expected) = digest {
                        if expected != computed {
                            return Err(Error::digest_mismatch(&expected, &computed));
                        }
                    }

                    if length <= host.blob_chunk_size() {
                        // one chunk of memory at most, replay from the spool
                        // through the monolithic path
                        let mut file = tokio::fs::File::from_std(spool.reopen()?);
                        let mut buf = Vec::with_capacity(length as usize);
                        ctx.run(file.read_to_end(&mut buf)).await??;
                        self.put_bytes(ctx, &host, r, Some(computed), Bytes::from(buf))
                            .await
                    } else {
                        let file = tokio::fs::File::from_std(spool.reopen()?);
                        self.put_stream(ctx, &host, r, computed, Box::new(file), length)
                            .await
                    }
                }
            },
        }
    }

    async fn manifest_head(&self, ctx: &Context, r: &Reference) -> Result<Manifest, Error> {
        let host = self.host_for(r)?;
        let response = self
            .engine
            .do_request(
                ctx,
                self.spec(
                    Method::HEAD,
                    &host,
                    format!("/v2/{}/manifests/{}", r.repository(), r.tag_or_digest()?),
                )
                .with_scope(Self::pull_scope(r))
                .with_header("Accept", ACCEPT_MANIFESTS.join(", ")),
            )
            .await?;

        let media_type = response
            .header("Content-Type")
            .map(str::to_string)
            .unwrap_or_default();
        let digest = response
            .header("Docker-Content-Digest")
            .ok_or_else(|| Error::parse_failure("manifest head without a digest header"))
            .and_then(Digest::parse)?;
        Ok(Manifest::from_head(media_type, digest))
    }

    async fn manifest_get(&self, ctx: &Context, r: &Reference) -> Result<Manifest, Error> {
        let host = self.host_for(r)?;
        let mut spec = self
            .spec(
                Method::GET,
                &host,
                format!("/v2/{}/manifests/{}", r.repository(), r.tag_or_digest()?),
            )
            .with_scope(Self::pull_scope(r))
            .with_header("Accept", ACCEPT_MANIFESTS.join(", "));
        if !r.digest().is_empty() {
            spec = spec.with_expect_digest(Digest::parse(r.digest())?);
        }

        let response = self.engine.do_request(ctx, spec).await?;
        let media_type = response
            .header("Content-Type")
            .map(str::to_string)
            .unwrap_or_default();
        let header_digest = response.header("Docker-Content-Digest").map(str::to_string);
        let body = response.read_to_end().await?;

        let manifest = Manifest::from_bytes(media_type, body)?;
        if let Some(header) = header_digest {
            if header != manifest.digest().to_string() {
                // a manifest digest disagreement is not survivable, the tag
                // cannot be trusted to name what was served
                return Err(Error::digest_mismatch(header, manifest.digest()));
            }
        }
        Ok(manifest)
    }

    async fn manifest_put(
        &self,
        ctx: &Context,
        r: &Reference,
        manifest: &Manifest,
    ) -> Result<(), Error> {
        let host = self.host_for(r)?;
        if r.tag().is_empty() && r.digest().is_empty() {
            return Err(Error::new(ErrorKind::MissingTag));
        }
        let body = manifest.to_bytes()?;

        let response = self
            .engine
            .do_request(
                ctx,
                self.spec(
                    Method::PUT,
                    &host,
                    format!("/v2/{}/manifests/{}", r.repository(), r.tag_or_digest()?),
                )
                .with_scope(Self::push_scope(r))
                .with_header("Content-Type", manifest.media_type())
                .with_body(body),
            )
            .await?;
        event!(
            Level::DEBUG,
            "Manifest put for {r} answered {}",
            response.status()
        );
        Ok(())
    }

    async fn manifest_delete(&self, ctx: &Context, r: &Reference) -> Result<(), Error> {
        let host = self.host_for(r)?;
        if r.digest().is_empty() {
            return Err(Error::new(ErrorKind::MissingDigest));
        }

        let response = self
            .engine
            .do_request(
                ctx,
                self.spec(
                    Method::DELETE,
                    &host,
                    format!("/v2/{}/manifests/{}", r.repository(), r.digest()),
                )
                .with_scope(Self::push_scope(r))
                .with_header("Accept", ACCEPT_MANIFESTS.join(", ")),
            )
            .await?;
        expect_status(&response, StatusCode::ACCEPTED)
    }

    async fn tag_list(&self, ctx: &Context, r: &Reference) -> Result<Vec<String>, Error> {
        let host = self.host_for(r)?;
        let mut path = format!("/v2/{}/tags/list", r.repository());
        let mut tags = vec![];

        loop {
            ctx.err()?;
            let response = self
                .engine
                .do_request(
                    ctx,
                    self.spec(Method::GET, &host, path.clone())
                        .with_scope(Self::pull_scope(r)),
                )
                .await?;
            let next = next_link(&response);
            let body = response.read_to_end().await?;
            let mut page: TagList = serde_json::from_slice(&body)?;
            tags.append(&mut page.tags);

            match next {
                Some(next) => path = next,
                None => break,
            }
        }
        Ok(tags)
    }
}

#[derive(serde::Deserialize)]
struct TagList {
    #[serde(default)]
    #[allow(dead_code)]
    name: String,
    #[serde(default)]
    tags: Vec<String>,
}

fn content_length(response: &Response) -> Option<u64> {
    response
        .header("Content-Length")
        .and_then(|v| v.parse::<u64>().ok())
}

fn expect_status(response: &Response, expected: StatusCode) -> Result<(), Error> {
    if response.status() != expected {
        debug!(
            "Expected status {expected}, received {}, continuing since the exchange succeeded",
            response.status()
        );
    }
    Ok(())
}

/// Returns the next session location a response handed back,
///
fn next_location(current: &str, response: &Response) -> Result<String, Error> {
    let location = response
        .header("Location")
        .ok_or_else(|| Error::parse_failure("upload response without a location header"))?;
    Ok(resolve_location(current, location))
}

/// Resolves a location header against the path of the request it answered,
///
fn resolve_location(base: &str, location: &str) -> String {
    if location.contains("://") || location.starts_with('/') {
        location.to_string()
    } else {
        // relative location, resolve against the base path's directory
        let base_path = base.split('?').next().unwrap_or(base);
        match base_path.rfind('/') {
            Some(idx) => format!("{}/{}", &base_path[..idx], location),
            None => format!("/{location}"),
        }
    }
}

/// Parses the next page path out of a Link header,
///
fn next_link(response: &Response) -> Option<String> {
    let link = response.header("Link")?;
    let next = link.split(',').find(|part| part.contains(r#"rel="next""#))?;
    let start = next.find('<')? + 1;
    let end = next.find('>')?;
    Some(next[start..end].to_string())
}
