use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::content::{
    Descriptor, ImageIndex, Manifest, DOCKER2_MANIFEST, DOCKER2_MANIFEST_LIST, OCI1_MANIFEST,
    OCI1_MANIFEST_LIST,
};
use crate::context::Context;
use crate::digest::{Algorithm, Digest, Digester};
use crate::error::{Error, ErrorKind};
use crate::reference::Reference;
use crate::rwfs::{read_file, write_file, RwFs};
use crate::scheme::{BlobReader, BlobSource, Scheme, FILE_CHUNK_SIZE};

const IMAGE_LAYOUT_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";
const LAYOUT_VERSION: &str = "1.0.0";

/// Contents of the oci-layout marker file,
///
#[derive(Serialize, Deserialize)]
struct ImageLayout {
    #[serde(rename = "imageLayoutVersion")]
    version: String,
}

/// Scheme implementation over an OCI image layout directory,
///
/// Blobs live under `blobs/<algo>/<hex>`, written through a temp file and an
/// atomic rename; tags live in `index.json` under the ref name annotation.
/// Index reads and writes serialize through a per-layout mutex; writers in
/// other processes require an external lock.
///
pub struct OciDirScheme {
    fs: Arc<dyn RwFs>,
    index_locks: std::sync::Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    mod_refs: std::sync::Mutex<HashMap<String, Reference>>,
}

impl OciDirScheme {
    /// Returns a new layout scheme over the filesystem,
    ///
    pub fn new(fs: Arc<dyn RwFs>) -> Self {
        OciDirScheme {
            fs,
            index_locks: std::sync::Mutex::new(HashMap::new()),
            mod_refs: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Returns the references mutated since this scheme was opened,
    ///
    /// The garbage collection sweep uses this set to decide its targets.
    ///
    pub fn modified_refs(&self) -> Vec<Reference> {
        self.mod_refs
            .lock()
            .expect("modified refs poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn ref_mod(&self, r: &Reference) {
        self.mod_refs
            .lock()
            .expect("modified refs poisoned")
            .insert(r.path().to_string(), r.clone());
    }

    fn index_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.index_locks.lock().expect("index locks poisoned");
        locks.entry(path.to_path_buf()).or_default().clone()
    }

    fn blob_path(root: &Path, digest: &Digest) -> PathBuf {
        root.join("blobs")
            .join(digest.algorithm().as_str())
            .join(digest.hex())
    }

    /// Checks for the oci-layout marker and its version,
    ///
    async fn valid(&self, root: &Path) -> Result<(), Error> {
        let marker = root.join(IMAGE_LAYOUT_FILE);
        let bytes = read_file(self.fs.as_ref(), &marker)
            .await
            .map_err(|e| {
                Error::invalid_layout(format!("{} cannot be read", marker.display())).with_source(e)
            })?;
        let layout: ImageLayout = serde_json::from_slice(&bytes).map_err(|e| {
            Error::invalid_layout(format!("{} cannot be parsed", marker.display())).with_source(e)
        })?;
        if layout.version != LAYOUT_VERSION {
            return Err(Error::invalid_layout(format!(
                "unsupported oci layout version, expected {LAYOUT_VERSION}, received {}",
                layout.version
            )));
        }
        Ok(())
    }

    async fn read_index(&self, root: &Path) -> Result<ImageIndex, Error> {
        self.valid(root).await?;
        let index_file = root.join(INDEX_FILE);
        let bytes = read_file(self.fs.as_ref(), &index_file).await.map_err(|e| {
            Error::invalid_layout(format!("{} cannot be read", index_file.display())).with_source(e)
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            Error::invalid_layout(format!("{} cannot be parsed", index_file.display()))
                .with_source(e)
        })
    }

    /// Replaces index.json through a temp file rename, refreshing the layout marker,
    ///
    async fn write_index(&self, root: &Path, index: &ImageIndex) -> Result<(), Error> {
        let layout = serde_json::to_vec(&ImageLayout {
            version: LAYOUT_VERSION.to_string(),
        })?;
        write_file(self.fs.as_ref(), &root.join(IMAGE_LAYOUT_FILE), &layout).await?;

        let bytes = serde_json::to_vec(index)?;
        let tmp = root.join(format!("{INDEX_FILE}.tmp-{}", Uuid::new_v4()));
        write_file(self.fs.as_ref(), &tmp, &bytes).await?;
        self.fs.rename(&tmp, &root.join(INDEX_FILE)).await
    }

    /// Creates the layout skeleton on first write,
    ///
    async fn init_layout(&self, root: &Path) -> Result<(), Error> {
        self.fs.create_dir_all(&root.join("blobs")).await?;
        if self.valid(root).await.is_err() {
            debug!("Initializing oci layout at {}", root.display());
            self.write_index(root, &ImageIndex::new()).await?;
        }
        Ok(())
    }

    /// Removes blob files no manifest reachable from the index references,
    ///
    /// Walks the index into stored manifests, descending through lists, then
    /// sweeps `blobs/`. Returns the number of files removed.
    ///
    pub async fn gc(&self, ctx: &Context, r: &Reference) -> Result<usize, Error> {
        let root = PathBuf::from(r.path());
        let lock = self.index_lock(&root);
        let _guard = lock.lock().await;

        let index = self.read_index(&root).await?;
        let mut referenced: HashSet<String> = HashSet::new();
        let mut walk: Vec<Descriptor> = index.manifests.clone();

        while let Some(descriptor) = walk.pop() {
            ctx.err()?;
            if !referenced.insert(descriptor.digest.clone()) {
                continue;
            }
            let is_manifest = matches!(
                descriptor.media_type.as_str(),
                DOCKER2_MANIFEST | DOCKER2_MANIFEST_LIST | OCI1_MANIFEST | OCI1_MANIFEST_LIST
            );
            if !is_manifest {
                continue;
            }
            let digest = match Digest::parse(&descriptor.digest) {
                Ok(digest) => digest,
                Err(_) => {
                    warn!("Skipping unparseable digest {} in gc walk", descriptor.digest);
                    continue;
                }
            };
            let bytes = match read_file(self.fs.as_ref(), &Self::blob_path(&root, &digest)).await {
                Ok(bytes) => bytes,
                Err(_) => {
                    warn!("Referenced manifest {digest} is missing, skipping descent");
                    continue;
                }
            };
            match Manifest::from_bytes(descriptor.media_type.as_str(), bytes) {
                Ok(manifest) if manifest.is_list() => {
                    walk.extend(manifest.manifests()?.iter().cloned());
                }
                Ok(manifest) => {
                    walk.push(manifest.config()?.clone());
                    walk.extend(manifest.layers()?.iter().cloned());
                }
                Err(err) => {
                    warn!("Referenced manifest {digest} cannot be parsed, {err}");
                }
            }
        }

        let mut removed = 0usize;
        let blobs = root.join("blobs");
        for algo_dir in self.fs.read_dir(&blobs).await.unwrap_or_default() {
            let algo = match algo_dir
                .file_name()
                .and_then(|n| n.to_str())
                .map(Algorithm::from_str)
            {
                Some(Ok(algo)) => algo,
                _ => continue,
            };
            for file in self.fs.read_dir(&algo_dir).await.unwrap_or_default() {
                ctx.err()?;
                let hex = match file.file_name().and_then(|n| n.to_str()) {
                    Some(hex) if !hex.contains(".tmp-") => hex,
                    _ => continue,
                };
                let digest = format!("{}:{hex}", algo.as_str());
                if !referenced.contains(&digest) {
                    debug!("Sweeping unreferenced blob {digest}");
                    self.fs.remove(&file).await?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// Resolves a reference to its descriptor within an index,
///
/// A digest wins over a tag; with neither, the tag `latest` is assumed.
///
pub(crate) fn index_get(index: &ImageIndex, r: &Reference) -> Result<Descriptor, Error> {
    let digest = r.digest();
    if !digest.is_empty() {
        return index
            .manifests
            .iter()
            .find(|entry| entry.digest == digest)
            .cloned()
            .ok_or_else(|| Error::not_found(digest));
    }

    let tag = if r.tag().is_empty() {
        crate::reference::DEFAULT_TAG
    } else {
        r.tag()
    };
    index
        .manifests
        .iter()
        .find(|entry| entry.ref_name() == Some(tag))
        .cloned()
        .ok_or_else(|| Error::not_found(tag))
}

/// Inserts or replaces a descriptor in an index,
///
/// With a tagged reference, rows carrying the same tag annotation are the
/// same entry, and rows carrying no annotation collapse by digest equality.
/// An untagged reference matches purely by digest, so it overwrites whatever
/// row holds that digest, tag annotation and all. Replacing also drops any
/// later duplicate rows, so a tag names at most one descriptor.
///
pub(crate) fn index_set(index: &mut ImageIndex, r: &Reference, mut descriptor: Descriptor) {
    let tag = r.tag().to_string();
    if !tag.is_empty() {
        descriptor.set_ref_name(tag.as_str());
    }

    let digest = descriptor.digest.clone();
    let same = move |entry: &Descriptor| -> bool {
        let name = if tag.is_empty() { None } else { entry.ref_name() };
        match name {
            Some(name) => name == tag,
            None => entry.digest == digest,
        }
    };

    let pos = index.manifests.iter().position(|entry| same(entry));
    match pos {
        Some(pos) => {
            index.manifests[pos] = descriptor;
            // the replaced entry may have had duplicates further down
            for i in (pos + 1..index.manifests.len()).rev() {
                if same(&index.manifests[i]) {
                    index.manifests.remove(i);
                }
            }
        }
        None => index.manifests.push(descriptor),
    }
}

#[async_trait]
impl Scheme for OciDirScheme {
    async fn blob_head(
        &self,
        _ctx: &Context,
        r: &Reference,
        digest: &Digest,
    ) -> Result<u64, Error> {
        let root = PathBuf::from(r.path());
        self.valid(&root).await?;
        let info = self.fs.stat(&Self::blob_path(&root, digest)).await?;
        Ok(info.size)
    }

    async fn blob_get(
        &self,
        ctx: &Context,
        r: &Reference,
        digest: &Digest,
    ) -> Result<BlobReader, Error> {
        let root = PathBuf::from(r.path());
        self.valid(&root).await?;
        let (reader, size) = self.fs.open(&Self::blob_path(&root, digest)).await?;
        Ok(BlobReader::from_file(
            ctx.clone(),
            reader,
            Some(digest.clone()),
            size,
        ))
    }

    async fn blob_put(
        &self,
        ctx: &Context,
        r: &Reference,
        digest: Option<Digest>,
        source: BlobSource,
    ) -> Result<(Digest, u64), Error> {
        let root = PathBuf::from(r.path());
        self.init_layout(&root).await?;

        let algorithm = digest
            .as_ref()
            .map(|d| d.algorithm())
            .unwrap_or(Algorithm::Sha256);
        let tmp = root.join("blobs").join(format!(".tmp-{}", Uuid::new_v4()));
        let mut writer = self.fs.create(&tmp).await?;
        let mut digester = Digester::new(algorithm);
        let mut written = 0u64;

        let outcome: Result<(), Error> = async {
            match source {
                BlobSource::Bytes(bytes) => {
                    ctx.err()?;
                    digester.update(&bytes);
                    written = bytes.len() as u64;
                    writer.write_all(&bytes).await?;
                }
                BlobSource::Reader { mut reader, .. } => loop {
                    ctx.err()?;
                    let mut buf = vec![0u8; FILE_CHUNK_SIZE];
                    let n = ctx.run(tokio::io::AsyncReadExt::read(&mut reader, &mut buf)).await??;
                    if n == 0 {
                        break;
                    }
                    buf.truncate(n);
                    digester.update(&buf);
                    written += n as u64;
                    writer.write_all(&buf).await?;
                },
            }
            writer.shutdown().await?;
            Ok(())
        }
        .await;

        if let Err(err) = outcome {
            // canceled or failed mid-write, drop the partial temp file
            let _ = self.fs.remove(&tmp).await;
            return Err(err);
        }

        let computed = digester.finalize();
        if let Some(expected) = digest {
            if expected != computed {
                let _ = self.fs.remove(&tmp).await;
                return Err(Error::digest_mismatch(&expected, &computed));
            }
        }

        let target = Self::blob_path(&root, &computed);
        self.fs
            .create_dir_all(target.parent().expect("blob paths always have a parent"))
            .await?;
        // concurrent writers of one digest both land a coherent file, last
        // rename wins
        self.fs.rename(&tmp, &target).await?;
        Ok((computed, written))
    }

    async fn manifest_head(&self, _ctx: &Context, r: &Reference) -> Result<Manifest, Error> {
        let root = PathBuf::from(r.path());
        let index = self.read_index(&root).await?;
        let descriptor = index_get(&index, r)?;
        let digest = Digest::parse(&descriptor.digest)
            .map_err(|e| Error::invalid_layout("index entry with unparseable digest").with_source(e))?;
        Ok(Manifest::from_head(descriptor.media_type, digest))
    }

    async fn manifest_get(&self, ctx: &Context, r: &Reference) -> Result<Manifest, Error> {
        let root = PathBuf::from(r.path());
        let index = self.read_index(&root).await?;
        let descriptor = index_get(&index, r)?;
        let digest = Digest::parse(&descriptor.digest)
            .map_err(|e| Error::invalid_layout("index entry with unparseable digest").with_source(e))?;

        let body = self.blob_get(ctx, r, &digest).await?.read_to_end().await?;
        Manifest::from_bytes(descriptor.media_type, body)
    }

    async fn manifest_put(
        &self,
        ctx: &Context,
        r: &Reference,
        manifest: &Manifest,
    ) -> Result<(), Error> {
        let root = PathBuf::from(r.path());
        let body = manifest.to_bytes()?;
        self.blob_put(
            ctx,
            r,
            Some(manifest.digest().clone()),
            BlobSource::from_bytes(body),
        )
        .await?;

        let lock = self.index_lock(&root);
        let _guard = lock.lock().await;
        let mut index = self.read_index(&root).await?;
        index_set(&mut index, r, manifest.descriptor());
        self.write_index(&root, &index).await?;
        self.ref_mod(r);
        Ok(())
    }

    async fn manifest_delete(&self, _ctx: &Context, r: &Reference) -> Result<(), Error> {
        let root = PathBuf::from(r.path());
        if r.tag().is_empty() && r.digest().is_empty() {
            return Err(Error::new(ErrorKind::MissingTagOrDigest));
        }

        let lock = self.index_lock(&root);
        let _guard = lock.lock().await;
        let mut index = self.read_index(&root).await?;
        let target = index_get(&index, r)?;
        index.manifests.retain(|entry| entry != &target);
        // the blob stays behind for the garbage collection sweep
        self.write_index(&root, &index).await?;
        self.ref_mod(r);
        Ok(())
    }

    async fn tag_list(&self, _ctx: &Context, r: &Reference) -> Result<Vec<String>, Error> {
        let root = PathBuf::from(r.path());
        let index = self.read_index(&root).await?;
        let mut tags: Vec<String> = index
            .manifests
            .iter()
            .filter_map(|entry| entry.ref_name().map(str::to_string))
            .collect();
        tags.sort();
        tags.dedup();
        Ok(tags)
    }
}
