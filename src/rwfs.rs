use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;

/// Readable file handle paired with its length,
///
pub type FileRead = (Box<dyn AsyncRead + Send + Unpin>, u64);

/// Writable file handle, callers must shut it down to commit,
///
pub type FileWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Metadata returned by stat,
///
#[derive(Debug, Clone, Copy)]
pub struct FileInfo {
    pub size: u64,
}

/// Filesystem seam the layout scheme reads and mutates files through,
///
/// The default is the host filesystem; tests substitute an in-memory tree.
///
#[async_trait]
pub trait RwFs: Send + Sync {
    /// Opens a file for streaming read,
    ///
    async fn open(&self, path: &Path) -> Result<FileRead, Error>;

    /// Creates or truncates a file for write,
    ///
    async fn create(&self, path: &Path) -> Result<FileWrite, Error>;

    /// Atomically replaces `to` with `from`,
    ///
    async fn rename(&self, from: &Path, to: &Path) -> Result<(), Error>;

    /// Removes a file,
    ///
    async fn remove(&self, path: &Path) -> Result<(), Error>;

    /// Returns metadata for a path,
    ///
    async fn stat(&self, path: &Path) -> Result<FileInfo, Error>;

    /// Creates a directory and its parents,
    ///
    async fn create_dir_all(&self, path: &Path) -> Result<(), Error>;

    /// Lists the entries directly under a directory,
    ///
    async fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>, Error>;
}

/// Reads a whole file into memory,
///
pub async fn read_file(fs: &dyn RwFs, path: &Path) -> Result<Vec<u8>, Error> {
    let (mut reader, size) = fs.open(path).await?;
    let mut buf = Vec::with_capacity(size as usize);
    reader.read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Writes a whole file and commits it,
///
pub async fn write_file(fs: &dyn RwFs, path: &Path, data: &[u8]) -> Result<(), Error> {
    let mut writer = fs.create(path).await?;
    writer.write_all(data).await?;
    writer.shutdown().await?;
    Ok(())
}

fn map_io(err: std::io::Error, path: &Path) -> Error {
    if err.kind() == std::io::ErrorKind::NotFound {
        Error::not_found(path.display().to_string()).with_source(err)
    } else {
        Error::from(err)
    }
}

/// Host filesystem backend,
///
#[derive(Debug, Default, Clone)]
pub struct OsFs;

#[async_trait]
impl RwFs for OsFs {
    async fn open(&self, path: &Path) -> Result<FileRead, Error> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| map_io(e, path))?;
        let size = file.metadata().await.map_err(|e| map_io(e, path))?.len();
        Ok((Box::new(file), size))
    }

    async fn create(&self, path: &Path) -> Result<FileWrite, Error> {
        let file = tokio::fs::File::create(path)
            .await
            .map_err(|e| map_io(e, path))?;
        Ok(Box::new(file))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), Error> {
        tokio::fs::rename(from, to)
            .await
            .map_err(|e| map_io(e, from))
    }

    async fn remove(&self, path: &Path) -> Result<(), Error> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| map_io(e, path))
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo, Error> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| map_io(e, path))?;
        Ok(FileInfo { size: meta.len() })
    }

    async fn create_dir_all(&self, path: &Path) -> Result<(), Error> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| map_io(e, path))
    }

    async fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>, Error> {
        let mut dir = tokio::fs::read_dir(path)
            .await
            .map_err(|e| map_io(e, path))?;
        let mut entries = vec![];
        while let Some(entry) = dir.next_entry().await.map_err(|e| map_io(e, path))? {
            entries.push(entry.path());
        }
        Ok(entries)
    }
}

type MemTree = Arc<Mutex<BTreeMap<PathBuf, Vec<u8>>>>;

/// In-memory filesystem backend for tests and sandboxed use,
///
#[derive(Debug, Default, Clone)]
pub struct MemFs {
    tree: MemTree,
}

impl MemFs {
    /// Returns an empty tree,
    ///
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the paths currently stored, for assertions,
    ///
    pub fn paths(&self) -> Vec<PathBuf> {
        self.tree.lock().expect("mem tree poisoned").keys().cloned().collect()
    }
}

#[async_trait]
impl RwFs for MemFs {
    async fn open(&self, path: &Path) -> Result<FileRead, Error> {
        let tree = self.tree.lock().expect("mem tree poisoned");
        let data = tree
            .get(path)
            .cloned()
            .ok_or_else(|| Error::not_found(path.display().to_string()))?;
        let size = data.len() as u64;
        Ok((Box::new(Cursor::new(data)), size))
    }

    async fn create(&self, path: &Path) -> Result<FileWrite, Error> {
        Ok(Box::new(MemFile {
            path: path.to_path_buf(),
            buf: Vec::new(),
            tree: self.tree.clone(),
        }))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), Error> {
        let mut tree = self.tree.lock().expect("mem tree poisoned");
        let data = tree
            .remove(from)
            .ok_or_else(|| Error::not_found(from.display().to_string()))?;
        tree.insert(to.to_path_buf(), data);
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<(), Error> {
        let mut tree = self.tree.lock().expect("mem tree poisoned");
        tree.remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(path.display().to_string()))
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo, Error> {
        let tree = self.tree.lock().expect("mem tree poisoned");
        tree.get(path)
            .map(|data| FileInfo {
                size: data.len() as u64,
            })
            .ok_or_else(|| Error::not_found(path.display().to_string()))
    }

    async fn create_dir_all(&self, _path: &Path) -> Result<(), Error> {
        // directories exist implicitly in the map
        Ok(())
    }

    async fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>, Error> {
        let tree = self.tree.lock().expect("mem tree poisoned");
        let mut entries = vec![];
        for stored in tree.keys() {
            if let Ok(rest) = stored.strip_prefix(path) {
                if let Some(first) = rest.components().next() {
                    let entry = path.join(first);
                    if !entries.contains(&entry) {
                        entries.push(entry);
                    }
                }
            }
        }
        Ok(entries)
    }
}

/// Pending in-memory write, committed to the tree on shutdown,
///
struct MemFile {
    path: PathBuf,
    buf: Vec<u8>,
    tree: MemTree,
}

impl AsyncWrite for MemFile {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        self.buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _cx: &mut TaskContext<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        _cx: &mut TaskContext<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        let data = std::mem::take(&mut self.buf);
        self.tree
            .lock()
            .expect("mem tree poisoned")
            .insert(self.path.clone(), data);
        Poll::Ready(Ok(()))
    }
}
